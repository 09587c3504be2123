// src/sys/ssl.rs

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as tokio_fs;
use tracing::{info, warn};

use crate::config::ValetConfig;
use crate::error::{ValetError, ValetResult};
use crate::sys::files::Filesystem;
use crate::sys::proxy::{SiteConfigEngine, validate_domain_format};
use crate::sys::traits::{CommandRunner, Invocation};
use crate::sys::trust::{CA_NICKNAME, TrustReport, TrustStoreSync};

const CA_NAME: &str = "ValetCASelfSigned";
const CA_SUBJECT: &str =
    "/C=/ST=/O=/localityName=/commonName=ValetCASelfSigned/organizationalUnitName=Developers/emailAddress=rootcertificate@valet.local/";
const CA_DAYS: &str = "730";
const CERT_DAYS: &str = "365";
const ARTIFACT_EXTENSIONS: [&str; 4] = ["conf", "key", "csr", "crt"];

// ==============================================================================
// Local Certificate Authority
// ==============================================================================

/// Owns the root CA under `<home>/CA` and the per-host leaf certificates under
/// `<home>/Certificates`. Every issued or revoked host is mirrored into the
/// trust stores through `TrustStoreSync`.
pub struct CertificateAuthority {
    config: ValetConfig,
    files: Filesystem,
    runner: Arc<dyn CommandRunner>,
    engine: SiteConfigEngine,
    trust: TrustStoreSync,
}

impl CertificateAuthority {
    pub fn new(
        config: ValetConfig,
        files: Filesystem,
        runner: Arc<dyn CommandRunner>,
        trust: TrustStoreSync,
    ) -> Self {
        let engine = SiteConfigEngine::new(&config);
        Self {
            config,
            files,
            runner,
            engine,
            trust,
        }
    }

    fn ca_file(&self, ext: &str) -> PathBuf {
        self.config.ca_path().join(format!("{}.{}", CA_NAME, ext))
    }

    /// Guarantees a usable root CA. A half-present pair is discarded and
    /// regenerated; returns whether a new CA was minted.
    pub async fn ensure_root_ca(&self) -> ValetResult<bool> {
        let key = self.ca_file("key");
        let pem = self.ca_file("pem");
        if self.files.exists(&key).await && self.files.exists(&pem).await {
            return Ok(false);
        }

        for stale in [&key, &pem, &self.ca_file("srl")] {
            self.files.remove(stale).await?;
        }
        self.files.ensure_dir_as_user(&self.config.ca_path()).await?;

        let (key_arg, pem_arg) = (key.display().to_string(), pem.display().to_string());
        self.openssl(
            "root CA",
            Invocation::new("openssl").args([
                "req", "-new", "-newkey", "rsa:2048", "-days", CA_DAYS, "-nodes", "-x509",
                "-subj", CA_SUBJECT, "-keyout", &key_arg, "-out", &pem_arg,
            ]),
        )
        .await?;

        if !(self.files.exists(&key).await && self.files.exists(&pem).await) {
            return Err(ValetError::CertificateAuthority(
                "openssl reported success but the root CA files are missing".into(),
            ));
        }
        restrict_private_key(&key).await?;
        info!("🔐 Generated root CA at {}", pem.display());

        self.trust.install_root(&pem).await?;
        Ok(true)
    }

    /// Re-installs the existing root CA into every trust store.
    pub async fn trust_root(&self) -> ValetResult<TrustReport> {
        self.trust.install_root(&self.ca_file("pem")).await
    }

    /// Trusts the root CA again if the system store lost it, e.g. after an
    /// earlier trust step failed once the CA files were already written.
    pub async fn ensure_root_trusted(&self) -> ValetResult<()> {
        if self.trust.is_trusted(CA_NICKNAME).await {
            return Ok(());
        }
        warn!("Root CA is not trusted yet, installing it");
        self.trust_root().await.map(|_| ())
    }

    /// Issues a leaf certificate for `host` signed by the root CA and trusts it.
    pub async fn issue_certificate(&self, host: &str) -> ValetResult<TrustReport> {
        validate_domain_format(host)?;
        self.files
            .ensure_dir_as_user(&self.config.certificates_path())
            .await?;

        let conf = self.config.certificate_file(host, "conf");
        let key = self.config.certificate_file(host, "key");
        let csr = self.config.certificate_file(host, "csr");
        let crt = self.config.certificate_file(host, "crt");
        let [conf_arg, key_arg, csr_arg, crt_arg] =
            [&conf, &key, &csr, &crt].map(|p| p.display().to_string());

        self.files
            .write_as_user(&conf, &self.engine.build_certificate_conf(host))
            .await?;

        self.openssl(
            "private key",
            Invocation::new("openssl").args(["genrsa", "-out", &key_arg, "2048"]),
        )
        .await?;
        restrict_private_key(&key).await?;

        let subject = format!(
            "/C=/ST=/O=/localityName=/commonName={}/organizationalUnitName=/emailAddress=/",
            host
        );
        self.openssl(
            "signing request",
            Invocation::new("openssl").args([
                "req", "-new", "-key", &key_arg, "-out", &csr_arg, "-subj", &subject, "-config",
                &conf_arg, "-passin", "pass:",
            ]),
        )
        .await?;

        let ca_pem = self.ca_file("pem").display().to_string();
        let ca_key = self.ca_file("key").display().to_string();
        let serial = self.ca_file("srl");
        let mut sign = Invocation::new("openssl").args([
            "x509", "-req", "-sha256", "-days", CERT_DAYS, "-CA", &ca_pem, "-CAkey", &ca_key,
        ]);
        // The first signature creates the serial file; later ones continue it.
        sign = if self.files.exists(&serial).await {
            sign.args(["-CAserial".to_string(), serial.display().to_string()])
        } else {
            sign.arg("-CAcreateserial")
        };
        sign = sign.args([
            "-in", &csr_arg, "-out", &crt_arg, "-extensions", "v3_req", "-extfile", &conf_arg,
        ]);
        self.openssl("certificate", sign).await?;

        for artifact in [&conf, &key, &csr, &crt] {
            if !self.files.exists(artifact).await {
                return Err(ValetError::CertificateAuthority(format!(
                    "certificate artifact {} was not produced",
                    artifact.display()
                )));
            }
        }

        info!("🔐 Issued certificate for {}", host);
        self.trust.install(host, &crt).await
    }

    /// Removes everything tied to `host`: its nginx config, its four certificate
    /// artifacts and its trust entries. Leftovers of an interrupted issuance are
    /// swept too; a host without any artifact is a no-op.
    pub async fn revoke_certificate(&self, host: &str) -> ValetResult<Option<TrustReport>> {
        validate_domain_format(host)?;
        let mut issued = false;
        for ext in ARTIFACT_EXTENSIONS {
            issued |= self.files.exists(&self.config.certificate_file(host, ext)).await;
        }
        if !issued {
            return Ok(None);
        }

        self.files.remove(&self.config.nginx_file(host)).await?;
        for ext in ARTIFACT_EXTENSIONS {
            self.files
                .remove(&self.config.certificate_file(host, ext))
                .await?;
        }

        let report = self.trust.remove(host).await;
        info!("🔓 Revoked certificate for {}", host);
        Ok(Some(report))
    }

    /// Hosts with at least one certificate artifact on disk.
    pub async fn list_secured_hostnames(&self) -> ValetResult<BTreeSet<String>> {
        let names = self.files.list_dir(&self.config.certificates_path()).await?;
        Ok(names
            .iter()
            .filter_map(|name| {
                let (host, ext) = name.rsplit_once('.')?;
                ARTIFACT_EXTENSIONS.contains(&ext).then(|| host.to_string())
            })
            .collect())
    }

    /// Moves every certificate from the `old` suffix to the `new` one. All
    /// revocations complete before the first issuance. Returns `(old, new)` pairs.
    pub async fn rebind_domain(&self, old: &str, new: &str) -> ValetResult<Vec<(String, String)>> {
        let old_suffix = format!(".{}", old);
        let pairs: Vec<(String, String)> = self
            .list_secured_hostnames()
            .await?
            .into_iter()
            .filter_map(|host| {
                let name = host.strip_suffix(&old_suffix)?.to_string();
                Some((host, format!("{}.{}", name, new)))
            })
            .collect();

        if pairs.is_empty() {
            return Ok(pairs);
        }

        for (old_host, _) in &pairs {
            self.revoke_certificate(old_host).await?;
        }

        self.ensure_root_ca().await?;
        for (_, new_host) in &pairs {
            let report = self.issue_certificate(new_host).await?;
            if !report.is_clean() {
                warn!("{} was issued but not every browser trusts it", new_host);
            }
        }

        info!("🔁 Rebound {} certificate(s) from .{} to .{}", pairs.len(), old, new);
        Ok(pairs)
    }

    /// Expiry of the certificate issued for `host`, if one exists.
    pub async fn certificate_expiry(&self, host: &str) -> ValetResult<Option<DateTime<Utc>>> {
        let crt = self.config.certificate_file(host, "crt");
        if !self.files.exists(&crt).await {
            return Ok(None);
        }
        let crt_arg = crt.display().to_string();
        let out = self
            .runner
            .run_as_user(&Invocation::new("openssl").args([
                "x509", "-enddate", "-noout", "-in", &crt_arg,
            ]))
            .await?;
        parse_enddate(&out.stdout).map(Some)
    }

    async fn openssl(&self, what: &str, invocation: Invocation) -> ValetResult<()> {
        self.runner
            .run_as_user(&invocation)
            .await
            .map(|_| ())
            .map_err(|e| ValetError::CertificateAuthority(format!("failed to create {}: {}", what, e)))
    }
}

/// Keys are readable by their owner only.
async fn restrict_private_key(path: &Path) -> ValetResult<()> {
    let mut perms = tokio_fs::metadata(path)
        .await
        .map_err(|e| ValetError::io(path, e))?
        .permissions();
    perms.set_mode(0o600);
    tokio_fs::set_permissions(path, perms)
        .await
        .map_err(|e| ValetError::io(path, e))
}

/// Parses `notAfter=Jan  1 00:00:00 2027 GMT` as printed by `openssl x509 -enddate`.
fn parse_enddate(output: &str) -> ValetResult<DateTime<Utc>> {
    let raw = output
        .trim()
        .strip_prefix("notAfter=")
        .ok_or_else(|| ValetError::CertificateAuthority(format!("unexpected enddate: {}", output)))?;
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalized, "%b %d %H:%M:%S %Y GMT")
        .map(|naive| naive.and_utc())
        .map_err(|e| ValetError::CertificateAuthority(format!("unparseable enddate '{}': {}", raw, e)))
}
