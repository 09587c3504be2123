// src/sys/sites.rs

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ConfigStore, DomainConfig, ValetConfig};
use crate::error::{ValetError, ValetResult};
use crate::sys::files::Filesystem;
use crate::sys::php::PhpVersion;
use crate::sys::proxy::{
    SiteConf, SiteConfigEngine, parse_proxy_target, stub_name, validate_domain_format,
    validate_proxy_target,
};
use crate::sys::ssl::CertificateAuthority;
use crate::sys::trust::TrustReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub host: String,
    pub path: PathBuf,
    pub linked: bool,
    pub secured: bool,
    pub proxy_target: Option<String>,
    pub isolated_version: Option<PhpVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub host: String,
    pub target: String,
    pub secured: bool,
}

/// What a secured host looked like before its certificate was moved, so the
/// rewritten config keeps its proxy target and PHP binding.
struct Rebinding {
    old_host: String,
    new_host: String,
    proxy_conf: Option<String>,
    isolated: Option<PhpVersion>,
}

/// Per-host nginx configs under `<home>/Nginx` plus the site catalogue (parked
/// directories and `Sites/` links).
pub struct SiteManager {
    config: ValetConfig,
    files: Filesystem,
    store: Arc<dyn ConfigStore>,
    engine: SiteConfigEngine,
    ca: CertificateAuthority,
}

impl SiteManager {
    pub fn new(
        config: ValetConfig,
        files: Filesystem,
        store: Arc<dyn ConfigStore>,
        ca: CertificateAuthority,
    ) -> Self {
        let engine = SiteConfigEngine::new(&config);
        Self {
            config,
            files,
            store,
            engine,
            ca,
        }
    }

    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub async fn domain(&self) -> ValetResult<DomainConfig> {
        self.store.read().await
    }

    // ==========================================================================
    // Catalogue
    // ==========================================================================

    /// Sites linked explicitly through symlinks in `<home>/Sites`.
    pub async fn links(&self) -> ValetResult<BTreeMap<String, PathBuf>> {
        let dir = self.config.sites_path();
        let mut links = BTreeMap::new();
        for name in self.files.list_dir(&dir).await? {
            let entry = dir.join(&name);
            if !self.files.is_symlink(&entry).await {
                continue;
            }
            let target = self.files.read_link(&entry).await?;
            links.insert(name, absolutize(&dir, target));
        }
        Ok(links)
    }

    async fn parked(&self, domain: &DomainConfig) -> ValetResult<BTreeMap<String, PathBuf>> {
        let mut parked = BTreeMap::new();
        for dir in &domain.paths {
            for name in self.files.list_dir(dir).await? {
                let path = dir.join(&name);
                if !name.starts_with('.') && self.files.is_dir(&path).await {
                    parked.insert(name, path);
                }
            }
        }
        Ok(parked)
    }

    /// Every servable site name and its directory. Links win over parked
    /// directories of the same name.
    async fn site_paths(&self, domain: &DomainConfig) -> ValetResult<BTreeMap<String, (PathBuf, bool)>> {
        let mut sites: BTreeMap<_, _> = self
            .parked(domain)
            .await?
            .into_iter()
            .map(|(name, path)| (name, (path, false)))
            .collect();
        for (name, path) in self.links().await? {
            sites.insert(name, (path, true));
        }
        Ok(sites)
    }

    pub async fn sites(&self) -> ValetResult<Vec<Site>> {
        let domain = self.domain().await?;
        let secured = self.secured().await?;
        let mut sites = Vec::new();
        for (name, (path, linked)) in self.site_paths(&domain).await? {
            let host = domain.qualify(&name);
            sites.push(Site {
                secured: secured.contains(&host),
                proxy_target: self
                    .read_config(&host)
                    .await?
                    .as_deref()
                    .and_then(parse_proxy_target),
                isolated_version: self.custom_version(&host).await?,
                name,
                host,
                path,
                linked,
            });
        }
        Ok(sites)
    }

    /// Turns a site name, a fully qualified host, a project path or `.` (the
    /// current directory) into the host it is served under.
    pub async fn resolve_host(&self, target: &str) -> ValetResult<String> {
        let domain = self.domain().await?;
        let sites = self.site_paths(&domain).await?;

        let name = if target == "." || target.contains('/') {
            let path = if target == "." {
                std::env::current_dir().map_err(|e| ValetError::io(".", e))?
            } else {
                PathBuf::from(target)
            };
            sites
                .iter()
                .find(|(_, (site_path, _))| *site_path == path)
                .map(|(name, _)| name.clone())
                .or_else(|| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
                .ok_or_else(|| ValetError::NotFound(format!("no site at {}", path.display())))?
        } else {
            domain.strip_suffix(target).to_string()
        };

        if !sites.contains_key(&name) {
            return Err(ValetError::NotFound(format!(
                "The [{}] site could not be found in Valet's site list.",
                name
            )));
        }
        Ok(domain.qualify(&name))
    }

    // ==========================================================================
    // Nginx configs
    // ==========================================================================

    /// Hosts with a config file in the Nginx directory.
    pub async fn configured_sites(&self) -> ValetResult<Vec<String>> {
        Ok(self
            .files
            .list_dir(&self.config.nginx_path())
            .await?
            .into_iter()
            .filter(|name| !name.starts_with('.'))
            .collect())
    }

    async fn read_config(&self, host: &str) -> ValetResult<Option<String>> {
        let path = self.config.nginx_file(host);
        if !self.files.exists(&path).await {
            return Ok(None);
        }
        self.files.read(&path).await.map(Some)
    }

    /// Writes `host`'s nginx config.
    pub async fn put(&self, host: &str, conf: &str) -> ValetResult<()> {
        validate_domain_format(host)?;
        self.files.ensure_dir_as_user(&self.config.nginx_path()).await?;
        self.files
            .write_as_user(&self.config.nginx_file(host), conf)
            .await
    }

    /// The PHP version `host` is isolated to, read from its config's marker line.
    pub async fn custom_version(&self, host: &str) -> ValetResult<Option<PhpVersion>> {
        let Some(conf) = self.read_config(host).await? else {
            return Ok(None);
        };
        Ok(SiteConf::parse(&conf)
            .isolated_version()
            .and_then(|raw| PhpVersion::parse(raw).ok()))
    }

    pub async fn isolated_sites(&self) -> ValetResult<Vec<(String, PhpVersion)>> {
        let mut isolated = Vec::new();
        for host in self.configured_sites().await? {
            if let Some(version) = self.custom_version(&host).await? {
                isolated.push((host, version));
            }
        }
        Ok(isolated)
    }

    pub async fn secured(&self) -> ValetResult<BTreeSet<String>> {
        self.ca.list_secured_hostnames().await
    }

    // ==========================================================================
    // TLS
    // ==========================================================================

    /// Secures `host`, replacing any earlier certificate so the trust stores
    /// never hold two entries for it. `existing` is a config to keep; without
    /// one, a host that already proxies keeps its target and anything else gets
    /// the secure stub. An isolation binding survives.
    pub async fn secure(&self, host: &str, existing: Option<&str>) -> ValetResult<TrustReport> {
        validate_domain_format(host)?;
        let domain = self.domain().await?;
        let isolated = self.custom_version(host).await?;
        let proxy = match existing {
            Some(_) => None,
            None => self
                .read_config(host)
                .await?
                .filter(|conf| is_proxy_config(conf))
                .and_then(|conf| parse_proxy_target(&conf))
                .map(|target| self.engine.build_proxy_config(host, &target, true, &domain)),
        };
        let existing = existing.or(proxy.as_deref());

        self.ca.revoke_certificate(host).await?;
        self.files.ensure_dir_as_user(&self.config.nginx_path()).await?;
        if !self.ca.ensure_root_ca().await? {
            self.ca.ensure_root_trusted().await?;
        }
        let report = self.ca.issue_certificate(host).await?;
        for failure in report.failures() {
            warn!("{} is not trusted by {}", host, failure.target);
        }

        self.write_secure_config(host, existing, isolated.as_ref(), &domain)
            .await?;
        info!("🔐 Secured {}", host);
        Ok(report)
    }

    async fn write_secure_config(
        &self,
        host: &str,
        existing: Option<&str>,
        isolated: Option<&PhpVersion>,
        domain: &DomainConfig,
    ) -> ValetResult<()> {
        let mut conf = SiteConf::parse(&self.engine.build_secure_server_config(host, existing, domain));
        if let Some(version) = isolated {
            conf.set_isolated_version(Some(version));
            conf.replace_socket(&version.socket_name());
        }
        self.put(host, &conf.to_string()).await
    }

    /// Drops `host`'s certificate and TLS config. An isolated site falls back to
    /// a plain HTTP config on the same pool.
    pub async fn unsecure(&self, host: &str) -> ValetResult<()> {
        let isolated = self.custom_version(host).await?;
        let Some(report) = self.ca.revoke_certificate(host).await? else {
            return Ok(());
        };
        for failure in report.failures() {
            warn!("trust entry for {} may linger in {}", host, failure.target);
        }

        if let Some(version) = isolated {
            let domain = self.domain().await?;
            let conf = self.engine.build_isolated_config(host, &version, &domain);
            self.put(host, &conf).await?;
        }
        info!("🔓 Unsecured {}", host);
        Ok(())
    }

    /// Re-secures every host under `old` as the same name under `new`, keeping
    /// proxy configs and PHP bindings.
    pub async fn resecure_for_new_domain(&self, old: &str, new: &str) -> ValetResult<Vec<String>> {
        if !self.files.is_dir(&self.config.certificates_path()).await {
            return Ok(Vec::new());
        }
        let domain = self.domain().await?;
        let old_suffix = format!(".{}", old);

        let mut plan = Vec::new();
        for old_host in self.secured().await? {
            let Some(name) = old_host.strip_suffix(&old_suffix) else {
                continue;
            };
            let new_host = format!("{}.{}", name, new);
            let existing = self.read_config(&old_host).await?;
            let proxy_conf = existing
                .filter(|conf| is_proxy_config(conf))
                .map(|conf| conf.replace(&old_host, &new_host));
            plan.push(Rebinding {
                isolated: self.custom_version(&old_host).await?,
                old_host,
                new_host,
                proxy_conf,
            });
        }

        self.ca.rebind_domain(old, new).await?;

        let mut rebound = Vec::new();
        for entry in plan {
            self.write_secure_config(
                &entry.new_host,
                entry.proxy_conf.as_deref(),
                entry.isolated.as_ref(),
                &domain,
            )
            .await?;
            info!("🔁 {} -> {}", entry.old_host, entry.new_host);
            rebound.push(entry.new_host);
        }
        Ok(rebound)
    }

    // ==========================================================================
    // Proxies
    // ==========================================================================

    pub async fn proxy_create(&self, name: &str, target: &str, secure: bool) -> ValetResult<String> {
        validate_proxy_target(target)?;
        let domain = self.domain().await?;
        let host = domain.qualify(name);
        validate_domain_format(&host)?;

        let conf = self.engine.build_proxy_config(&host, target, secure, &domain);
        if secure {
            self.secure(&host, Some(&conf)).await?;
        } else {
            self.ca.revoke_certificate(&host).await?;
            self.put(&host, &conf).await?;
        }
        info!("🔀 {} now proxies to {}", host, target);
        Ok(host)
    }

    pub async fn proxy_delete(&self, name: &str) -> ValetResult<String> {
        let domain = self.domain().await?;
        let host = domain.qualify(name);
        validate_domain_format(&host)?;

        self.ca.revoke_certificate(&host).await?;
        self.files.remove(&self.config.nginx_file(&host)).await?;
        info!("🔀 Removed proxy {}", host);
        Ok(host)
    }

    /// Configs with a `proxy_pass` directive.
    pub async fn proxies(&self) -> ValetResult<Vec<Proxy>> {
        let secured = self.secured().await?;
        let mut proxies = Vec::new();
        for host in self.configured_sites().await? {
            let Some(conf) = self.read_config(&host).await? else {
                continue;
            };
            if let Some(target) = parse_proxy_target(&conf) {
                proxies.push(Proxy {
                    secured: secured.contains(&host),
                    host,
                    target,
                });
            }
        }
        Ok(proxies)
    }

    // ==========================================================================
    // PHP isolation
    // ==========================================================================

    /// Binds `host` to `version`'s pool. An existing config (for instance a
    /// secured one) is patched in place; otherwise the isolated stub is used.
    pub async fn isolate(&self, host: &str, version: &PhpVersion) -> ValetResult<()> {
        let conf = match self.read_config(host).await? {
            Some(existing) => {
                let mut conf = SiteConf::parse(&existing);
                conf.set_isolated_version(Some(version));
                conf.replace_socket(&version.socket_name());
                conf.to_string()
            }
            None => {
                let domain = self.domain().await?;
                self.engine.build_isolated_config(host, version, &domain)
            }
        };
        self.put(host, &conf).await
    }

    /// Returns `host` to the global pool. Secured hosts get a fresh secure
    /// config; others lose their config entirely.
    pub async fn remove_isolation(&self, host: &str) -> ValetResult<()> {
        let crt = self.config.certificate_file(host, "crt");
        if self.files.exists(&crt).await {
            let domain = self.domain().await?;
            self.write_secure_config(host, None, None, &domain).await
        } else {
            self.files.remove(&self.config.nginx_file(host)).await
        }
    }
}

fn is_proxy_config(conf: &str) -> bool {
    stub_name(conf).is_some_and(|stub| stub.contains("proxy"))
}

fn absolutize(base: &Path, target: PathBuf) -> PathBuf {
    if target.is_absolute() {
        target
    } else {
        base.join(target)
    }
}
