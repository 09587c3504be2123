// src/sys/trust.rs
//
// Trust-store synchronisation: the user's shared NSS database (Chromium and most
// desktop tooling), every Firefox profile, and for the root CA the system bundle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ValetConfig;
use crate::error::ValetResult;
use crate::sys::files::Filesystem;
use crate::sys::traits::{CommandRunner, Invocation};

/// Nickname the root CA is stored under in every NSS database.
pub const CA_NICKNAME: &str = "Valet CA Self Signed";
const CA_BUNDLE_FILE: &str = "valet-ca.crt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustTarget {
    /// The user's shared NSS database (`~/.pki/nssdb`).
    System(String),
    /// A browser profile database.
    Browser(String),
    /// The distribution CA bundle refreshed by `update-ca-certificates`.
    CaBundle(PathBuf),
}

impl fmt::Display for TrustTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustTarget::System(db) => write!(f, "system store {}", db),
            TrustTarget::Browser(db) => write!(f, "browser profile {}", db),
            TrustTarget::CaBundle(path) => write!(f, "CA bundle {}", path.display()),
        }
    }
}

#[derive(Debug)]
pub struct TrustOutcome {
    pub target: TrustTarget,
    pub result: ValetResult<()>,
}

/// Per-store results of a fan-out. One store failing never stops the others.
#[derive(Debug, Default)]
pub struct TrustReport {
    pub outcomes: Vec<TrustOutcome>,
}

impl TrustReport {
    fn record(&mut self, target: TrustTarget, result: ValetResult<()>) {
        self.outcomes.push(TrustOutcome { target, result });
    }

    pub fn failures(&self) -> impl Iterator<Item = &TrustOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

pub struct TrustStoreSync {
    runner: Arc<dyn CommandRunner>,
    files: Filesystem,
    nssdb: PathBuf,
    firefox: PathBuf,
    ca_bundle_dir: PathBuf,
}

impl TrustStoreSync {
    pub fn new(config: &ValetConfig, runner: Arc<dyn CommandRunner>, files: Filesystem) -> Self {
        Self {
            runner,
            files,
            nssdb: config.nssdb_path(),
            firefox: config.firefox_path(),
            ca_bundle_dir: config.ca_bundle_dir.clone(),
        }
    }

    fn system_db(&self) -> String {
        format!("sql:{}", self.nssdb.display())
    }

    /// Trusts `cert_path` under `nickname`. The system store must succeed; browser
    /// profiles are best effort and reported.
    pub async fn install(&self, nickname: &str, cert_path: &Path) -> ValetResult<TrustReport> {
        self.install_with_flags(nickname, cert_path, "TC").await
    }

    /// Removes `nickname` from every store. Absent entries are expected here,
    /// so failures are only reported, never raised.
    pub async fn remove(&self, nickname: &str) -> TrustReport {
        let mut report = TrustReport::default();

        let db = self.system_db();
        let result = self.delete_entry(&db, nickname).await;
        report.record(TrustTarget::System(db), result);

        for db in self.browser_databases().await {
            let result = self.delete_entry(&db, nickname).await;
            report.record(TrustTarget::Browser(db), result);
        }

        for failure in report.failures() {
            debug!("Trust entry '{}' not removed from {}", nickname, failure.target);
        }
        report
    }

    /// Whether the system store holds an entry named `nickname`.
    pub async fn is_trusted(&self, nickname: &str) -> bool {
        self.runner
            .run_as_user(&Invocation::new("certutil").args([
                "-d",
                &self.system_db(),
                "-L",
                "-n",
                nickname,
            ]))
            .await
            .is_ok()
    }

    /// Trusts the root CA as an issuer everywhere, including the system bundle.
    pub async fn install_root(&self, ca_pem: &Path) -> ValetResult<TrustReport> {
        // Replace any previous CA: a regenerated root keeps the same nickname.
        let _ = self.remove(CA_NICKNAME).await;
        let mut report = self.install_with_flags(CA_NICKNAME, ca_pem, "C,,").await?;

        let bundle = self.ca_bundle_dir.join(CA_BUNDLE_FILE);
        let pem = self.files.read(ca_pem).await?;
        self.files.ensure_dir(&self.ca_bundle_dir).await?;
        self.files.write(&bundle, &pem).await?;
        self.runner
            .run(&Invocation::new("update-ca-certificates"))
            .await?;
        info!("🔐 Root CA added to {}", bundle.display());
        report.record(TrustTarget::CaBundle(bundle), Ok(()));

        Ok(report)
    }

    async fn install_with_flags(
        &self,
        nickname: &str,
        cert_path: &Path,
        flags: &str,
    ) -> ValetResult<TrustReport> {
        let mut report = TrustReport::default();

        self.ensure_system_db().await?;
        let db = self.system_db();
        self.add_entry(&db, nickname, cert_path, flags).await?;
        report.record(TrustTarget::System(db), Ok(()));

        for db in self.browser_databases().await {
            let result = self.add_entry(&db, nickname, cert_path, flags).await;
            if let Err(e) = &result {
                warn!("Could not trust '{}' in {}: {}", nickname, db, e);
            }
            report.record(TrustTarget::Browser(db), result);
        }

        info!("🔐 Trusted '{}' ({})", nickname, cert_path.display());
        Ok(report)
    }

    async fn add_entry(&self, db: &str, nickname: &str, cert: &Path, flags: &str) -> ValetResult<()> {
        let cert = cert.display().to_string();
        self.runner
            .run_as_user(&Invocation::new("certutil").args([
                "-d", db, "-A", "-t", flags, "-n", nickname, "-i", &cert,
            ]))
            .await
            .map(|_| ())
    }

    async fn delete_entry(&self, db: &str, nickname: &str) -> ValetResult<()> {
        self.runner
            .run_as_user(&Invocation::new("certutil").args(["-d", db, "-D", "-n", nickname]))
            .await
            .map(|_| ())
    }

    async fn ensure_system_db(&self) -> ValetResult<()> {
        if self.files.is_dir(&self.nssdb).await {
            return Ok(());
        }
        self.files.ensure_dir_as_user(&self.nssdb).await?;
        self.runner
            .run_as_user(&Invocation::new("certutil").args([
                "-d",
                &self.system_db(),
                "-N",
                "--empty-password",
            ]))
            .await?;
        info!("Initialised NSS database at {}", self.nssdb.display());
        Ok(())
    }

    /// certutil database specs for every Firefox profile. No `profiles.ini`
    /// means no Firefox, which is not an error.
    pub async fn browser_databases(&self) -> Vec<String> {
        let index = self.firefox.join("profiles.ini");
        let Ok(contents) = self.files.read(&index).await else {
            return Vec::new();
        };

        let mut databases = Vec::new();
        for profile in parse_profiles_ini(&contents, &self.firefox) {
            if !self.files.is_dir(&profile).await {
                continue;
            }
            // cert9.db is the SQLite format; older profiles only have cert8.db.
            let kind = if self.files.exists(&profile.join("cert9.db")).await {
                "sql"
            } else {
                "dbm"
            };
            databases.push(format!("{}:{}", kind, profile.display()));
        }
        databases
    }
}

/// Profile directories listed in a Firefox `profiles.ini`, resolving
/// `IsRelative=1` paths against `base`.
pub fn parse_profiles_ini(contents: &str, base: &Path) -> Vec<PathBuf> {
    let mut profiles = Vec::new();
    let mut in_profile = false;
    let mut path: Option<String> = None;
    let mut relative = true;

    let mut flush = |in_profile: bool, path: &mut Option<String>, relative: bool| {
        if let (true, Some(p)) = (in_profile, path.take()) {
            profiles.push(if relative { base.join(p) } else { PathBuf::from(p) });
        }
    };

    for line in contents.lines().map(str::trim) {
        if line.starts_with('[') && line.ends_with(']') {
            flush(in_profile, &mut path, relative);
            in_profile = line[1..line.len() - 1].starts_with("Profile");
            relative = true;
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "Path" => path = Some(value.trim().to_string()),
                "IsRelative" => relative = value.trim() != "0",
                _ => {}
            }
        }
    }
    flush(in_profile, &mut path, relative);

    profiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::FakeRunner;

    const PROFILES: &str = "[Install4F96D1932A9F858E]\nDefault=abcd.default-release\n\n\
        [Profile1]\nName=default\nIsRelative=1\nPath=abcd.default-release\nDefault=1\n\n\
        [Profile0]\nName=work\nIsRelative=0\nPath=/data/firefox/work\n\n\
        [General]\nStartWithLastProfile=1\nVersion=2\n";

    #[test]
    fn profiles_resolve_relative_and_absolute_paths() {
        let base = Path::new("/home/dev/.mozilla/firefox");
        let profiles = parse_profiles_ini(PROFILES, base);
        assert_eq!(
            profiles,
            vec![
                base.join("abcd.default-release"),
                PathBuf::from("/data/firefox/work"),
            ]
        );
    }

    fn sandbox() -> (tempfile::TempDir, ValetConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = ValetConfig::sandbox(dir.path());
        (dir, config)
    }

    #[tokio::test]
    async fn missing_profiles_ini_skips_browsers() {
        let (_dir, config) = sandbox();
        let runner = Arc::new(FakeRunner::default());
        let trust = TrustStoreSync::new(&config, runner.clone(), Filesystem::new(None));

        let report = trust.install("blog.test", Path::new("/tmp/blog.test.crt")).await.unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(report.outcomes[0].target, TrustTarget::System(_)));
        let db = format!("sql:{}", config.nssdb_path().display());
        assert!(runner.trusted(&db).contains("blog.test"));
    }

    #[tokio::test]
    async fn first_install_initialises_nss_database() {
        let (_dir, config) = sandbox();
        let runner = Arc::new(FakeRunner::default());
        let trust = TrustStoreSync::new(&config, runner.clone(), Filesystem::new(None));

        trust.install("blog.test", Path::new("/tmp/blog.test.crt")).await.unwrap();
        trust.install("api.test", Path::new("/tmp/api.test.crt")).await.unwrap();

        let inits = runner.command_lines().iter().filter(|l| l.contains(" -N ")).count();
        assert_eq!(inits, 1);
    }

    #[tokio::test]
    async fn removal_continues_past_failing_stores() {
        let (_dir, config) = sandbox();
        let firefox = config.firefox_path();
        std::fs::create_dir_all(firefox.join("one")).unwrap();
        std::fs::create_dir_all(firefox.join("two")).unwrap();
        std::fs::write(firefox.join("two/cert9.db"), "").unwrap();
        std::fs::write(
            firefox.join("profiles.ini"),
            "[Profile0]\nPath=one\nIsRelative=1\n[Profile1]\nPath=two\nIsRelative=1\n",
        )
        .unwrap();

        let runner = Arc::new(FakeRunner::default());
        let trust = TrustStoreSync::new(&config, runner.clone(), Filesystem::new(None));
        trust.install("blog.test", Path::new("/tmp/blog.test.crt")).await.unwrap();

        // The system store loses the entry out of band; removal still sweeps the profiles.
        let system = format!("sql:{}", config.nssdb_path().display());
        runner.fail_on(&format!("-d {} -D", system));
        let report = trust.remove("blog.test").await;

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.failures().count(), 1);
        assert!(!report.is_clean());
        let one = format!("dbm:{}", firefox.join("one").display());
        let two = format!("sql:{}", firefox.join("two").display());
        assert!(runner.trusted(&one).is_empty());
        assert!(runner.trusted(&two).is_empty());
    }

    #[tokio::test]
    async fn removing_absent_entry_does_not_raise() {
        let (_dir, config) = sandbox();
        let runner = Arc::new(FakeRunner::default());
        let trust = TrustStoreSync::new(&config, runner, Filesystem::new(None));

        let report = trust.remove("never-secured.test").await;
        assert_eq!(report.failures().count(), 1);
    }

    #[tokio::test]
    async fn root_ca_lands_in_system_bundle() {
        let (dir, config) = sandbox();
        let pem = dir.path().join("ca.pem");
        std::fs::write(&pem, "CA PEM").unwrap();
        let runner = Arc::new(FakeRunner::default());
        let trust = TrustStoreSync::new(&config, runner.clone(), Filesystem::new(None));

        trust.install_root(&pem).await.unwrap();

        let bundle = config.ca_bundle_dir.join(CA_BUNDLE_FILE);
        assert_eq!(std::fs::read_to_string(bundle).unwrap(), "CA PEM");
        assert!(runner.command_lines().contains(&"update-ca-certificates".to_string()));
        let db = format!("sql:{}", config.nssdb_path().display());
        assert!(runner.trusted(&db).contains(CA_NICKNAME));
    }
}
