// src/config.rs

use std::env;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ValetError, ValetResult};
use crate::sys::files::Filesystem;

/// Loopback every template listens on unless the user picked another one.
pub const DEFAULT_LOOPBACK: &str = "127.0.0.1";

/// Internal location prefix used by the front controller to serve static files.
pub const STATIC_PREFIX: &str = "41c270e4-5535-4daa-b23e-c269744c2f45";

#[derive(Clone, Debug)]
pub struct ValetConfig {
    // 📂 Valet-owned state
    pub home: PathBuf,
    pub server_path: PathBuf,

    // 🛡️ Identity of the developer we act on behalf of (not root under sudo)
    pub user: String,
    pub user_home: PathBuf,
    pub uid: Option<u32>,
    pub gid: Option<u32>,

    // 📂 Platform paths
    pub etc_root: PathBuf,
    pub ca_bundle_dir: PathBuf,

    pub json_logs: bool,
}

impl ValetConfig {
    pub fn load() -> ValetResult<Self> {
        // Under sudo we still act for the invoking developer, never for root.
        let user = env::var("VALET_USER")
            .or_else(|_| env::var("SUDO_USER"))
            .or_else(|_| env::var("USER"))
            .map_err(|_| {
                ValetError::Configuration("unable to determine the invoking user".into())
            })?;

        let account = nix::unistd::User::from_name(&user).map_err(|e| {
            ValetError::Configuration(format!("failed to look up user '{}': {}", user, e))
        })?;

        let (uid, gid, user_home) = match account {
            Some(account) => (
                Some(account.uid.as_raw()),
                Some(account.gid.as_raw()),
                account.dir,
            ),
            None => {
                let home = env::var("HOME").map_err(|_| {
                    ValetError::Configuration(format!("user '{}' has no home directory", user))
                })?;
                (None, None, PathBuf::from(home))
            }
        };

        let home = env::var("VALET_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| user_home.join(".valet"));

        Ok(Self {
            home,
            server_path: env::var("VALET_SERVER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/usr/share/valet/server.php")),
            user,
            user_home,
            uid,
            gid,
            etc_root: env::var("VALET_ETC_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/etc")),
            ca_bundle_dir: env::var("VALET_CA_BUNDLE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/usr/local/share/ca-certificates")),
            json_logs: env::var("VALET_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    pub fn ca_path(&self) -> PathBuf {
        self.home.join("CA")
    }

    pub fn certificates_path(&self) -> PathBuf {
        self.home.join("Certificates")
    }

    /// `<Certificates>/<host>.<ext>` for one of `key`, `csr`, `crt`, `conf`.
    pub fn certificate_file(&self, host: &str, ext: &str) -> PathBuf {
        self.certificates_path().join(format!("{}.{}", host, ext))
    }

    pub fn nginx_path(&self) -> PathBuf {
        self.home.join("Nginx")
    }

    pub fn nginx_file(&self, host: &str) -> PathBuf {
        self.nginx_path().join(host)
    }

    /// Directory of linked sites (one symlink per site name).
    pub fn sites_path(&self) -> PathBuf {
        self.home.join("Sites")
    }

    pub fn log_path(&self) -> PathBuf {
        self.home.join("Log")
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join("config.json")
    }

    /// Present only while the global PHP version differs from the OS default.
    pub fn version_override_file(&self) -> PathBuf {
        self.home.join("use_php_version")
    }

    pub fn socket_path(&self, socket_name: &str) -> PathBuf {
        self.home.join(socket_name)
    }

    /// Socket the global default pool is reachable through.
    pub fn primary_socket(&self) -> PathBuf {
        self.socket_path("valet.sock")
    }

    pub fn nssdb_path(&self) -> PathBuf {
        self.user_home.join(".pki").join("nssdb")
    }

    pub fn firefox_path(&self) -> PathBuf {
        self.user_home.join(".mozilla").join("firefox")
    }

    #[cfg(test)]
    pub fn sandbox(root: &std::path::Path) -> Self {
        Self {
            home: root.join("valet"),
            server_path: root.join("server.php"),
            user: "dev".into(),
            user_home: root.join("home"),
            uid: None,
            gid: None,
            etc_root: root.join("etc"),
            ca_bundle_dir: root.join("ca-certificates"),
            json_logs: false,
        }
    }
}

// ==============================================================================
// Domain settings (config.json)
// ==============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_loopback")]
    pub loopback: String,
    /// Parked directories; every child directory is served as a site.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

fn default_domain() -> String {
    "test".into()
}

fn default_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_loopback() -> String {
    DEFAULT_LOOPBACK.into()
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            port: default_port(),
            https_port: default_https_port(),
            loopback: default_loopback(),
            paths: Vec::new(),
        }
    }
}

impl DomainConfig {
    /// Appends the configured suffix unless the name already carries it.
    pub fn qualify(&self, name: &str) -> String {
        let suffix = format!(".{}", self.domain);
        if name.ends_with(&suffix) {
            name.to_string()
        } else {
            format!("{}{}", name, suffix)
        }
    }

    pub fn strip_suffix<'a>(&self, host: &'a str) -> &'a str {
        host.strip_suffix(&format!(".{}", self.domain)).unwrap_or(host)
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read(&self) -> ValetResult<DomainConfig>;
    async fn write(&self, config: &DomainConfig) -> ValetResult<()>;
}

pub struct JsonConfigStore {
    path: PathBuf,
    files: Filesystem,
}

impl JsonConfigStore {
    pub fn new(path: PathBuf, files: Filesystem) -> Self {
        Self { path, files }
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn read(&self) -> ValetResult<DomainConfig> {
        if !self.files.exists(&self.path).await {
            return Ok(DomainConfig::default());
        }
        let raw = self.files.read(&self.path).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write(&self, config: &DomainConfig) -> ValetResult<()> {
        if let Some(parent) = self.path.parent() {
            self.files.ensure_dir_as_user(parent).await?;
        }
        let raw = serde_json::to_string_pretty(config)?;
        self.files.write_as_user(&self.path, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConfigStore::new(dir.path().join("config.json"), Filesystem::new(None));

        let config = store.read().await.unwrap();
        assert_eq!(config.domain, "test");
        assert_eq!(config.port, 80);
        assert_eq!(config.https_port, 443);
        assert_eq!(config.loopback, DEFAULT_LOOPBACK);
        assert!(config.paths.is_empty());
    }

    #[tokio::test]
    async fn partial_config_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"domain":"dev","paths":["/srv/code"]}"#).unwrap();
        let store = JsonConfigStore::new(path, Filesystem::new(None));

        let config = store.read().await.unwrap();
        assert_eq!(config.domain, "dev");
        assert_eq!(config.https_port, 443);
        assert_eq!(config.paths, vec![PathBuf::from("/srv/code")]);
    }

    #[tokio::test]
    async fn written_config_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConfigStore::new(dir.path().join("nested/config.json"), Filesystem::new(None));
        let config = DomainConfig {
            domain: "localhost".into(),
            https_port: 8443,
            ..DomainConfig::default()
        };

        store.write(&config).await.unwrap();
        assert_eq!(store.read().await.unwrap(), config);
    }

    #[test]
    fn qualify_appends_suffix_once() {
        let config = DomainConfig::default();
        assert_eq!(config.qualify("blog"), "blog.test");
        assert_eq!(config.qualify("blog.test"), "blog.test");
        assert_eq!(config.strip_suffix("blog.test"), "blog");
        assert_eq!(config.strip_suffix("blog"), "blog");
    }
}
