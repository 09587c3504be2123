// src/valet.rs

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ConfigStore, JsonConfigStore, ValetConfig};
use crate::error::ValetResult;
use crate::sys::files::Filesystem;
use crate::sys::packages::AptPackageManager;
use crate::sys::php::{NGINX_SERVICE, PhpFpmManager, PhpVersion};
use crate::sys::process::SystemCommandRunner;
use crate::sys::proxy::validate_domain_format;
use crate::sys::sites::{Proxy, Site, SiteManager};
use crate::sys::ssl::CertificateAuthority;
use crate::sys::systemd::{ServiceManager, SystemdServiceManager};
use crate::sys::traits::{CommandRunner, PackageManager};
use crate::sys::trust::TrustStoreSync;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecuredSite {
    pub host: String,
    pub expires: Option<DateTime<Utc>>,
}

/// Entry point for every user-facing operation. Each mutation finishes by
/// reloading nginx so the rendered configs take effect.
pub struct ValetService {
    store: Arc<dyn ConfigStore>,
    sites: Arc<SiteManager>,
    php: PhpFpmManager,
    services: Arc<dyn ServiceManager>,
}

impl ValetService {
    pub fn new(config: ValetConfig) -> Self {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(SystemCommandRunner::new(Some(config.user.clone())));
        let store = Arc::new(JsonConfigStore::new(
            config.config_file(),
            Filesystem::for_config(&config),
        ));
        Self::with_collaborators(
            config,
            store,
            runner.clone(),
            Arc::new(AptPackageManager::new(runner.clone())),
            Arc::new(SystemdServiceManager::new(runner)),
        )
    }

    /// Wires the managers around injected system collaborators.
    pub fn with_collaborators(
        config: ValetConfig,
        store: Arc<dyn ConfigStore>,
        runner: Arc<dyn CommandRunner>,
        packages: Arc<dyn PackageManager>,
        services: Arc<dyn ServiceManager>,
    ) -> Self {
        let files = Filesystem::for_config(&config);
        let trust = TrustStoreSync::new(&config, runner.clone(), files.clone());
        let ca = CertificateAuthority::new(config.clone(), files.clone(), runner.clone(), trust);
        let sites = Arc::new(SiteManager::new(config.clone(), files.clone(), store.clone(), ca));
        let php = PhpFpmManager::new(
            config,
            files,
            runner,
            packages,
            services.clone(),
            sites.clone(),
        );
        Self {
            store,
            sites,
            php,
            services,
        }
    }

    async fn reload(&self) -> ValetResult<()> {
        self.services.restart(NGINX_SERVICE).await
    }

    // ==============================================================================
    // 1. TLS
    // ==============================================================================

    pub async fn secure(&self, name: &str) -> ValetResult<String> {
        let host = self.store.read().await?.qualify(name);
        self.sites.secure(&host, None).await?;
        self.reload().await?;
        Ok(host)
    }

    pub async fn unsecure(&self, name: &str) -> ValetResult<String> {
        let host = self.store.read().await?.qualify(name);
        validate_domain_format(&host)?;
        self.sites.unsecure(&host).await?;
        self.reload().await?;
        Ok(host)
    }

    pub async fn list_secured(&self) -> ValetResult<Vec<SecuredSite>> {
        let ca = self.sites.certificate_authority();
        let mut secured = Vec::new();
        for host in self.sites.secured().await? {
            let expires = match ca.certificate_expiry(&host).await {
                Ok(expires) => expires,
                Err(e) => {
                    warn!("Could not read the expiry of {}: {}", host, e);
                    None
                }
            };
            secured.push(SecuredSite { host, expires });
        }
        Ok(secured)
    }

    /// Makes sure the root CA exists and is trusted by every store.
    pub async fn trust(&self) -> ValetResult<()> {
        let ca = self.sites.certificate_authority();
        if !ca.ensure_root_ca().await? {
            ca.trust_root().await?;
        }
        Ok(())
    }

    // ==============================================================================
    // 2. Domain
    // ==============================================================================

    pub async fn resecure_for_new_domain(&self, old: &str, new: &str) -> ValetResult<Vec<String>> {
        let rebound = self.sites.resecure_for_new_domain(old, new).await?;
        self.reload().await?;
        Ok(rebound)
    }

    /// Switches the TLD every site is served under. Certificates follow.
    pub async fn change_domain(&self, new: &str) -> ValetResult<Vec<String>> {
        let new = new.trim_start_matches('.');
        validate_domain_format(new)?;

        let mut domain = self.store.read().await?;
        if domain.domain == new {
            info!("Domain is already .{}", new);
            return Ok(Vec::new());
        }
        let old = std::mem::replace(&mut domain.domain, new.to_string());
        self.store.write(&domain).await?;
        info!("🌐 Domain changed from .{} to .{}", old, new);

        self.resecure_for_new_domain(&old, new).await
    }

    pub async fn domain(&self) -> ValetResult<String> {
        Ok(self.store.read().await?.domain)
    }

    // ==============================================================================
    // 3. Proxies & sites
    // ==============================================================================

    pub async fn proxy_create(&self, name: &str, target: &str, secure: bool) -> ValetResult<String> {
        let host = self.sites.proxy_create(name, target, secure).await?;
        self.reload().await?;
        Ok(host)
    }

    pub async fn proxy_delete(&self, name: &str) -> ValetResult<String> {
        let host = self.sites.proxy_delete(name).await?;
        self.reload().await?;
        Ok(host)
    }

    pub async fn list_proxies(&self) -> ValetResult<Vec<Proxy>> {
        self.sites.proxies().await
    }

    pub async fn sites(&self) -> ValetResult<Vec<Site>> {
        self.sites.sites().await
    }

    // ==============================================================================
    // 4. PHP
    // ==============================================================================

    pub async fn isolate(&self, target: &str, version: &str) -> ValetResult<String> {
        let ctx = self.php.resolve_context().await?;
        self.php.isolate(&ctx, target, version).await
    }

    pub async fn unisolate(&self, target: &str) -> ValetResult<String> {
        let ctx = self.php.resolve_context().await?;
        self.php.deisolate(&ctx, target).await
    }

    pub async fn change_global_version(&self, version: &str) -> ValetResult<PhpVersion> {
        let ctx = self.php.resolve_context().await?;
        Ok(self.php.change_global_version(&ctx, version).await?.global)
    }

    pub async fn list_isolated(&self) -> ValetResult<Vec<(String, PhpVersion)>> {
        self.php.list_isolated().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainConfig;
    use crate::sys::testing::{FakePackages, FakeRunner, FakeServices};

    struct Harness {
        _dir: tempfile::TempDir,
        config: ValetConfig,
        runner: Arc<FakeRunner>,
        services: Arc<FakeServices>,
        valet: ValetService,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = ValetConfig::sandbox(dir.path());
        std::fs::create_dir_all(dir.path().join("code/blog")).unwrap();
        std::fs::create_dir_all(dir.path().join("code/api")).unwrap();
        std::fs::create_dir_all(config.etc_root.join("php-fpm.d")).unwrap();

        let store = Arc::new(JsonConfigStore::new(config.config_file(), Filesystem::new(None)));
        store
            .write(&DomainConfig {
                paths: vec![dir.path().join("code")],
                ..Default::default()
            })
            .await
            .unwrap();

        let runner = Arc::new(FakeRunner::default());
        let services = Arc::new(FakeServices::with_running(&["nginx", "php8.1-fpm"]));
        let packages = Arc::new(FakePackages::new("8.1", &["7.4", "8.1"], &["8.1"]));
        let valet = ValetService::with_collaborators(
            config.clone(),
            store,
            runner.clone(),
            packages,
            services.clone(),
        );
        Harness {
            _dir: dir,
            config,
            runner,
            services,
            valet,
        }
    }

    #[tokio::test]
    async fn secure_qualifies_name_and_reloads_nginx() {
        let h = harness().await;
        let host = h.valet.secure("blog").await.unwrap();

        assert_eq!(host, "blog.test");
        assert!(h.config.nginx_file("blog.test").exists());
        assert_eq!(h.services.log().last().unwrap(), "restart nginx");
    }

    #[tokio::test]
    async fn secured_listing_reports_expiry() {
        let h = harness().await;
        h.valet.secure("blog").await.unwrap();
        h.runner.respond("-enddate", "notAfter=Mar 10 08:00:00 2027 GMT");

        let secured = h.valet.list_secured().await.unwrap();
        assert_eq!(secured.len(), 1);
        assert_eq!(secured[0].host, "blog.test");
        assert!(secured[0].expires.is_some());
    }

    #[tokio::test]
    async fn unreadable_expiry_still_lists_host() {
        let h = harness().await;
        h.valet.secure("blog").await.unwrap();
        h.valet.secure("api").await.unwrap();
        h.runner.fail_on("-enddate -noout -in");

        let secured = h.valet.list_secured().await.unwrap();
        assert_eq!(
            secured,
            vec![
                SecuredSite {
                    host: "api.test".into(),
                    expires: None
                },
                SecuredSite {
                    host: "blog.test".into(),
                    expires: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn changing_domain_moves_certificates() {
        let h = harness().await;
        h.valet.secure("blog").await.unwrap();
        h.valet.secure("api").await.unwrap();

        let rebound = h.valet.change_domain("dev").await.unwrap();

        assert_eq!(rebound, vec!["api.dev".to_string(), "blog.dev".to_string()]);
        assert_eq!(h.valet.domain().await.unwrap(), "dev");
        let hosts: Vec<String> = h
            .valet
            .list_secured()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.host)
            .collect();
        assert_eq!(hosts, vec!["api.dev", "blog.dev"]);
        let sites = h.valet.sites().await.unwrap();
        assert!(sites.iter().all(|s| s.secured && s.host.ends_with(".dev")));
    }

    #[tokio::test]
    async fn changing_to_current_domain_is_a_no_op() {
        let h = harness().await;
        assert!(h.valet.change_domain(".test").await.unwrap().is_empty());
        assert!(h.runner.command_lines().is_empty());
    }

    #[tokio::test]
    async fn isolation_round_trip_through_facade() {
        let h = harness().await;
        h.valet.isolate("blog", "7.4").await.unwrap();
        assert_eq!(
            h.valet.list_isolated().await.unwrap(),
            vec![("blog.test".to_string(), PhpVersion::new(7, 4))]
        );

        h.valet.unisolate("blog").await.unwrap();
        assert!(h.valet.list_isolated().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trust_reinstalls_existing_root() {
        let h = harness().await;
        h.valet.trust().await.unwrap();
        h.valet.trust().await.unwrap();

        let bundle_updates = h
            .runner
            .command_lines()
            .iter()
            .filter(|l| *l == "update-ca-certificates")
            .count();
        assert_eq!(bundle_updates, 2);
    }
}
