// src/sys/php.rs

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ValetConfig;
use crate::error::{ValetError, ValetResult};
use crate::sys::files::Filesystem;
use crate::sys::proxy::SiteConfigEngine;
use crate::sys::sites::SiteManager;
use crate::sys::systemd::ServiceManager;
use crate::sys::traits::{CommandRunner, Invocation, PackageManager};

pub const NGINX_SERVICE: &str = "nginx";
const POOL_FILE: &str = "valet.conf";

// ==============================================================================
// PHP version identifiers
// ==============================================================================

/// A `major.minor` PHP release. Every spelling users type (`php7.4`, `php74`,
/// `7.4`, `php@7.4`) normalizes to the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhpVersion {
    major: u32,
    minor: u32,
}

impl PhpVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn parse(raw: &str) -> ValetResult<Self> {
        let invalid = || ValetError::InvalidVersion(raw.to_string());

        let lowered = raw.trim().to_ascii_lowercase();
        let bare = lowered.strip_prefix("php").unwrap_or(&lowered);
        let bare = bare.strip_prefix('@').unwrap_or(bare);

        if let Some((major, rest)) = bare.split_once('.') {
            // Patch releases collapse onto their minor line.
            let minor = rest.split('.').next().unwrap_or_default();
            let parse = |part: &str| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                part.parse::<u32>().map_err(|_| invalid())
            };
            return Ok(Self::new(parse(major)?, parse(minor)?));
        }

        // Undotted digits: the first one is the major version.
        if bare.len() >= 2 && bare.bytes().all(|b| b.is_ascii_digit()) {
            let (major, minor) = bare.split_at(1);
            return Ok(Self::new(
                major.parse().map_err(|_| invalid())?,
                minor.parse().map_err(|_| invalid())?,
            ));
        }

        Err(invalid())
    }

    /// Socket file of this version's pool inside the Valet home, e.g. `valet74.sock`.
    pub fn socket_name(&self) -> String {
        format!("valet{}{}.sock", self.major, self.minor)
    }

    /// Distribution package and systemd unit of this version's FPM daemon.
    pub fn fpm_service(&self) -> String {
        format!("php{}-fpm", self)
    }
}

impl fmt::Display for PhpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Global version state threaded through a single invocation instead of living
/// in a process-wide mutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhpContext {
    pub global: PhpVersion,
    pub os_default: PhpVersion,
}

// ==============================================================================
// FPM pool management
// ==============================================================================

pub struct PhpFpmManager {
    config: ValetConfig,
    files: Filesystem,
    engine: SiteConfigEngine,
    runner: Arc<dyn CommandRunner>,
    packages: Arc<dyn PackageManager>,
    services: Arc<dyn ServiceManager>,
    sites: Arc<SiteManager>,
}

impl PhpFpmManager {
    pub fn new(
        config: ValetConfig,
        files: Filesystem,
        runner: Arc<dyn CommandRunner>,
        packages: Arc<dyn PackageManager>,
        services: Arc<dyn ServiceManager>,
        sites: Arc<SiteManager>,
    ) -> Self {
        let engine = SiteConfigEngine::new(&config);
        Self {
            config,
            files,
            engine,
            runner,
            packages,
            services,
            sites,
        }
    }

    pub async fn os_default_version(&self) -> ValetResult<PhpVersion> {
        self.packages.default_version().await?.ok_or_else(|| {
            ValetError::Configuration(
                "unable to determine the distribution's default PHP version".into(),
            )
        })
    }

    /// The global version is the persisted override, or the OS default when
    /// no override exists.
    pub async fn resolve_context(&self) -> ValetResult<PhpContext> {
        let os_default = self.os_default_version().await?;
        let override_file = self.config.version_override_file();
        let global = if self.files.exists(&override_file).await {
            PhpVersion::parse(self.files.read(&override_file).await?.trim())?
        } else {
            os_default
        };
        Ok(PhpContext { global, os_default })
    }

    /// The version that serves `host`: its isolation binding, else the global one.
    pub async fn version_for(&self, ctx: &PhpContext, host: &str) -> ValetResult<PhpVersion> {
        Ok(self.sites.custom_version(host).await?.unwrap_or(ctx.global))
    }

    /// Pool configuration directory for `version`. Distributions disagree on the
    /// layout, so the first existing candidate wins.
    pub async fn fpm_config_path(&self, version: &PhpVersion) -> ValetResult<PathBuf> {
        let etc = &self.config.etc_root;
        let digits = format!("{}", version).replace('.', "");
        let candidates = [
            etc.join("php").join(version.to_string()).join("fpm/pool.d"),
            etc.join(format!("php{}", digits)).join("php-fpm.d"),
            etc.join("php-fpm.d"),
            etc.join("php/php-fpm.d"),
            etc.join("php7/fpm/php-fpm.d"),
            etc.join("php8/fpm/php-fpm.d"),
        ];
        for candidate in candidates {
            if self.files.is_dir(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(ValetError::Configuration(format!(
            "unable to find a php-fpm pool directory for PHP {}",
            version
        )))
    }

    /// Makes `version`'s pool available: package installed, unit enabled and a
    /// pool config listening on its Valet socket.
    pub async fn install(&self, version: &PhpVersion) -> ValetResult<()> {
        let service = version.fpm_service();
        if !self.packages.is_installed(&service).await? {
            self.packages
                .ensure_installed(&service)
                .await
                .map_err(|e| ValetError::VersionInstall {
                    version: version.to_string(),
                    reason: e.to_string(),
                })?;
            self.services.enable(&service).await?;
        }

        let pool = self.fpm_config_path(version).await?.join(POOL_FILE);
        let contents = self
            .engine
            .build_pool_config(&self.config.user, &self.config.user, version);
        self.files.write(&pool, &contents).await?;
        self.files.ensure_dir_as_user(&self.config.log_path()).await?;
        info!("🐘 Pool for PHP {} written to {}", version, pool.display());
        Ok(())
    }

    /// Binds the site behind `target` to `requested`. The version is installed
    /// before any site config is touched.
    pub async fn isolate(&self, ctx: &PhpContext, target: &str, requested: &str) -> ValetResult<String> {
        let host = self.sites.resolve_host(target).await?;
        let version = PhpVersion::parse(requested)?;
        self.install(&version).await?;

        let previous = self.sites.custom_version(&host).await?;
        self.sites.isolate(&host, &version).await?;
        self.stop_if_unused(ctx, previous.as_ref()).await?;

        self.services.restart(&version.fpm_service()).await?;
        self.services.restart(NGINX_SERVICE).await?;
        info!("🐘 {} now runs PHP {}", host, version);
        Ok(host)
    }

    pub async fn deisolate(&self, ctx: &PhpContext, target: &str) -> ValetResult<String> {
        let host = self.sites.resolve_host(target).await?;
        let previous = self.sites.custom_version(&host).await?;
        self.sites.remove_isolation(&host).await?;
        self.stop_if_unused(ctx, previous.as_ref()).await?;

        self.services.restart(NGINX_SERVICE).await?;
        info!("🐘 {} is back on the global PHP {}", host, ctx.global);
        Ok(host)
    }

    /// Makes `requested` (or `default`, the OS version) the global interpreter.
    /// An install failure restores the previous pool before the error returns.
    pub async fn change_global_version(&self, ctx: &PhpContext, requested: &str) -> ValetResult<PhpContext> {
        let target = if requested.eq_ignore_ascii_case("default") {
            ctx.os_default
        } else {
            PhpVersion::parse(requested)?
        };
        if target == ctx.global {
            info!("PHP {} is already the global version", target);
            return Ok(*ctx);
        }

        let previous = ctx.global;
        let previous_service = previous.fpm_service();
        self.services.stop(&previous_service).await?;
        self.services.disable(&previous_service).await?;

        if let Err(e) = self.install(&target).await {
            warn!("Switching to PHP {} failed, restoring PHP {}: {}", target, previous, e);
            self.restore(&previous).await?;
            return Err(e);
        }

        let target_service = target.fpm_service();
        if self.services.is_disabled(&target_service).await? {
            self.services.enable(&target_service).await?;
        }
        self.services.restart(&target_service).await?;

        let override_file = self.config.version_override_file();
        self.files.ensure_dir_as_user(&self.config.home).await?;
        if target == ctx.os_default {
            self.files.remove(&override_file).await?;
        } else {
            self.files
                .write_as_user(&override_file, &format!("{}\n", target))
                .await?;
        }
        self.files
            .symlink_as_user(
                &self.config.socket_path(&target.socket_name()),
                &self.config.primary_socket(),
            )
            .await?;
        self.update_cli(&target).await?;

        // Sites isolated on the old version still need their pool.
        if self.utilized_versions().await?.contains(&previous) {
            self.restore(&previous).await?;
        }

        self.services.restart(NGINX_SERVICE).await?;
        info!("🐘 Global PHP is now {}", target);
        Ok(PhpContext {
            global: target,
            os_default: ctx.os_default,
        })
    }

    async fn restore(&self, version: &PhpVersion) -> ValetResult<()> {
        let service = version.fpm_service();
        if self.services.is_disabled(&service).await? {
            self.services.enable(&service).await?;
        }
        self.services.start(&service).await
    }

    /// Points the `php` CLI alternative at `version`.
    pub async fn update_cli(&self, version: &PhpVersion) -> ValetResult<()> {
        let binary = format!("/usr/bin/php{}", version);
        self.runner
            .run(&Invocation::new("update-alternatives").args(["--set", "php", binary.as_str()]))
            .await?;
        Ok(())
    }

    /// Supported versions whose socket appears in at least one nginx site config.
    pub async fn utilized_versions(&self) -> ValetResult<BTreeSet<PhpVersion>> {
        let supported = self.packages.supported_versions().await?;
        let mut used = BTreeSet::new();
        for host in self.sites.configured_sites().await? {
            let conf = self.files.read(&self.config.nginx_file(&host)).await?;
            used.extend(
                supported
                    .iter()
                    .filter(|v| conf.contains(&v.socket_name())),
            );
        }
        Ok(used)
    }

    /// Stops `version`'s pool when neither the global default nor any site uses it.
    pub async fn stop_if_unused(&self, ctx: &PhpContext, version: Option<&PhpVersion>) -> ValetResult<()> {
        let Some(version) = version else {
            return Ok(());
        };
        if *version == ctx.global || self.utilized_versions().await?.contains(version) {
            return Ok(());
        }
        self.services.stop(&version.fpm_service()).await?;
        info!("Stopped unused PHP {} pool", version);
        Ok(())
    }

    pub async fn list_isolated(&self) -> ValetResult<Vec<(String, PhpVersion)>> {
        self.sites.isolated_sites().await
    }
}
