// src/sys/packages.rs

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use tracing::info;

use crate::error::{ValetError, ValetResult};
use crate::sys::php::PhpVersion;
use crate::sys::traits::{CommandRunner, Invocation, PackageManager};

static FPM_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^php(\d+\.\d+)-fpm$").expect("valid regex"));

static DEFAULT_DEPENDENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Depends:\s*php(\d+\.\d+)\b").expect("valid regex"));

// ==============================================================================
// Debian / Ubuntu (dpkg + apt)
// ==============================================================================

pub struct AptPackageManager {
    runner: Arc<dyn CommandRunner>,
}

impl AptPackageManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PackageManager for AptPackageManager {
    async fn is_installed(&self, package: &str) -> ValetResult<bool> {
        let query = Invocation::new("dpkg-query").args(["-W", "-f=${Status}", package]);
        match self.runner.run(&query).await {
            Ok(out) => Ok(out.stdout.contains("install ok installed")),
            // dpkg-query exits 1 for packages it has never heard of.
            Err(ValetError::Process { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn ensure_installed(&self, package: &str) -> ValetResult<()> {
        if self.is_installed(package).await? {
            return Ok(());
        }
        info!("📦 Installing {}", package);
        self.runner
            .run(&Invocation::new("apt-get").args(["install", "-y", "-q", package]))
            .await?;
        Ok(())
    }

    async fn supported_versions(&self) -> ValetResult<BTreeSet<PhpVersion>> {
        let out = self
            .runner
            .run(&Invocation::new("apt-cache").args(["pkgnames", "php"]))
            .await?;
        Ok(parse_fpm_packages(&out.stdout))
    }

    async fn default_version(&self) -> ValetResult<Option<PhpVersion>> {
        let out = self
            .runner
            .run(&Invocation::new("apt-cache").args(["depends", "php"]))
            .await?;
        Ok(parse_default_dependency(&out.stdout))
    }
}

fn parse_fpm_packages(listing: &str) -> BTreeSet<PhpVersion> {
    listing
        .lines()
        .filter_map(|line| FPM_PACKAGE.captures(line.trim()))
        .filter_map(|caps| PhpVersion::parse(&caps[1]).ok())
        .collect()
}

fn parse_default_dependency(listing: &str) -> Option<PhpVersion> {
    DEFAULT_DEPENDENCY
        .captures(listing)
        .and_then(|caps| PhpVersion::parse(&caps[1]).ok())
}
