// src/sys/systemd.rs

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::error::{ValetError, ValetResult};
use crate::sys::traits::{CommandRunner, Invocation};

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn enable(&self, service: &str) -> ValetResult<()>;
    async fn disable(&self, service: &str) -> ValetResult<()>;
    async fn start(&self, service: &str) -> ValetResult<()>;
    async fn stop(&self, service: &str) -> ValetResult<()>;
    async fn restart(&self, service: &str) -> ValetResult<()>;
    async fn is_disabled(&self, service: &str) -> ValetResult<bool>;
}

pub struct SystemdServiceManager {
    runner: Arc<dyn CommandRunner>,
}

impl SystemdServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn systemctl(&self, action: &str, service: &str) -> ValetResult<()> {
        self.runner
            .run(&Invocation::new("systemctl").args([action, service]))
            .await?;
        info!("⚙️ systemctl {} {}", action, service);
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn enable(&self, service: &str) -> ValetResult<()> {
        self.systemctl("enable", service).await
    }

    async fn disable(&self, service: &str) -> ValetResult<()> {
        self.systemctl("disable", service).await
    }

    async fn start(&self, service: &str) -> ValetResult<()> {
        self.systemctl("start", service).await
    }

    async fn stop(&self, service: &str) -> ValetResult<()> {
        self.systemctl("stop", service).await
    }

    async fn restart(&self, service: &str) -> ValetResult<()> {
        self.systemctl("restart", service).await
    }

    async fn is_disabled(&self, service: &str) -> ValetResult<bool> {
        // `is-enabled` exits non-zero for disabled and unknown units alike.
        match self
            .runner
            .run(&Invocation::new("systemctl").args(["is-enabled", service]))
            .await
        {
            Ok(out) => Ok(out.stdout.trim() == "disabled"),
            Err(ValetError::Process { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::testing::FakeRunner;

    #[tokio::test]
    async fn actions_map_to_systemctl() {
        let runner = Arc::new(FakeRunner::default());
        let services = SystemdServiceManager::new(runner.clone());

        services.restart("php7.4-fpm").await.unwrap();
        services.disable("php8.1-fpm").await.unwrap();

        assert_eq!(
            runner.command_lines(),
            vec!["systemctl restart php7.4-fpm", "systemctl disable php8.1-fpm"]
        );
    }

    #[tokio::test]
    async fn failing_is_enabled_reads_as_disabled() {
        let runner = Arc::new(FakeRunner::default());
        runner.fail_on("is-enabled");
        let services = SystemdServiceManager::new(runner);
        assert!(services.is_disabled("php7.4-fpm").await.unwrap());
    }
}
