// src/sys/process.rs

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ValetError, ValetResult};
use crate::sys::traits::{CommandOutput, CommandRunner, Invocation};

/// Runs external programs directly (no shell). Subprocesses have no timeout:
/// a hung command blocks the operation, callers wrap the binary if they need one.
pub struct SystemCommandRunner {
    /// Account to drop to for `run_as_user` when we hold root.
    user: Option<String>,
}

impl SystemCommandRunner {
    pub fn new(user: Option<String>) -> Self {
        Self { user }
    }

    async fn execute(&self, line: String, mut command: Command) -> ValetResult<CommandOutput> {
        debug!(command = %line, "running");

        let output = command.output().await.map_err(|e| ValetError::Spawn {
            command: line.clone(),
            source: e,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(ValetError::Process {
                command: line,
                code: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, invocation: &Invocation) -> ValetResult<CommandOutput> {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        self.execute(invocation.to_string(), command).await
    }

    async fn run_as_user(&self, invocation: &Invocation) -> ValetResult<CommandOutput> {
        let target = self.user.as_deref().filter(|u| *u != "root");

        match target {
            // Use `runuser` to drop privileges, same as the unprivileged build jail.
            Some(user) if nix::unistd::geteuid().is_root() => {
                let mut command = Command::new("runuser");
                command
                    .arg("-u")
                    .arg(user)
                    .arg("--")
                    .arg(&invocation.program)
                    .args(&invocation.args);
                self.execute(format!("runuser -u {} -- {}", user, invocation), command)
                    .await
            }
            _ => self.run(invocation).await,
        }
    }
}
