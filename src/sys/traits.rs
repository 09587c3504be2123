use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::ValetResult;
use crate::sys::php::PhpVersion;

// ==============================================================================
// 1. Process Execution (No Shell Interpretation)
// ==============================================================================

/// 🛡️ Discrete program + argv. Nothing is ever handed to `sh -c`, so hostnames
/// and paths cannot smuggle shell syntax into a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value following `flag` in the argument list, e.g. `-out` -> path.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) || arg.is_empty() {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs with the agent's own privileges. Non-zero exit is a `Process` error.
    async fn run(&self, invocation: &Invocation) -> ValetResult<CommandOutput>;

    /// Runs as the developer Valet acts for, dropping root when under sudo.
    async fn run_as_user(&self, invocation: &Invocation) -> ValetResult<CommandOutput>;
}

// ==============================================================================
// 2. Package Management (Interpreter Pools)
// ==============================================================================

#[async_trait]
pub trait PackageManager: Send + Sync {
    async fn is_installed(&self, package: &str) -> ValetResult<bool>;

    /// Installs `package` unless it is already present.
    async fn ensure_installed(&self, package: &str) -> ValetResult<()>;

    /// PHP versions the distribution can provide an FPM pool for.
    async fn supported_versions(&self) -> ValetResult<BTreeSet<PhpVersion>>;

    /// The PHP version the distribution treats as its default, if it has one.
    async fn default_version(&self) -> ValetResult<Option<PhpVersion>>;
}
