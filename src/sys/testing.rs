//! In-memory collaborators for unit tests.
//!
//! `FakeRunner` simulates just enough of `openssl` (artifact files appear where
//! `-out`/`-keyout` point) and `certutil` (a nickname multiset per database) for the
//! certificate and trust flows to be exercised end to end on a temp directory.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{ValetError, ValetResult};
use crate::sys::php::PhpVersion;
use crate::sys::systemd::ServiceManager;
use crate::sys::traits::{CommandOutput, CommandRunner, Invocation, PackageManager};

fn simulated_failure(command: String) -> ValetError {
    ValetError::Process {
        command,
        code: 1,
        stderr: "simulated failure".into(),
    }
}

#[derive(Default)]
struct RunnerState {
    log: Vec<Invocation>,
    failures: Vec<String>,
    responses: Vec<(String, String)>,
    trust: BTreeMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<RunnerState>,
}

impl FakeRunner {
    /// Any command line containing `pattern` exits non-zero.
    pub fn fail_on(&self, pattern: &str) {
        self.state.lock().unwrap().failures.push(pattern.to_string());
    }

    /// Any command line containing `pattern` prints `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((pattern.to_string(), stdout.to_string()));
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Nicknames currently trusted in the certutil database `db` (e.g. `sql:/..`).
    pub fn trusted(&self, db: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .trust
            .get(db)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// How many entries named `nickname` the database `db` holds.
    pub fn trust_entries(&self, db: &str, nickname: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .trust
            .get(db)
            .map(|entries| entries.iter().filter(|n| *n == nickname).count())
            .unwrap_or_default()
    }

    fn handle(&self, invocation: &Invocation) -> ValetResult<CommandOutput> {
        let line = invocation.to_string();
        let mut state = self.state.lock().unwrap();
        state.log.push(invocation.clone());

        if state.failures.iter().any(|p| line.contains(p.as_str())) {
            return Err(simulated_failure(line));
        }

        match invocation.program.as_str() {
            "openssl" => simulate_openssl(invocation),
            "certutil" => {
                let db = invocation.flag_value("-d").unwrap_or_default().to_string();
                let nick = invocation.flag_value("-n").unwrap_or_default().to_string();
                let entries = state.trust.entry(db).or_default();
                let found = entries.iter().position(|n| *n == nick);
                if invocation.has_flag("-A") {
                    entries.push(nick);
                } else if invocation.has_flag("-D") || invocation.has_flag("-L") {
                    let Some(index) = found else {
                        return Err(simulated_failure(line));
                    };
                    if invocation.has_flag("-D") {
                        entries.remove(index);
                    }
                }
            }
            _ => {}
        }

        let stdout = state
            .responses
            .iter()
            .find(|(p, _)| line.contains(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
        })
    }
}

fn simulate_openssl(invocation: &Invocation) {
    for flag in ["-out", "-keyout"] {
        if let Some(path) = invocation.flag_value(flag) {
            let _ = std::fs::write(path, format!("fake {} {}", invocation.args[0], flag));
        }
    }
    if invocation.has_flag("-CAcreateserial") {
        if let Some(ca) = invocation.flag_value("-CA") {
            let _ = std::fs::write(Path::new(ca).with_extension("srl"), "01");
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> ValetResult<CommandOutput> {
        self.handle(invocation)
    }

    async fn run_as_user(&self, invocation: &Invocation) -> ValetResult<CommandOutput> {
        self.handle(invocation)
    }
}

// ==============================================================================
// Service manager
// ==============================================================================

#[derive(Default)]
struct ServiceState {
    log: Vec<String>,
    running: BTreeSet<String>,
    disabled: BTreeSet<String>,
}

#[derive(Default)]
pub struct FakeServices {
    state: Mutex<ServiceState>,
}

impl FakeServices {
    pub fn with_running(services: &[&str]) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().running = services.iter().map(|s| s.to_string()).collect();
        fake
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.state.lock().unwrap().running.contains(service)
    }

    pub fn disabled(&self, service: &str) -> bool {
        self.state.lock().unwrap().disabled.contains(service)
    }

    fn record(&self, action: &str, service: &str) -> ValetResult<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(format!("{} {}", action, service));
        match action {
            "enable" => {
                state.disabled.remove(service);
            }
            "disable" => {
                state.disabled.insert(service.to_string());
            }
            "start" | "restart" => {
                state.running.insert(service.to_string());
            }
            "stop" => {
                state.running.remove(service);
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for FakeServices {
    async fn enable(&self, service: &str) -> ValetResult<()> {
        self.record("enable", service)
    }

    async fn disable(&self, service: &str) -> ValetResult<()> {
        self.record("disable", service)
    }

    async fn start(&self, service: &str) -> ValetResult<()> {
        self.record("start", service)
    }

    async fn stop(&self, service: &str) -> ValetResult<()> {
        self.record("stop", service)
    }

    async fn restart(&self, service: &str) -> ValetResult<()> {
        self.record("restart", service)
    }

    async fn is_disabled(&self, service: &str) -> ValetResult<bool> {
        Ok(self.disabled(service))
    }
}

// ==============================================================================
// Package manager
// ==============================================================================

pub struct FakePackages {
    installed: Mutex<BTreeSet<String>>,
    uninstallable: BTreeSet<String>,
    supported: BTreeSet<PhpVersion>,
    default: Option<PhpVersion>,
}

impl FakePackages {
    /// `supported` versions are installable; `installed` ones are present already.
    pub fn new(default: &str, supported: &[&str], installed: &[&str]) -> Self {
        let parse = |v: &str| PhpVersion::parse(v).unwrap();
        Self {
            installed: Mutex::new(
                installed
                    .iter()
                    .map(|v| format!("php{}-fpm", parse(v)))
                    .collect(),
            ),
            uninstallable: BTreeSet::new(),
            supported: supported.iter().map(|v| parse(v)).collect(),
            default: Some(parse(default)),
        }
    }

    pub fn uninstallable(mut self, package: &str) -> Self {
        self.uninstallable.insert(package.to_string());
        self
    }

    pub fn installed(&self, package: &str) -> bool {
        self.installed.lock().unwrap().contains(package)
    }
}

#[async_trait]
impl PackageManager for FakePackages {
    async fn is_installed(&self, package: &str) -> ValetResult<bool> {
        Ok(self.installed(package))
    }

    async fn ensure_installed(&self, package: &str) -> ValetResult<()> {
        if self.uninstallable.contains(package) {
            return Err(simulated_failure(format!("apt-get install -y -q {}", package)));
        }
        self.installed.lock().unwrap().insert(package.to_string());
        Ok(())
    }

    async fn supported_versions(&self) -> ValetResult<BTreeSet<PhpVersion>> {
        Ok(self.supported.clone())
    }

    async fn default_version(&self) -> ValetResult<Option<PhpVersion>> {
        Ok(self.default)
    }
}
