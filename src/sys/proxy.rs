use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::config::{DomainConfig, STATIC_PREFIX, ValetConfig};
use crate::error::{ValetError, ValetResult};
use crate::sys::php::PhpVersion;

const SECURE_STUB: &str = include_str!("../../stubs/secure.valet.conf");
const ISOLATED_STUB: &str = include_str!("../../stubs/isolated.valet.conf");
const PROXY_STUB: &str = include_str!("../../stubs/proxy.valet.conf");
const SECURE_PROXY_STUB: &str = include_str!("../../stubs/secure.proxy.valet.conf");
const OPENSSL_STUB: &str = include_str!("../../stubs/openssl.conf");
const FPM_STUB: &str = include_str!("../../stubs/fpm.valet.conf");

/// Trailing tag on the listen directives whose address and comment state we manage.
pub const LOOPBACK_MARKER: &str = "# valet loopback";
/// First line of a config bound to a specific PHP pool.
pub const ISOLATION_PREFIX: &str = "# ISOLATED_PHP_VERSION=";
/// Header naming the stub a config was rendered from.
pub const STUB_PREFIX: &str = "# valet stub: ";

static SOCKET_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"valet[0-9]*\.sock").expect("valid regex"));

static PROXY_PASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"proxy_pass\s+(?P<host>https?://[^\s;]+)\s*;").expect("valid regex")
});

/// 🛡️ Zero-Trust: Strictly validates host names before they reach a path or a config
pub fn validate_domain_format(domain: &str) -> ValetResult<()> {
    if domain.is_empty() {
        return Err(ValetError::InvalidInput("Domain cannot be empty".to_string()));
    }
    if domain.contains("..") || domain.contains('/') || domain.contains('\\') {
        return Err(ValetError::InvalidInput(format!(
            "Path traversal detected in domain: '{}'",
            domain
        )));
    }
    // Allow alphanumeric, dots, hyphens, underscores.
    // Reject everything else (including spaces, quotes, brackets, semicolons)
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(ValetError::InvalidInput(format!(
            "Invalid characters in domain name: '{}'",
            domain
        )));
    }
    Ok(())
}

/// Proxy targets must be absolute http(s) URLs; they land verbatim in `proxy_pass`.
pub fn validate_proxy_target(target: &str) -> ValetResult<()> {
    let valid = (target.starts_with("http://") || target.starts_with("https://"))
        && target.len() > "https://".len()
        && !target.contains(|c: char| c.is_whitespace() || c == ';' || c == '{' || c == '}');
    if !valid {
        return Err(ValetError::InvalidInput(format!(
            "\"{}\" is not a valid URL",
            target
        )));
    }
    Ok(())
}

/// Literal token substitution. Tokens without a value are left in place.
pub fn render(template: &str, placeholders: &[(&str, String)]) -> String {
    placeholders
        .iter()
        .fold(template.to_string(), |text, (token, value)| {
            text.replace(token, value)
        })
}

/// Points every loopback-tagged listen directive at `address`. The directives are
/// commented out when `address` is the canonical loopback (nginx already listens
/// there through the untagged directive) and uncommented otherwise.
pub fn rewrite_loopback(config: &str, address: &str, canonical: &str) -> String {
    let mut conf = SiteConf::parse(config);
    conf.rewrite_loopback(address, canonical);
    conf.to_string()
}

/// Backend URL of a proxy config, if it has a `proxy_pass` directive.
pub fn parse_proxy_target(config: &str) -> Option<String> {
    PROXY_PASS
        .captures(config)
        .map(|caps| caps["host"].to_string())
}

/// Name of the stub a rendered config came from, from its header line.
pub fn stub_name(config: &str) -> Option<&str> {
    config
        .lines()
        .take(2)
        .find_map(|line| line.strip_prefix(STUB_PREFIX))
        .map(str::trim)
}

// ==============================================================================
// 1. Structured line-level representation of a rendered site config
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopbackDirective {
    indent: String,
    commented: bool,
    address: String,
    /// Everything after the address, starting at the port separator.
    rest: String,
}

impl LoopbackDirective {
    fn parse(line: &str) -> Option<Self> {
        if !line.trim_end().ends_with(LOOPBACK_MARKER) {
            return None;
        }
        let body = line.trim_start();
        let indent = line[..line.len() - body.len()].to_string();
        let uncommented = body.trim_start_matches('#');
        let commented = uncommented.len() != body.len();
        let directive = uncommented.trim_start().strip_prefix("listen ")?.trim_start();

        // Bracketed IPv6 addresses carry their own colons.
        let split = if directive.starts_with('[') {
            directive.find("]:").map(|i| i + 1)?
        } else {
            directive.find(':')?
        };

        Some(Self {
            indent,
            commented,
            address: directive[..split].to_string(),
            rest: directive[split..].to_string(),
        })
    }
}

impl fmt::Display for LoopbackDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}listen {}{}",
            self.indent,
            if self.commented { "#" } else { "" },
            self.address,
            self.rest
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConfLine {
    Isolation(String),
    Loopback(LoopbackDirective),
    Text(String),
}

/// A rendered config split into the lines we know how to edit and opaque text.
/// Edits are surgical: every line we do not understand is written back byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConf {
    lines: Vec<ConfLine>,
}

impl SiteConf {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .split('\n')
            .enumerate()
            .map(|(i, line)| match line.strip_prefix(ISOLATION_PREFIX) {
                Some(version) if i == 0 => ConfLine::Isolation(version.trim().to_string()),
                _ => LoopbackDirective::parse(line)
                    .map(ConfLine::Loopback)
                    .unwrap_or_else(|| ConfLine::Text(line.to_string())),
            })
            .collect();
        Self { lines }
    }

    /// Raw version recorded on the isolation marker line.
    pub fn isolated_version(&self) -> Option<&str> {
        match self.lines.first() {
            Some(ConfLine::Isolation(version)) => Some(version),
            _ => None,
        }
    }

    pub fn set_isolated_version(&mut self, version: Option<&PhpVersion>) {
        if matches!(self.lines.first(), Some(ConfLine::Isolation(_))) {
            self.lines.remove(0);
        }
        if let Some(version) = version {
            self.lines.insert(0, ConfLine::Isolation(version.to_string()));
        }
    }

    pub fn rewrite_loopback(&mut self, address: &str, canonical: &str) {
        let comment = address == canonical;
        for line in &mut self.lines {
            if let ConfLine::Loopback(directive) = line {
                directive.address = address.to_string();
                directive.commented = comment;
            }
        }
    }

    /// Swaps every `valet*.sock` reference for `socket_name`.
    pub fn replace_socket(&mut self, socket_name: &str) {
        for line in &mut self.lines {
            if let ConfLine::Text(text) = line {
                if SOCKET_TOKEN.is_match(text) {
                    *text = SOCKET_TOKEN.replace_all(text, socket_name).into_owned();
                }
            }
        }
    }

    pub fn socket_name(&self) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            ConfLine::Text(text) => SOCKET_TOKEN.find(text).map(|m| m.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for SiteConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            match line {
                ConfLine::Isolation(version) => write!(f, "{}{}", ISOLATION_PREFIX, version)?,
                ConfLine::Loopback(directive) => write!(f, "{}", directive)?,
                ConfLine::Text(text) => f.write_str(text)?,
            }
        }
        Ok(())
    }
}

// ==============================================================================
// 2. Rendering Engine
// ==============================================================================

/// Renders nginx, openssl and FPM pool configs from the bundled stubs. Pure text
/// transforms: writing the result is the caller's job.
#[derive(Clone, Debug)]
pub struct SiteConfigEngine {
    home: PathBuf,
    server_path: PathBuf,
    certificates: PathBuf,
}

impl SiteConfigEngine {
    pub fn new(config: &ValetConfig) -> Self {
        Self {
            home: config.home.clone(),
            server_path: config.server_path.clone(),
            certificates: config.certificates_path(),
        }
    }

    fn base_placeholders(&self, host: &str) -> Vec<(&'static str, String)> {
        vec![
            ("VALET_HOME_PATH", self.home.display().to_string()),
            ("VALET_SERVER_PATH", self.server_path.display().to_string()),
            ("VALET_STATIC_PREFIX", STATIC_PREFIX.to_string()),
            ("VALET_SITE", host.to_string()),
        ]
    }

    fn port_placeholders(domain: &DomainConfig) -> Vec<(&'static str, String)> {
        let redirect = if domain.https_port == 443 {
            String::new()
        } else {
            format!(":{}", domain.https_port)
        };
        vec![
            ("VALET_HTTPS_PORT", domain.https_port.to_string()),
            ("VALET_HTTP_PORT", domain.port.to_string()),
            ("VALET_REDIRECT_PORT", redirect),
        ]
    }

    /// Proxy config for `host`. The secure variant still carries the certificate
    /// placeholders; `build_secure_server_config` fills those in.
    pub fn build_proxy_config(
        &self,
        host: &str,
        target: &str,
        secure: bool,
        domain: &DomainConfig,
    ) -> String {
        let stub = if secure { SECURE_PROXY_STUB } else { PROXY_STUB };
        let conf = rewrite_loopback(stub, &domain.loopback, crate::config::DEFAULT_LOOPBACK);

        let mut placeholders = self.base_placeholders(host);
        placeholders.push(("VALET_PROXY_HOST", target.to_string()));
        if !secure {
            placeholders.extend(Self::port_placeholders(domain));
        }
        render(&conf, &placeholders)
    }

    /// TLS server config for `host`, either fresh from the secure stub or by
    /// injecting certificate paths into an already customised config.
    pub fn build_secure_server_config(
        &self,
        host: &str,
        existing: Option<&str>,
        domain: &DomainConfig,
    ) -> String {
        let conf = match existing {
            Some(conf) => conf.to_string(),
            None => rewrite_loopback(SECURE_STUB, &domain.loopback, crate::config::DEFAULT_LOOPBACK),
        };

        let mut placeholders = self.base_placeholders(host);
        placeholders.push((
            "VALET_CERT",
            self.certificates.join(format!("{}.crt", host)).display().to_string(),
        ));
        placeholders.push((
            "VALET_KEY",
            self.certificates.join(format!("{}.key", host)).display().to_string(),
        ));
        placeholders.extend(Self::port_placeholders(domain));
        render(&conf, &placeholders)
    }

    /// Plain HTTP config that routes `host` to the pool for `version`.
    pub fn build_isolated_config(
        &self,
        host: &str,
        version: &PhpVersion,
        domain: &DomainConfig,
    ) -> String {
        let conf = rewrite_loopback(ISOLATED_STUB, &domain.loopback, crate::config::DEFAULT_LOOPBACK);
        let mut placeholders = self.base_placeholders(host);
        placeholders.push(("VALET_PHP_FPM_SOCKET", version.socket_name()));
        placeholders.push(("VALET_ISOLATED_PHP_VERSION", version.to_string()));
        placeholders.extend(Self::port_placeholders(domain));
        render(&conf, &placeholders)
    }

    /// OpenSSL request config whose SAN covers `host` and its subdomains.
    pub fn build_certificate_conf(&self, host: &str) -> String {
        render(OPENSSL_STUB, &[("VALET_DOMAIN", host.to_string())])
    }

    pub fn build_pool_config(&self, user: &str, group: &str, version: &PhpVersion) -> String {
        render(
            FPM_STUB,
            &[
                ("VALET_USER", user.to_string()),
                ("VALET_GROUP", group.to_string()),
                ("VALET_HOME_PATH", self.home.display().to_string()),
                ("VALET_FPM_SOCKET", version.socket_name()),
            ],
        )
    }
}
