// 🛡️ Zero-Trust Architecture: every system effect goes through one of these managers.

pub mod traits;     // Global contracts
pub mod process;    // Command execution (no shell)
pub mod files;      // Ownership-aware file access
pub mod systemd;    // Service control
pub mod packages;   // APT package queries and installs
pub mod proxy;      // Nginx config rendering & patching
pub mod ssl;        // Local certificate authority
pub mod trust;      // OS and browser trust stores
pub mod sites;      // Site catalogue & per-host configs
pub mod php;        // PHP-FPM pools and version isolation

#[cfg(test)]
pub mod testing;    // In-memory collaborators
