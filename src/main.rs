// src/main.rs

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod sys;
mod valet;

use crate::config::ValetConfig;
use crate::error::ValetResult;
use crate::valet::ValetService;

#[derive(Parser)]
#[command(name = "valet", version, about = "Local development environment manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a site over trusted TLS
    Secure { name: String },
    /// Stop serving a site over TLS
    Unsecure { name: String },
    /// List secured hosts and their certificate expiry
    Secured,
    /// Route a host to another local service
    Proxy {
        name: String,
        target: String,
        #[arg(long)]
        secure: bool,
    },
    /// Remove a proxied host
    Unproxy { name: String },
    /// List proxied hosts
    Proxies,
    /// Pin a site to a specific PHP version
    Isolate {
        version: String,
        #[arg(long, default_value = ".")]
        site: String,
    },
    /// Return a site to the global PHP version
    Unisolate {
        #[arg(long, default_value = ".")]
        site: String,
    },
    /// List sites pinned to a PHP version
    Isolated,
    /// Change the global PHP version (`default` for the distribution's)
    Use { version: String },
    /// Show or change the TLD sites are served under
    Domain { domain: Option<String> },
    /// List parked and linked sites
    #[command(alias = "links")]
    Sites,
    /// Add the root CA to the system and browser trust stores
    Trust,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(valet: &ValetService, command: Command) -> ValetResult<()> {
    match command {
        Command::Secure { name } => {
            let host = valet.secure(&name).await?;
            println!("The [{}] site has been secured with a fresh TLS certificate.", host);
        }
        Command::Unsecure { name } => {
            let host = valet.unsecure(&name).await?;
            println!("The [{}] site will now serve traffic over HTTP.", host);
        }
        Command::Secured => {
            for site in valet.list_secured().await? {
                match site.expires {
                    Some(expires) => println!("{}\t{}", site.host, expires.format("%Y-%m-%d")),
                    None => println!("{}", site.host),
                }
            }
        }
        Command::Proxy {
            name,
            target,
            secure,
        } => {
            let host = valet.proxy_create(&name, &target, secure).await?;
            println!("Valet will now proxy [{}] traffic to [{}].", host, target);
        }
        Command::Unproxy { name } => {
            let host = valet.proxy_delete(&name).await?;
            println!("Valet will no longer proxy [{}].", host);
        }
        Command::Proxies => {
            for proxy in valet.list_proxies().await? {
                let scheme = if proxy.secured { "https" } else { "http" };
                println!("{}://{}\t{}", scheme, proxy.host, proxy.target);
            }
        }
        Command::Isolate { version, site } => {
            let host = valet.isolate(&site, &version).await?;
            println!("The [{}] site is now using PHP {}.", host, version);
        }
        Command::Unisolate { site } => {
            let host = valet.unisolate(&site).await?;
            println!("The [{}] site is now using the global PHP version.", host);
        }
        Command::Isolated => {
            for (host, version) in valet.list_isolated().await? {
                println!("{}\t{}", host, version);
            }
        }
        Command::Use { version } => {
            let global = valet.change_global_version(&version).await?;
            println!("Valet is now using PHP {}.", global);
        }
        Command::Domain { domain: None } => println!("{}", valet.domain().await?),
        Command::Domain {
            domain: Some(domain),
        } => {
            valet.change_domain(&domain).await?;
            println!("Your Valet domain has been updated to [{}].", domain.trim_start_matches('.'));
        }
        Command::Sites => {
            for site in valet.sites().await? {
                let scheme = if site.secured { "https" } else { "http" };
                let php = site
                    .isolated_version
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                println!(
                    "{}\t{}://{}\t{}\t{}",
                    site.name,
                    scheme,
                    site.host,
                    site.proxy_target
                        .unwrap_or_else(|| site.path.display().to_string()),
                    php
                );
            }
        }
        Command::Trust => {
            valet.trust().await?;
            println!("The Valet root CA is trusted.");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ==============================================================================
    // 1. Configuration & Logging
    // ==============================================================================

    let config = match ValetConfig::load() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(false);
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.json_logs);

    // ==============================================================================
    // 2. Dependency Injection & Dispatch
    // ==============================================================================

    let valet = ValetService::new(config);
    match dispatch(&valet, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
