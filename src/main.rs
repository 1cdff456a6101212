//! rewroute: serve chosen domains locally, forward everything else.

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use rewroute::config::{load_config, schema::default_hosts_path, InterceptorConfig, ObservabilityConfig};
use rewroute::dns::NameOverrideManager;
use rewroute::lifecycle::{wait_for_signal, Interceptor, InterceptorError, StartOptions};
use rewroute::observability::{init_logging, init_metrics};
use rewroute::routing::Domain;
use rewroute::sites::build_sites;

#[derive(Parser)]
#[command(name = "rewroute")]
#[command(about = "Intercept HTTP traffic for chosen domains", long_about = None, version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured sites until SIGINT/SIGTERM
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Only override this domain in the hosts file
        #[arg(short, long)]
        domain: Option<String>,
        /// Port to listen on (repeatable); replaces listener.ports
        #[arg(short, long = "port")]
        ports: Vec<u16>,
        /// Do not touch the hosts file
        #[arg(long)]
        no_hosts: bool,
    },
    /// Undo hosts-file changes left behind by a crashed run
    Restore {
        #[arg(long)]
        hosts: Option<PathBuf>,
    },
    /// Validate a configuration file and list its sites
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            domain,
            ports,
            no_hosts,
        } => run(config, domain, ports, no_hosts).await,
        Commands::Restore { hosts } => {
            init_logging(&ObservabilityConfig::default())?;
            let path = hosts.unwrap_or_else(|| PathBuf::from(default_hosts_path()));
            if NameOverrideManager::recover(&path)? {
                println!("Restored {}", path.display());
            } else {
                println!("Nothing to restore in {}", path.display());
            }
            Ok(())
        }
        Commands::Check { config } => {
            let config = load_config(&config)?;
            for (domain, routes) in build_sites(&config.sites)? {
                println!("{}", domain);
                for route in routes.routes() {
                    let methods: Vec<&str> = route.methods().iter().map(|m| m.as_str()).collect();
                    println!("  {} [{}]", route.template(), methods.join(", "));
                }
            }
            println!("Configuration OK");
            Ok(())
        }
    }
}

async fn run(
    config_path: Option<PathBuf>,
    domain: Option<String>,
    ports: Vec<u16>,
    no_hosts: bool,
) -> Result<(), Box<dyn Error>> {
    let config = match &config_path {
        Some(path) => load_config(path)?,
        None => InterceptorConfig::default(),
    };
    init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        ports = ?config.listener.ports,
        hosts = %config.name_override.hosts_path,
        "rewroute starting"
    );

    if config.observability.metrics_enabled {
        init_metrics(config.observability.metrics_address.parse()?)?;
    }

    let mut interceptor = Interceptor::new(config.clone());
    for (domain, routes) in build_sites(&config.sites)? {
        interceptor.register_domain(domain, routes)?;
    }
    if interceptor.list_registered_domains().is_empty() {
        return Err("no [[sites]] configured; nothing to intercept".into());
    }

    let mut options = StartOptions::from_config(&config);
    if let Some(domain) = domain {
        options.domain = Some(Domain::parse(&domain)?);
    }
    if !ports.is_empty() {
        options.ports = ports;
    }
    if no_hosts {
        options.apply_name_override = false;
    }
    interceptor.start(options).await?;

    let signal = wait_for_signal().await;
    tracing::info!(signal = %signal, "Shutdown signal received");

    let forced = tokio::select! {
        result = interceptor.stop() => {
            result?;
            false
        }
        signal = wait_for_signal() => {
            tracing::warn!(signal = %signal, "Second signal received, skipping drain");
            true
        }
    };
    if forced {
        match interceptor.abort().await {
            Ok(()) => {}
            // the interrupted stop already got as far as restoring
            Err(InterceptorError::NotRunning) => interceptor.overrides().restore_all()?,
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
