/// certfleet daemon: coordinated certificate lifecycle over a shared store
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use certfleet::acme::{AcmeIssuer, AcmeOptions};
use certfleet::config::Config;
use certfleet::deploy::Deployer;
use certfleet::dns::ProviderRegistry;
use certfleet::error::Result;
use certfleet::lock::LockManager;
use certfleet::manager::{CertManager, ManagerOptions};
use certfleet::scheduler::{Scheduler, SchedulerOptions};
use certfleet::store::{KvStore, etcd::EtcdStore};

#[derive(Parser)]
#[command(name = "certfleet")]
#[command(about = "TLS certificate lifecycle platform", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(global = true, short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lifecycle daemon
    Run(RunArgs),

    /// Validate a configuration file and print the effective settings
    CheckConfig(CheckConfigArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Config file path (TOML format)
    #[arg(short, long, default_value = "certfleet.toml")]
    config: PathBuf,
}

#[derive(Parser)]
struct CheckConfigArgs {
    /// Config file path (TOML format)
    #[arg(short, long, default_value = "certfleet.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::CheckConfig(args) => check_config(args),
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)?
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn check_config(args: CheckConfigArgs) -> Result<()> {
    let config = load_config(&args.config)?;
    println!("{}", toml::to_string_pretty(&config).unwrap_or_default());
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let config = load_config(&args.config)?;

    let store: Arc<dyn KvStore> = Arc::new(
        EtcdStore::connect(config.store.endpoints.clone(), config.connect_timeout()).await?,
    );
    tracing::info!(endpoints = ?config.store.endpoints, "connected to shared store");

    let locks = LockManager::new(
        Arc::clone(&store),
        &config.store.namespace,
        config.session_ttl(),
    )
    .await?;
    tracing::info!(owner = %locks.owner(), "lock session established");

    let scheduler = Scheduler::new(
        &locks,
        SchedulerOptions {
            max_workers: config.scheduler.max_workers,
            ..SchedulerOptions::default()
        },
    );

    let registry = Arc::new(ProviderRegistry::new());
    let issuer = Arc::new(AcmeIssuer::new(
        AcmeOptions {
            contact_email: config.acme.contact_email.clone(),
            staging: config.acme.staging,
            directory_url: config.acme.directory_url.clone(),
            cert_dir: PathBuf::from(&config.acme.cert_dir),
        },
        Arc::clone(&registry),
    ));
    let deployer = Arc::new(Deployer::new());

    let manager = CertManager::new(
        Arc::clone(&store),
        issuer,
        deployer,
        ManagerOptions {
            namespace: config.store.namespace.clone(),
            cert_dir: PathBuf::from(&config.acme.cert_dir),
            renew_before_days: config.renewal.renew_before_days,
            check_interval: config.check_interval(),
            check_initial_delay: config.initial_delay(),
            check_timeout: config.check_timeout(),
        },
    );

    manager.register_check_task(&scheduler)?;
    scheduler.start();
    tracing::info!("certfleet daemon started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    manager.shutdown();
    scheduler.shutdown().await;
    locks.close().await;
    tracing::info!("certfleet daemon stopped");
    Ok(())
}
