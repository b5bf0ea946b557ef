//! wgctl Daemon
//!
//! Runs the WireGuard controller: reconciliation, push bus, liveness
//! monitor and control API.

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgctl_common::{Database, FieldCipher, WgKey, WgKeyPair};
use wgctl_daemon::alerts::{AlertSink, LogAlertSink, WebhookAlertSink};
use wgctl_daemon::api;
use wgctl_daemon::config::ControllerConfig;
use wgctl_daemon::controller::{Controller, HostInterfaces};
use wgctl_daemon::device::WgCommandDevice;
use wgctl_daemon::dns::DnsmasqWriter;
use wgctl_daemon::routes::IpRouteTable;

#[derive(Parser)]
#[command(name = "wgctld")]
#[command(about = "wgctl daemon - WireGuard star-topology controller")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/wgctl/config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Hub interface private key (base64)
    #[arg(long, env = "WGCTL_WG_PRIVATE_KEY", hide_env_values = true)]
    wg_private_key: Option<String>,

    /// Key encrypting peer secrets at rest (base64, 32 bytes)
    #[arg(long, env = "WGCTL_DB_AES_KEY", hide_env_values = true)]
    db_key: Option<String>,

    /// Master admin account, created or reset at startup
    #[arg(long, env = "WGCTL_ADMIN_EMAIL")]
    admin_email: Option<String>,

    #[arg(long, env = "WGCTL_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller (default)
    Serve,
    /// Print a fresh WireGuard key pair
    GenerateWgKey,
    /// Print a fresh at-rest encryption key
    GenerateDbKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::GenerateWgKey) => {
            let keys = WgKeyPair::generate();
            println!("private_key = {}", keys.private_key);
            println!("public_key  = {}", keys.public_key);
            return Ok(());
        }
        Some(Command::GenerateDbKey) => {
            println!("{}", STANDARD.encode(FieldCipher::generate_key().as_slice()));
            return Ok(());
        }
        Some(Command::Serve) | None => {}
    }

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("wgctl daemon v{}", env!("CARGO_PKG_VERSION"));
    serve(cli).await
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let config = ControllerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let private_key: WgKey = cli
        .wg_private_key
        .context("WGCTL_WG_PRIVATE_KEY is not set")?
        .parse()
        .context("invalid WireGuard private key")?;
    let cipher = FieldCipher::from_base64(&cli.db_key.context("WGCTL_DB_AES_KEY is not set")?)
        .context("invalid database key")?;

    tokio::fs::create_dir_all(&config.store_path).await?;
    let db = Database::open(config.db_path(), cipher)?;
    info!("Opened peer store at {}", config.db_path().display());

    let device = WgCommandDevice::new(config.network.interface.clone());
    device
        .configure(&private_key, config.network.listen_port)
        .await?;

    let host = HostInterfaces {
        device: Arc::new(device),
        routes: Arc::new(IpRouteTable::new()),
        dns: Arc::new(DnsmasqWriter::new(
            config.dns.hosts_file.clone(),
            config.dns.pid_file.clone(),
        )),
    };

    let alerts: Arc<dyn AlertSink> = match &config.alerts.webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(
            url.clone(),
            config.alerts.dashboard_url.clone(),
        )?),
        None => Arc::new(LogAlertSink),
    };

    let controller = Arc::new(Controller::new(
        config.clone(),
        db,
        host,
        alerts,
        private_key.public_key(),
        cli.admin_email.clone(),
    ));

    if let Some(email) = &cli.admin_email {
        let password = cli
            .admin_password
            .as_deref()
            .context("WGCTL_ADMIN_PASSWORD is required with WGCTL_ADMIN_EMAIL")?;
        controller.auth().bootstrap_admin(email, password)?;
    } else {
        warn!("No admin account configured, only existing credentials can log in");
    }

    let summary = controller.resync().await;
    if !summary.is_ok() {
        warn!("Initial reconciliation incomplete: {:?}", summary);
    }

    let background = controller.spawn_background();

    let api_controller = controller.clone();
    let listen = config.api_listen.clone();
    let mut api_handle = tokio::spawn(async move { api::serve(api_controller, &listen).await });
    let mut api_done = false;

    // Wait for shutdown signal
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        result = &mut api_handle => {
            api_done = true;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Control API error: {}", e),
                Err(e) => error!("Control API task failed: {}", e),
            }
        }
    }

    controller.shutdown_token().cancel();
    futures::future::join_all(background).await;
    if !api_done {
        if let Err(e) = api_handle.await {
            error!("Control API task failed: {}", e);
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
