//! Multi-Target Wallet Snapshot Monitor
//!
//! Iterates a wallet list indefinitely, opening one fingerprint-rotated
//! WebSocket session per wallet through an optional SOCKS5/HTTP proxy,
//! waiting for the account-snapshot message and persisting it to SQLite.
//! Runs until interrupted.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use hlmon::circuit::CircuitController;
use hlmon::config::AppConfig;
use hlmon::fingerprint::FingerprintFactory;
use hlmon::monitor::{MonitorLoop, Pacer};
use hlmon::rotation::RotationScheduler;
use hlmon::session::SessionConfig;
use hlmon::storage::{spawn_persister, RetryPolicy};
use hlmon::wallets::load_wallets;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with both stdout and file output
    let file_appender = tracing_appender::rolling::never(".", "hlmon.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("hlmon=info".parse().context("bad log directive")?);

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    let wallets = load_wallets(&config.wallets_file)?;

    info!("{}", "=".repeat(60));
    info!("🚀 Starting Wallet Snapshot Monitor");
    info!("📋 Wallets: {}", wallets.len());
    info!("🔒 Fingerprint rotation: every {} wallets", config.ssl_rotate_interval);
    info!("🧅 Identity rotation: every {} wallets", config.tor_rotate_interval);
    match &config.proxy {
        Some(p) => info!("🧅 Proxy: {}:{}", p.host, p.port),
        None => info!("🔌 Proxy: none (direct)"),
    }
    info!("🎛️  Control port: {}:{}", config.tor_control.host, config.tor_control.port);
    info!("⏱️  Session deadline: {}s per wallet", config.session_deadline.as_secs());
    info!("💾 Database: {}", config.db_path);
    info!("{}", "=".repeat(60));

    let factory = FingerprintFactory::new()?;
    let controller = CircuitController::new(config.tor_control.clone());
    let scheduler = RotationScheduler::new(
        factory,
        controller,
        config.ssl_rotate_interval,
        config.tor_rotate_interval,
    );
    let persist = spawn_persister(&config.db_path, RetryPolicy::default());

    let session_config = SessionConfig { deadline: config.session_deadline, ..Default::default() };
    let pacer = match config.pacing {
        Some((min, max)) => Pacer::Jitter { min, max },
        None => Pacer::None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("⏹️  Interrupt received, shutting down…");
        let _ = shutdown_tx.send(true);
    });

    let mut monitor = MonitorLoop::new(
        wallets,
        scheduler,
        persist,
        session_config,
        config.proxy.clone(),
        pacer,
    );
    monitor.run(shutdown_rx).await;

    Ok(())
}
