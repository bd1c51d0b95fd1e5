//! One-shot connection probe: dial the streaming endpoint (optionally
//! through a proxy), subscribe a single wallet, and print inbound frames
//! until the target channel message arrives or the deadline passes.
//!
//! Usage: `probe_ws <wallet-address>` (reads PROXY_URL from the
//! environment like the monitor does).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

use hlmon::config::{AppConfig, CHANNEL_MARKER, CONNECT_TIMEOUT};
use hlmon::fingerprint::FingerprintFactory;
use hlmon::session;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("probe_ws=info,hlmon=debug").init();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let wallet = std::env::args().nth(1).context("usage: probe_ws <wallet-address>")?;

    info!("[*] Target wallet: {wallet}");
    match &config.proxy {
        Some(p) => info!("[*] Proxy: {}:{}", p.host, p.port),
        None => info!("[*] Proxy: none"),
    }

    let factory = FingerprintFactory::new()?;
    let profile = factory.create();

    info!("[*] Connecting…");
    let mut ws = session::connect(&profile, config.proxy.as_ref(), CONNECT_TIMEOUT).await?;
    info!("[✓] WebSocket connected");

    let subscribe = serde_json::json!({
        "method": "subscribe",
        "subscription": { "type": CHANNEL_MARKER, "user": wallet }
    });
    ws.send(Message::Text(subscribe.to_string())).await?;
    info!("[✓] Subscription sent, waiting for data…");

    let deadline = Instant::now() + Duration::from_secs(60);
    while Instant::now() < deadline {
        let frame = match timeout(Duration::from_secs(10), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => bail!("receive error: {e}"),
            Ok(None) => bail!("stream closed"),
            Err(_) => {
                info!("[…] Still waiting");
                continue;
            }
        };

        info!("[frame] {} bytes", frame.len());
        if frame.contains(CHANNEL_MARKER) {
            println!("{frame}");
            info!("[🎯] Target channel message received");
            let _ = ws.close(None).await;
            return Ok(());
        }
    }

    bail!("no matching message within the deadline")
}
