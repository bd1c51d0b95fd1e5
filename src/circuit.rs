//! Tor control-port client: requests a fresh egress identity (NEWNYM).
//!
//! Side channel only, never on the data path. Failures are reported as
//! `false` and the caller continues with the old identity.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info};

use crate::config::{TorControlConfig, CONTROL_OP_TIMEOUT, NEWNYM_MIN_INTERVAL, NEWNYM_SETTLE};

pub struct CircuitController {
    config: TorControlConfig,
    /// Tor rejects NEWNYM signals arriving faster than this
    min_interval: Duration,
    /// Wait after a successful NEWNYM for the new circuit to establish
    settle: Duration,
    op_timeout: Duration,
    last_change: Option<Instant>,
    identity_changes: u64,
}

impl CircuitController {
    pub fn new(config: TorControlConfig) -> Self {
        Self {
            config,
            min_interval: NEWNYM_MIN_INTERVAL,
            settle: NEWNYM_SETTLE,
            op_timeout: CONTROL_OP_TIMEOUT,
            last_change: None,
            identity_changes: 0,
        }
    }

    /// Override the pacing intervals (tests use short ones).
    pub fn with_timing(mut self, min_interval: Duration, settle: Duration) -> Self {
        self.min_interval = min_interval;
        self.settle = settle;
        self
    }

    /// Number of successful identity changes so far. Never decreases.
    pub fn identity_changes(&self) -> u64 {
        self.identity_changes
    }

    /// Signal the proxy daemon for a new egress identity. Blocks for the
    /// remainder of the minimum inter-signal interval when called early,
    /// and for the settle period after a successful change. Returns `false`
    /// on any failure; the old identity stays in use.
    pub async fn change_identity(&mut self, reason: &str) -> bool {
        if let Some(last) = self.last_change {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!("Waiting {:.1}s before next identity change", wait.as_secs_f64());
                sleep(wait).await;
            }
        }

        match self.signal_newnym().await {
            Ok(()) => {
                self.identity_changes += 1;
                self.last_change = Some(Instant::now());
                info!("🧅 Identity changed [{reason}] (#{})", self.identity_changes);
                sleep(self.settle).await;
                true
            }
            Err(e) => {
                error!("Identity change failed [{reason}]: {e:#}");
                false
            }
        }
    }

    /// AUTHENTICATE then SIGNAL NEWNYM; both must answer with a 250 line.
    async fn signal_newnym(&self) -> Result<()> {
        let stream = timeout(
            self.op_timeout,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        .context("control port connect timed out")?
        .with_context(|| {
            format!("cannot connect to control port {}:{}", self.config.host, self.config.port)
        })?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let auth = match &self.config.password {
            Some(password) => format!("AUTHENTICATE \"{password}\"\r\n"),
            None => "AUTHENTICATE\r\n".to_string(),
        };
        self.send_line(&mut write_half, &auth).await?;
        let response = self.read_line(&mut reader).await?;
        if !response.starts_with("250") {
            bail!("authentication rejected: {}", response.trim());
        }

        self.send_line(&mut write_half, "SIGNAL NEWNYM\r\n").await?;
        let response = self.read_line(&mut reader).await?;
        if !response.starts_with("250") {
            bail!("NEWNYM rejected: {}", response.trim());
        }

        Ok(())
    }

    async fn send_line(
        &self,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        line: &str,
    ) -> Result<()> {
        timeout(self.op_timeout, write_half.write_all(line.as_bytes()))
            .await
            .context("control write timed out")?
            .context("control write failed")?;
        Ok(())
    }

    async fn read_line(
        &self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    ) -> Result<String> {
        let mut line = String::new();
        let n = timeout(self.op_timeout, reader.read_line(&mut line))
            .await
            .context("control read timed out")?
            .context("control read failed")?;
        if n == 0 {
            bail!("control connection closed");
        }
        Ok(line)
    }
}
