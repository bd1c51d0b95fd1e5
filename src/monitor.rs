//! Top-level orchestration: iterate the wallet list forever, rotating
//! identities on schedule and on failure, and persist every match.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::config::ProxyEndpoint;
use crate::rotation::RotationScheduler;
use crate::session::{self, FailureKind, SessionConfig, SessionOutcome};
use crate::storage::PersistHandle;
use crate::wallets::prefix;

/// Circular cursor over the immutable wallet list. Every wallet is visited
/// exactly once per lap.
pub struct WalletRing {
    wallets: Vec<String>,
    index: usize,
}

impl WalletRing {
    pub fn new(wallets: Vec<String>) -> Self {
        Self { wallets, index: 0 }
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    pub fn current(&self) -> &str {
        &self.wallets[self.index]
    }

    /// Move to the next wallet; returns true when the cursor wrapped back
    /// to the start of the list.
    pub fn advance(&mut self) -> bool {
        self.index = (self.index + 1) % self.wallets.len();
        self.index == 0
    }
}

/// Running counters. Monotone; read for the per-wallet progress line and
/// the final summary.
#[derive(Debug)]
pub struct MonitorStats {
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub connection_errors: u64,
    pub started: Instant,
}

impl MonitorStats {
    fn new() -> Self {
        Self { processed: 0, successful: 0, failed: 0, connection_errors: 0, started: Instant::now() }
    }

    /// Fold one session outcome into the counters.
    pub fn record(&mut self, outcome: &SessionOutcome) {
        self.processed += 1;
        match outcome {
            SessionOutcome::Success => self.successful += 1,
            SessionOutcome::DataRejected => self.failed += 1,
            SessionOutcome::Failure(_) => {
                self.failed += 1;
                self.connection_errors += 1;
            }
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.successful as f64 / self.processed as f64 * 100.0
        }
    }
}

/// Optional inter-wallet pacing hook. Flavor only: it never gates rotation
/// or persistence.
#[derive(Debug, Clone)]
pub enum Pacer {
    None,
    Jitter { min: Duration, max: Duration },
}

impl Pacer {
    pub async fn pause(&self) {
        match self {
            Pacer::None => {}
            Pacer::Jitter { min, max } => {
                let wait = {
                    let mut rng = rand::thread_rng();
                    let span = max.as_millis().saturating_sub(min.as_millis()) as u64;
                    *min + Duration::from_millis(rng.gen_range(0..=span))
                };
                sleep(wait).await;
            }
        }
    }
}

pub struct MonitorLoop {
    ring: WalletRing,
    scheduler: RotationScheduler,
    persist: PersistHandle,
    session_config: SessionConfig,
    proxy: Option<ProxyEndpoint>,
    pacer: Pacer,
    stats: MonitorStats,
}

impl MonitorLoop {
    pub fn new(
        wallets: Vec<String>,
        scheduler: RotationScheduler,
        persist: PersistHandle,
        session_config: SessionConfig,
        proxy: Option<ProxyEndpoint>,
        pacer: Pacer,
    ) -> Self {
        Self {
            ring: WalletRing::new(wallets),
            scheduler,
            persist,
            session_config,
            proxy,
            pacer,
            stats: MonitorStats::new(),
        }
    }

    /// Run until the shutdown signal flips. Each iteration: scheduled
    /// rotation check, one wallet session, outcome routing (reactive
    /// rotation on failure), counters, one progress line.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!("🚀 Monitoring {} wallets", self.ring.len());

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.scheduler.apply_scheduled(self.stats.processed).await;

            let wallet = self.ring.current().to_string();
            let profile = self.scheduler.current_profile();

            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = session::run(
                    &wallet,
                    profile,
                    self.proxy.as_ref(),
                    &self.session_config,
                    &self.persist,
                ) => outcome,
            };

            // Reactive rotation happens before the counter advances so the
            // next dial never reuses a burned identity.
            match outcome {
                SessionOutcome::Success => {}
                SessionOutcome::DataRejected => {
                    self.scheduler.rotate_full("data rejected").await;
                }
                SessionOutcome::Failure(kind) => {
                    let reason = match kind {
                        FailureKind::Tunnel => "tunnel error",
                        FailureKind::Handshake => "handshake error",
                        FailureKind::Receive => "receive error",
                        FailureKind::Timeout => "receive timeout",
                    };
                    self.scheduler.rotate_full(reason).await;
                }
            }

            self.stats.record(&outcome);
            self.log_progress(&wallet, &outcome);

            if self.ring.advance() {
                info!("🔄 Full rotation of the wallet list complete, starting again");
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.pacer.pause() => {}
            }
        }

        self.persist.close();
        self.log_summary();
    }

    fn log_progress(&self, wallet: &str, outcome: &SessionOutcome) {
        let status = if outcome.is_success() { "✅" } else { "❌" };
        let (next_ssl, next_tor) = self.scheduler.countdowns(self.stats.processed);
        info!(
            "{status} [{}] {}… | ✓{} ✗{} | {:.1}% | 🧅{}(→{next_tor}) 🔒(→{next_ssl}) | ⏱️{}",
            self.stats.processed,
            prefix(wallet),
            self.stats.successful,
            self.stats.failed,
            self.stats.success_rate(),
            self.scheduler.identity_changes(),
            format_elapsed(self.stats.started.elapsed()),
        );
    }

    fn log_summary(&self) {
        let elapsed = self.stats.started.elapsed();
        let avg = if self.stats.processed > 0 {
            elapsed.as_secs_f64() / self.stats.processed as f64
        } else {
            0.0
        };

        info!("{}", "=".repeat(60));
        info!("📊 SESSION SUMMARY");
        info!("{}", "=".repeat(60));
        info!("⏱️  Total runtime:        {}", format_elapsed(elapsed));
        info!("📋 Wallets in list:      {}", self.ring.len());
        info!("🔄 Total processed:      {}", self.stats.processed);
        info!("✅ Successful:           {}", self.stats.successful);
        info!("❌ Failed:               {}", self.stats.failed);
        info!("📈 Success rate:         {:.1}%", self.stats.success_rate());
        info!("⚡ Avg time per wallet:  {avg:.2}s");
        info!("🧅 Identity changes:     {}", self.scheduler.identity_changes());
        info!("🔌 Connection errors:    {}", self.stats.connection_errors);
        info!("{}", "=".repeat(60));
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}
