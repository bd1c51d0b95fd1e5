//! Rotation scheduling: decides when to refresh the fingerprint profile
//! and when to also request a new egress identity.
//!
//! Scheduled rotations key off the wallets-processed counter; reactive
//! rotations fire on session failures regardless of the cadence. A full
//! rotation always completes before the next wallet's dial.

use std::sync::Arc;

use tracing::info;

use crate::circuit::CircuitController;
use crate::fingerprint::{FingerprintFactory, FingerprintProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    None,
    FingerprintOnly,
    Full,
}

/// Pure cadence decision for wallet count `processed`. Full rotation takes
/// priority when both intervals align; no rotation before the first wallet.
pub fn scheduled_rotation(processed: u64, ssl_interval: u64, tor_interval: u64) -> Rotation {
    if processed == 0 {
        Rotation::None
    } else if processed % tor_interval == 0 {
        Rotation::Full
    } else if processed % ssl_interval == 0 {
        Rotation::FingerprintOnly
    } else {
        Rotation::None
    }
}

pub struct RotationScheduler {
    factory: FingerprintFactory,
    circuit: CircuitController,
    ssl_interval: u64,
    tor_interval: u64,
    current: Arc<FingerprintProfile>,
}

impl RotationScheduler {
    pub fn new(
        factory: FingerprintFactory,
        circuit: CircuitController,
        ssl_interval: u64,
        tor_interval: u64,
    ) -> Self {
        let current = Arc::new(factory.create());
        Self { factory, circuit, ssl_interval, tor_interval, current }
    }

    /// The profile every new dial must use.
    pub fn current_profile(&self) -> Arc<FingerprintProfile> {
        self.current.clone()
    }

    pub fn identity_changes(&self) -> u64 {
        self.circuit.identity_changes()
    }

    /// Wallets remaining until the next (fingerprint, full) rotation.
    pub fn countdowns(&self, processed: u64) -> (u64, u64) {
        (
            self.ssl_interval - processed % self.ssl_interval,
            self.tor_interval - processed % self.tor_interval,
        )
    }

    /// Check the cadence before processing a wallet and perform whatever
    /// rotation is due. Returns what was done.
    pub async fn apply_scheduled(&mut self, processed: u64) -> Rotation {
        let due = scheduled_rotation(processed, self.ssl_interval, self.tor_interval);
        match due {
            Rotation::Full => {
                self.rotate_full(&format!("every {} wallets", self.tor_interval)).await;
            }
            Rotation::FingerprintOnly => {
                info!("🔒 Fingerprint rotation (every {} wallets)", self.ssl_interval);
                self.rotate_fingerprint();
            }
            Rotation::None => {}
        }
        due
    }

    /// Full rotation: new egress identity first, then a fresh fingerprint
    /// profile. A refused identity change keeps the old circuit but the
    /// fingerprint is refreshed regardless.
    pub async fn rotate_full(&mut self, reason: &str) {
        info!("🔄 Full rotation [{reason}]: identity + TLS + headers");
        self.circuit.change_identity(reason).await;
        self.rotate_fingerprint();
    }

    pub fn rotate_fingerprint(&mut self) {
        self.current = Arc::new(self.factory.create());
    }
}
