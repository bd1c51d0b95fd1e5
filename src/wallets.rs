//! Wallet list loading.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

/// Load wallet addresses from a newline-separated file. Lines are trimmed
/// and blank lines skipped. An empty result is a startup error.
pub fn load_wallets(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("wallet file not found: {}", path.display()))?;

    let wallets: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if wallets.is_empty() {
        bail!("no wallets found in {}", path.display());
    }

    info!("Loaded {} wallets from {}", wallets.len(), path.display());
    Ok(wallets)
}

/// Short display prefix for log lines.
pub fn prefix(wallet: &str) -> &str {
    wallet.get(..16).unwrap_or(wallet)
}
