//! Fingerprint profile generation: TLS configuration with a preferred
//! cipher order plus a browser-consistent header set.
//!
//! A profile is created fresh on every rotation and never mutated; the
//! session reads the current one at dial time. Hostname verification and
//! certificate validation stay enabled on every path, and only TLS 1.2/1.3
//! are offered.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::Rng;
use rustls::crypto::{ring, CryptoProvider};
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite};
use tracing::debug;

/// Preferred cipher suites, in order. TLS 1.3 suites first, then the
/// ECDHE AEAD suites a current browser offers for TLS 1.2.
static PREFERRED_SUITES: &[SupportedCipherSuite] = &[
    ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

const SEC_CH_UA_CHROME: &[&str] = &[
    "\"Google Chrome\";v=\"121\", \"Chromium\";v=\"121\", \"Not A(Brand\";v=\"99\"",
    "\"Google Chrome\";v=\"120\", \"Chromium\";v=\"120\", \"Not_A Brand\";v=\"99\"",
    "\"Google Chrome\";v=\"122\", \"Chromium\";v=\"122\", \"Not(A:Brand\";v=\"24\"",
];

const PLATFORMS: &[&str] = &["\"Windows\"", "\"macOS\"", "\"Linux\""];

/// One rotation epoch's transport identity. Immutable once created;
/// superseded, never mutated.
#[derive(Clone)]
pub struct FingerprintProfile {
    /// TLS configuration used for the session handshake
    pub tls: Arc<ClientConfig>,
    /// Cosmetic client headers sent with the WebSocket upgrade. Reserved
    /// upgrade headers (Host, Connection, Upgrade, Sec-WebSocket-Version,
    /// Sec-WebSocket-Key) are generated per connection by the WebSocket
    /// layer, which is what supplies the fresh per-connection key.
    pub headers: Vec<(&'static str, String)>,
}

/// Builds fresh fingerprint profiles. Root certificates are loaded once at
/// startup; everything else is regenerated per call.
pub struct FingerprintFactory {
    roots: Arc<RootCertStore>,
}

impl FingerprintFactory {
    pub fn new() -> Result<Self> {
        let mut roots = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs()
            .context("failed to load native root certificates")?;
        for cert in certs {
            // Individual unparsable platform certs are skipped, not fatal.
            let _ = roots.add(cert);
        }
        if roots.is_empty() {
            bail!("no usable root certificates found");
        }
        Ok(Self { roots: Arc::new(roots) })
    }

    /// Produce a fresh profile: new TLS configuration, new header set.
    pub fn create(&self) -> FingerprintProfile {
        let profile = FingerprintProfile {
            tls: Arc::new(self.tls_config()),
            headers: generate_headers(),
        };
        debug!("New fingerprint profile created");
        profile
    }

    fn tls_config(&self) -> ClientConfig {
        let provider = CryptoProvider {
            cipher_suites: PREFERRED_SUITES.to_vec(),
            ..ring::default_provider()
        };

        // Fall back to the full negotiated set if the preferred list is
        // rejected for the enabled protocol versions.
        let builder = match ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        {
            Ok(builder) => builder,
            Err(_) => ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
                .with_protocol_versions(rustls::DEFAULT_VERSIONS)
                .expect("default provider supports the default protocol versions"),
        };

        builder
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth()
    }
}

/// Generate a browser-consistent ordered header set around a randomly
/// selected user agent. Chrome agents get the client-hint trio.
fn generate_headers() -> Vec<(&'static str, String)> {
    let mut rng = rand::thread_rng();
    let agent = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())];
    let is_chrome = agent.contains("Chrome") && !agent.contains("Firefox");

    let mut headers: Vec<(&'static str, String)> = vec![
        ("Pragma", "no-cache".to_string()),
        ("Cache-Control", "no-cache".to_string()),
        ("User-Agent", agent.to_string()),
        ("Origin", "https://app.hyperliquid.xyz".to_string()),
        ("Accept-Encoding", "gzip, deflate, br".to_string()),
        ("Accept-Language", "en-US,en;q=0.9".to_string()),
    ];

    if is_chrome {
        headers.push((
            "Sec-Ch-Ua",
            SEC_CH_UA_CHROME[rng.gen_range(0..SEC_CH_UA_CHROME.len())].to_string(),
        ));
        headers.push(("Sec-Ch-Ua-Mobile", "?0".to_string()));
        headers.push((
            "Sec-Ch-Ua-Platform",
            PLATFORMS[rng.gen_range(0..PLATFORMS.len())].to_string(),
        ));
    }

    headers.push(("Sec-Fetch-Dest", "websocket".to_string()));
    headers.push(("Sec-Fetch-Mode", "websocket".to_string()));
    headers.push(("Sec-Fetch-Site", "cross-site".to_string()));

    headers
}
