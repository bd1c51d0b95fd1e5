//! Per-wallet WebSocket session: dial through the tunnel with the current
//! fingerprint, upgrade, subscribe, and wait for the one matching message.
//!
//! The state machine is Idle → Connecting → Subscribed → AwaitingMatch →
//! {Matched | TimedOut | Errored} → Closed. Every terminal path closes the
//! connection; the frame handler returns an explicit tri-state decision
//! instead of signaling through error types.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, warn};

use crate::config::{self, ProxyEndpoint, CONNECT_TIMEOUT, RECV_TIMEOUT, SESSION_DEADLINE};
use crate::fingerprint::FingerprintProfile;
use crate::parser;
use crate::storage::{ParsedSnapshot, PersistHandle};
use crate::tunnel::{self, TunnelError};
use crate::wallets::prefix;

/// Hard deadlines for one session. Injected so tests can shrink them.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tunnel dial, TLS handshake, and upgrade each get this long
    pub connect_timeout: Duration,
    /// Per-frame receive window
    pub recv_timeout: Duration,
    /// Overall session deadline
    pub deadline: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            recv_timeout: RECV_TIMEOUT,
            deadline: SESSION_DEADLINE,
        }
    }
}

/// What a wallet attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Matched message committed to the store
    Success,
    /// Matched but the store rejected it permanently
    DataRejected,
    /// No usable message obtained
    Failure(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Tunnel,
    Handshake,
    Receive,
    Timeout,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Success)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("tunnel: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("TLS handshake: {0}")]
    Tls(std::io::Error),
    #[error("WebSocket upgrade: {0}")]
    Upgrade(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("{0} handshake timed out")]
    HandshakeTimeout(&'static str),
    #[error("header value not encodable: {0}")]
    BadHeader(&'static str),
}

impl SessionError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            SessionError::Tunnel(_) => FailureKind::Tunnel,
            _ => FailureKind::Handshake,
        }
    }
}

/// Decision of the per-frame handler while awaiting a match.
enum FrameDecision {
    /// The target channel message, decoded
    Matched(ParsedSnapshot),
    /// Unrelated traffic (or a not-yet-usable match); keep waiting
    Ignore,
    /// Matched but undecodable; no point waiting for another copy
    Fail,
}

#[derive(Serialize)]
struct SubscribeCmd<'a> {
    method: &'static str,
    subscription: Subscription<'a>,
}

#[derive(Serialize)]
struct Subscription<'a> {
    #[serde(rename = "type")]
    sub_type: &'static str,
    user: &'a str,
}

#[derive(Deserialize)]
struct Envelope {
    channel: Option<String>,
    data: Option<Value>,
}

/// Run one full session for `wallet`: tunnel, TLS, upgrade, subscribe,
/// await the matching message, persist it.
pub async fn run(
    wallet: &str,
    profile: Arc<FingerprintProfile>,
    proxy: Option<&ProxyEndpoint>,
    cfg: &SessionConfig,
    persist: &PersistHandle,
) -> SessionOutcome {
    let ws = match connect(&profile, proxy, cfg.connect_timeout).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("🔌 Connect failed for {}…: {e}", prefix(wallet));
            return SessionOutcome::Failure(e.failure_kind());
        }
    };
    run_on_stream(ws, wallet, cfg, persist).await
}

/// Establish the transport stack for one session: tunnel dial, TLS with
/// the profile's configuration, WebSocket upgrade with its headers.
pub async fn connect(
    profile: &FingerprintProfile,
    proxy: Option<&ProxyEndpoint>,
    connect_timeout: Duration,
) -> Result<WebSocketStream<TlsStream<TcpStream>>, SessionError> {
    let tcp = timeout(
        connect_timeout,
        tunnel::dial(config::WS_HOST, config::WS_PORT, proxy),
    )
    .await
    .map_err(|_| TunnelError::Timeout)??;

    let server_name = rustls::pki_types::ServerName::try_from(config::WS_HOST)
        .expect("endpoint hostname is a valid server name");
    let connector = TlsConnector::from(profile.tls.clone());
    let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| SessionError::HandshakeTimeout("TLS"))?
        .map_err(SessionError::Tls)?;

    let mut request = config::WS_URL.into_client_request()?;
    for (name, value) in &profile.headers {
        let value = value.parse().map_err(|_| SessionError::BadHeader(*name))?;
        request.headers_mut().insert(*name, value);
    }

    let (ws, _response) = timeout(connect_timeout, client_async(request, tls))
        .await
        .map_err(|_| SessionError::HandshakeTimeout("WebSocket upgrade"))??;

    debug!("WebSocket connected");
    Ok(ws)
}

/// Subscribe and await the matching message over an established WebSocket.
/// Generic over the transport so tests can drive it over plain TCP.
pub async fn run_on_stream<S>(
    mut ws: WebSocketStream<S>,
    wallet: &str,
    cfg: &SessionConfig,
    persist: &PersistHandle,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(subscribe) = serde_json::to_string(&SubscribeCmd {
        method: "subscribe",
        subscription: Subscription { sub_type: config::CHANNEL_MARKER, user: wallet },
    }) else {
        return close_with(ws, SessionOutcome::Failure(FailureKind::Handshake)).await;
    };

    if let Err(e) = ws.send(Message::Text(subscribe)).await {
        warn!("⚠️ Subscribe failed for {}…: {e}", prefix(wallet));
        return close_with(ws, SessionOutcome::Failure(FailureKind::Receive)).await;
    }
    debug!("📡 Monitoring {}…", prefix(wallet));

    let deadline = Instant::now() + cfg.deadline;

    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!("⏱️ Session deadline reached for {}…", prefix(wallet));
            return close_with(ws, SessionOutcome::Failure(FailureKind::Timeout)).await;
        }
        let window = cfg.recv_timeout.min(deadline - now);

        let item = match timeout(window, ws.next()).await {
            Ok(item) => item,
            Err(_) => {
                warn!("⏱️ Receive window expired for {}…", prefix(wallet));
                return close_with(ws, SessionOutcome::Failure(FailureKind::Timeout)).await;
            }
        };

        match item {
            Some(Ok(Message::Text(text))) => match decide_frame(&text) {
                FrameDecision::Matched(parsed) => {
                    debug!("🎯 Match for {}…", prefix(wallet));
                    let ok = persist.insert(wallet, parsed).await;
                    let outcome =
                        if ok { SessionOutcome::Success } else { SessionOutcome::DataRejected };
                    return close_with(ws, outcome).await;
                }
                FrameDecision::Ignore => {}
                FrameDecision::Fail => {
                    warn!("❌ Undecodable match for {}…", prefix(wallet));
                    return close_with(ws, SessionOutcome::DataRejected).await;
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                if ws.send(Message::Pong(payload)).await.is_err() {
                    return close_with(ws, SessionOutcome::Failure(FailureKind::Receive)).await;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                warn!("⚠️ Stream closed for {}…", prefix(wallet));
                return close_with(ws, SessionOutcome::Failure(FailureKind::Receive)).await;
            }
            Some(Err(e)) => {
                warn!("⚠️ Receive error for {}…: {e}", prefix(wallet));
                return close_with(ws, SessionOutcome::Failure(FailureKind::Receive)).await;
            }
            Some(Ok(_)) => {}
        }
    }
}

/// Classify one text frame. Unrelated channels and frames that are not
/// yet usable are ignored; a matched frame either decodes into a snapshot
/// or can never be used.
fn decide_frame(text: &str) -> FrameDecision {
    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        return FrameDecision::Ignore;
    };
    if envelope.channel.as_deref() != Some(config::CHANNEL_MARKER) {
        return FrameDecision::Ignore;
    }
    let Some(data) = envelope.data else {
        return FrameDecision::Ignore;
    };
    match parser::parse_snapshot(&data) {
        Ok(Some(parsed)) => FrameDecision::Matched(parsed),
        Ok(None) => FrameDecision::Ignore,
        Err(_) => FrameDecision::Fail,
    }
}

/// Best-effort close frame, then drop releases the socket and TLS state.
async fn close_with<S>(mut ws: WebSocketStream<S>, outcome: SessionOutcome) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = ws.close(None).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrelated_channel_is_ignored() {
        let text = r#"{"channel":"allMids","data":{"mids":{}}}"#;
        assert!(matches!(decide_frame(text), FrameDecision::Ignore));
    }

    #[test]
    fn non_json_frame_is_ignored() {
        assert!(matches!(decide_frame("pong"), FrameDecision::Ignore));
    }

    #[test]
    fn match_without_data_keeps_waiting() {
        let text = r#"{"channel":"webData2"}"#;
        assert!(matches!(decide_frame(text), FrameDecision::Ignore));
    }

    #[test]
    fn match_without_snapshot_time_keeps_waiting() {
        let text = r#"{"channel":"webData2","data":{"clearinghouseState":{}}}"#;
        assert!(matches!(decide_frame(text), FrameDecision::Ignore));
    }

    #[test]
    fn matched_frame_decodes() {
        let text = r#"{"channel":"webData2","data":{"clearinghouseState":{"time":1700000000000,"marginSummary":{"accountValue":"10.0"}}}}"#;
        match decide_frame(text) {
            FrameDecision::Matched(parsed) => {
                assert_eq!(parsed.snapshot_time_ms, 1700000000000);
                assert_eq!(parsed.summary.account_value, "10.0");
            }
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn undecodable_match_fails() {
        let text = r#"{"channel":"webData2","data":{"clearinghouseState":{"time":"soon"}}}"#;
        assert!(matches!(decide_frame(text), FrameDecision::Fail));
    }
}
