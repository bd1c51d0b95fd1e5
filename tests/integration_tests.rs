// Holistic integration tests for the snapshot monitor.
//
// These cover the pieces that need a live counterpart:
// 1. Tunnel negotiation against mock SOCKS5 / HTTP CONNECT proxies
// 2. Control-protocol pacing against a mock daemon
// 3. A full session pass (subscribe -> match -> persist) against a mock
//    WebSocket feed and a real on-disk SQLite database

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

// ============================================================================
// TUNNEL TESTS - SOCKS5 and HTTP CONNECT handshakes
// ============================================================================

mod tunnel_tests {
    use super::*;
    use hlmon::config::{ProxyEndpoint, ProxyScheme};
    use hlmon::tunnel::{dial, TunnelError};

    fn proxy_for(addr: std::net::SocketAddr, scheme: ProxyScheme) -> ProxyEndpoint {
        ProxyEndpoint {
            scheme,
            host: addr.ip().to_string(),
            port: addr.port(),
            username: None,
            password: None,
        }
    }

    /// Serve one SOCKS5 handshake, then send `trailer` so the client can
    /// prove the stream is positioned right after the bound address.
    async fn serve_socks5(listener: TcpListener, reply_status: u8, trailer: &'static [u8]) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut negotiation = [0u8; 3];
        stream.read_exact(&mut negotiation).await.unwrap();
        assert_eq!(negotiation, [0x05, 0x01, 0x00], "no-auth negotiation expected");
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 5];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03], "domain-type CONNECT expected");
        let mut rest = vec![0u8; head[4] as usize + 2];
        stream.read_exact(&mut rest).await.unwrap();

        // IPv4 bound address: 4 bytes + 2 port bytes after the header.
        stream
            .write_all(&[0x05, reply_status, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();

        if reply_status == 0 {
            stream.write_all(trailer).await.unwrap();
            // Hold the socket open until the client is done reading.
            let mut sink = [0u8; 1];
            let _ = stream.read(&mut sink).await;
        }
    }

    #[tokio::test]
    async fn socks5_success_leaves_stream_clean() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_socks5(listener, 0x00, b"HELLO"));

        let proxy = proxy_for(addr, ProxyScheme::Socks5);
        let mut stream = dial("example.com", 443, Some(&proxy)).await.unwrap();

        // The next read must yield exactly the trailer: nothing of the
        // bound-address field left over, nothing of the trailer consumed.
        let mut first = [0u8; 5];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"HELLO");
    }

    #[tokio::test]
    async fn socks5_domain_bound_address_is_drained() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut negotiation = [0u8; 3];
            stream.read_exact(&mut negotiation).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();

            // Domain-type bound address: length byte, name, port.
            let mut reply = vec![0x05, 0x00, 0x00, 0x03, 9];
            reply.extend_from_slice(b"localhost");
            reply.extend_from_slice(&[0x1f, 0x90]);
            reply.extend_from_slice(b"OK");
            stream.write_all(&reply).await.unwrap();

            let mut sink = [0u8; 1];
            let _ = stream.read(&mut sink).await;
        });

        let proxy = proxy_for(addr, ProxyScheme::Socks5);
        let mut stream = dial("example.com", 443, Some(&proxy)).await.unwrap();

        let mut first = [0u8; 2];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"OK");
    }

    #[tokio::test]
    async fn socks5_nonzero_status_is_a_tunnel_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_socks5(listener, 0x01, b""));

        let proxy = proxy_for(addr, ProxyScheme::Socks5);
        let err = dial("example.com", 443, Some(&proxy)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Refused(0x01)), "got {err:?}");
    }

    #[tokio::test]
    async fn http_connect_succeeds_on_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
            }
            let head = String::from_utf8_lossy(&request);
            assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            assert!(head.contains("Host: example.com:443"));

            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nHI")
                .await
                .unwrap();
            let mut sink = [0u8; 1];
            let _ = stream.read(&mut sink).await;
        });

        let proxy = proxy_for(addr, ProxyScheme::Http);
        let mut stream = dial("example.com", 443, Some(&proxy)).await.unwrap();

        let mut first = [0u8; 2];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"HI");
    }

    #[tokio::test]
    async fn http_connect_rejects_non_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy = proxy_for(addr, ProxyScheme::Http);
        let err = dial("example.com", 443, Some(&proxy)).await.unwrap_err();
        assert!(matches!(err, TunnelError::HttpRefused(_)), "got {err:?}");
    }
}

// ============================================================================
// CIRCUIT CONTROLLER TESTS - control-protocol dialog and pacing
// ============================================================================

mod circuit_tests {
    use super::*;
    use hlmon::circuit::CircuitController;
    use hlmon::config::TorControlConfig;

    /// Mock control daemon answering 250 to every command, recording when
    /// each control connection starts.
    async fn serve_control(listener: TcpListener, accepts: Arc<Mutex<Vec<Instant>>>) {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            accepts.lock().unwrap().push(Instant::now());
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.starts_with("AUTHENTICATE") || line.starts_with("SIGNAL NEWNYM") {
                        write_half.write_all(b"250 OK\r\n").await.unwrap();
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn second_identity_change_waits_out_the_minimum_interval() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve_control(listener, accepts.clone()));

        let config = TorControlConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            password: None,
        };
        let min_interval = Duration::from_millis(300);
        let mut controller =
            CircuitController::new(config).with_timing(min_interval, Duration::ZERO);

        assert!(controller.change_identity("first").await);
        assert!(controller.change_identity("second").await);
        assert_eq!(controller.identity_changes(), 2);

        let accepts = accepts.lock().unwrap();
        assert_eq!(accepts.len(), 2);
        let gap = accepts[1].duration_since(accepts[0]);
        assert!(gap >= Duration::from_millis(270), "second NEWNYM too early: {gap:?}");
    }

    #[tokio::test]
    async fn refused_daemon_reports_false_and_keeps_counting_from_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            if let Ok(Some(_)) = lines.next_line().await {
                write_half.write_all(b"515 Bad authentication\r\n").await.unwrap();
            }
        });

        let config = TorControlConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            password: Some("wrong".to_string()),
        };
        let mut controller =
            CircuitController::new(config).with_timing(Duration::ZERO, Duration::ZERO);

        assert!(!controller.change_identity("test").await);
        assert_eq!(controller.identity_changes(), 0);
    }

    #[tokio::test]
    async fn unreachable_daemon_reports_false() {
        // Port from a listener we immediately drop: connection refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = TorControlConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            password: None,
        };
        let mut controller =
            CircuitController::new(config).with_timing(Duration::ZERO, Duration::ZERO);

        assert!(!controller.change_identity("test").await);
        assert_eq!(controller.identity_changes(), 0);
    }
}

// ============================================================================
// END-TO-END SESSION TESTS - mock feed to committed snapshot
// ============================================================================

mod session_e2e_tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use hlmon::session::{self, FailureKind, SessionConfig, SessionOutcome};
    use hlmon::storage::{spawn_persister, RetryPolicy};
    use tokio_tungstenite::tungstenite::Message;

    /// Frame the feed emits for the matching wallet: one ETH position and
    /// one open order.
    fn webdata2_frame() -> String {
        serde_json::json!({
            "channel": "webData2",
            "data": {
                "clearinghouseState": {
                    "marginSummary": {
                        "accountValue": "100.0",
                        "totalNtlPos": "50.0",
                        "totalRawUsd": "100.0",
                        "totalMarginUsed": "10.0"
                    },
                    "assetPositions": [
                        {
                            "type": "oneWay",
                            "position": {
                                "coin": "ETH",
                                "szi": "5",
                                "leverage": {"type": "cross", "value": 10},
                                "entryPx": "3200.0",
                                "positionValue": "16000.0",
                                "unrealizedPnl": "12.5",
                                "returnOnEquity": "0.01"
                            }
                        }
                    ],
                    "withdrawable": "90.0",
                    "time": 1764506145684i64
                },
                "openOrders": [
                    {
                        "coin": "ETH",
                        "side": "A",
                        "limitPx": "3500.0",
                        "sz": "1.0",
                        "oid": 42,
                        "timestamp": 1764506000000i64,
                        "reduceOnly": false,
                        "orderType": "Limit",
                        "tif": "Gtc"
                    }
                ]
            }
        })
        .to_string()
    }

    /// Mock feed: acknowledges every subscription, emits the webData2
    /// frame only for `matching`, then keeps unrelated traffic flowing.
    async fn serve_feed(listener: TcpListener, matching: &'static str) {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

                let subscribe = match ws.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    _ => return,
                };
                let request: serde_json::Value = serde_json::from_str(&subscribe).unwrap();
                assert_eq!(request["method"], "subscribe");
                assert_eq!(request["subscription"]["type"], "webData2");
                let user = request["subscription"]["user"].as_str().unwrap_or("").to_string();

                let ack = r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#;
                let _ = ws.send(Message::Text(ack.to_string())).await;

                if user == matching {
                    let _ = ws.send(Message::Text(webdata2_frame())).await;
                }

                // Answer pings and swallow everything else until the
                // client closes.
                while let Some(Ok(frame)) = ws.next().await {
                    if let Message::Ping(payload) = frame {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn full_pass_commits_exactly_the_matching_wallet() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_feed(listener, "B"));

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("e2e.db");
        let persist = spawn_persister(
            db_path.to_str().unwrap(),
            RetryPolicy { max_attempts: 2, backoff: Duration::from_millis(50) },
        );

        let cfg = SessionConfig {
            connect_timeout: Duration::from_secs(2),
            recv_timeout: Duration::from_millis(400),
            deadline: Duration::from_millis(1500),
        };

        let mut outcomes = Vec::new();
        for wallet in ["A", "B", "C"] {
            let tcp = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/ws"), tcp)
                .await
                .unwrap();
            outcomes.push(session::run_on_stream(ws, wallet, &cfg, &persist).await);
        }

        assert!(
            matches!(outcomes[0], SessionOutcome::Failure(FailureKind::Timeout)),
            "A: {:?}",
            outcomes[0]
        );
        assert_eq!(outcomes[1], SessionOutcome::Success, "B: {:?}", outcomes[1]);
        assert!(
            matches!(outcomes[2], SessionOutcome::Failure(FailureKind::Timeout)),
            "C: {:?}",
            outcomes[2]
        );

        persist.close();

        // Exactly one snapshot, with one position and one order rows
        // foreign-keyed to it.
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let (snapshot_id, wallet, account_value): (i64, String, String) = conn
            .query_row(
                "SELECT id, wallet_address, account_value FROM snapshots",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(wallet, "B");
        assert_eq!(account_value, "100.0");

        let snapshots: i64 =
            conn.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0)).unwrap();
        assert_eq!(snapshots, 1);

        let (position_count, position_coin): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(coin) FROM positions WHERE snapshot_id = ?1",
                [snapshot_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(position_count, 1);
        assert_eq!(position_coin, "ETH");

        let (order_count, order_id): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(order_id) FROM open_orders WHERE snapshot_id = ?1",
                [snapshot_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(order_count, 1);
        assert_eq!(order_id, 42);
    }

    #[tokio::test]
    async fn resubmitted_snapshot_is_rejected_deterministically() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_feed(listener, "B"));

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("dup.db");
        let persist = spawn_persister(
            db_path.to_str().unwrap(),
            RetryPolicy { max_attempts: 2, backoff: Duration::from_millis(50) },
        );

        let cfg = SessionConfig {
            connect_timeout: Duration::from_secs(2),
            recv_timeout: Duration::from_millis(400),
            deadline: Duration::from_millis(1500),
        };

        // The mock feed replays an identical snapshot time every session,
        // so the second pass hits the unique index: same terminal outcome
        // every run.
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let tcp = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/ws"), tcp)
                .await
                .unwrap();
            outcomes.push(session::run_on_stream(ws, "B", &cfg, &persist).await);
        }

        assert_eq!(outcomes[0], SessionOutcome::Success);
        assert_eq!(outcomes[1], SessionOutcome::DataRejected);

        persist.close();

        let conn = rusqlite::Connection::open(&db_path).unwrap();
        let snapshots: i64 =
            conn.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0)).unwrap();
        assert_eq!(snapshots, 1);
    }
}

// ============================================================================
// MONITOR RING TESTS - circular fairness
// ============================================================================

mod ring_tests {
    use hlmon::monitor::WalletRing;

    #[test]
    fn every_wallet_is_visited_before_any_repeat() {
        for len in [1usize, 2, 3, 7] {
            let wallets: Vec<String> = (0..len).map(|i| format!("w{i}")).collect();
            let mut ring = WalletRing::new(wallets.clone());

            let mut lap = Vec::new();
            for _ in 0..len {
                lap.push(ring.current().to_string());
                ring.advance();
            }
            assert_eq!(lap, wallets, "lap order for len {len}");

            // The next visit is the first repeat.
            assert_eq!(ring.current(), wallets[0]);
        }
    }

    #[test]
    fn wrap_is_reported_exactly_at_the_end_of_a_lap() {
        let mut ring = WalletRing::new(vec!["a".into(), "b".into()]);
        assert!(!ring.advance());
        assert!(ring.advance());
        assert!(!ring.advance());
        assert!(ring.advance());
    }
}
