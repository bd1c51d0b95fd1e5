//! Transactional snapshot persistence on a dedicated writer thread.
//!
//! The process holds exactly one database connection, owned by this
//! thread and reused across wallets. A stale connection is dropped and
//! reopened transparently; that reconnect is not a retry. Failures are
//! classified: data-shape errors are terminal (the same row would fail
//! identically on resubmission), everything else is retried up to the
//! configured bound with a fixed backoff.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::schema::create_tables;
use super::types::ParsedSnapshot;
use crate::config::{INSERT_MAX_ATTEMPTS, INSERT_RETRY_BACKOFF};

/// Retry policy for connection-class insert failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: INSERT_MAX_ATTEMPTS, backoff: INSERT_RETRY_BACKOFF }
    }
}

/// Result of one insert request, with the attempt count for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct InsertReport {
    pub committed: bool,
    pub attempts: u32,
}

/// Messages sent to the writer thread.
enum PersistRequest {
    Insert {
        wallet: String,
        parsed: ParsedSnapshot,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Handle for submitting snapshots to the writer thread.
#[derive(Clone)]
pub struct PersistHandle {
    tx: Sender<PersistRequest>,
}

impl PersistHandle {
    /// Persist one matched snapshot. Resolves to `true` once the
    /// transaction has committed, `false` when persistence failed
    /// (terminally or after exhausting retries).
    pub async fn insert(&self, wallet: &str, parsed: ParsedSnapshot) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PersistRequest::Insert {
            wallet: wallet.to_string(),
            parsed,
            reply: reply_tx,
        };
        if self.tx.send(request).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Request writer shutdown; the connection is closed by the thread.
    pub fn close(&self) {
        let _ = self.tx.send(PersistRequest::Shutdown);
    }
}

/// Spawn the writer thread and return a cloneable handle.
pub fn spawn_persister(db_path: &str, policy: RetryPolicy) -> PersistHandle {
    let (tx, rx) = mpsc::channel();
    let persister = Persister::new(db_path, policy);

    thread::spawn(move || writer_loop(rx, persister));

    PersistHandle { tx }
}

fn writer_loop(rx: Receiver<PersistRequest>, mut persister: Persister) {
    for request in rx {
        match request {
            PersistRequest::Insert { wallet, parsed, reply } => {
                let report = persister.insert(&wallet, &parsed);
                let _ = reply.send(report.committed);
            }
            PersistRequest::Shutdown => break,
        }
    }
    persister.close();
    info!("[STORAGE] Writer shutdown complete");
}

/// Synchronous persistence core. Owns the single connection.
pub struct Persister {
    path: PathBuf,
    policy: RetryPolicy,
    conn: Option<Connection>,
}

impl Persister {
    pub fn new(db_path: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self { path: db_path.into(), policy, conn: None }
    }

    /// Insert one snapshot with its positions and orders as a single
    /// transaction, retrying connection-class failures.
    pub fn insert(&mut self, wallet: &str, parsed: &ParsedSnapshot) -> InsertReport {
        // A snapshot time outside the representable range can never be
        // stored; classify it up front like any other terminal data error.
        let Some(snapshot_datetime) = format_datetime(parsed.snapshot_time_ms) else {
            error!(
                "[STORAGE] Unrepresentable snapshot time {} for {wallet}, skipping",
                parsed.snapshot_time_ms
            );
            return InsertReport { committed: false, attempts: 1 };
        };

        for attempt in 1..=self.policy.max_attempts {
            let result = self
                .ensure_connection()
                .and_then(|conn| try_insert(conn, wallet, &snapshot_datetime, parsed));

            match result {
                Ok(snapshot_id) => {
                    debug!("[STORAGE] Committed snapshot {snapshot_id} for {wallet}");
                    return InsertReport { committed: true, attempts: attempt };
                }
                Err(e) if is_terminal(&e) => {
                    error!("[STORAGE] Data error for {wallet}, not retrying: {e}");
                    return InsertReport { committed: false, attempts: attempt };
                }
                Err(e) => {
                    warn!(
                        "[STORAGE] Insert failed (attempt {attempt}/{}): {e}",
                        self.policy.max_attempts
                    );
                    // Assume the connection is suspect; reopen on the next
                    // attempt.
                    self.conn = None;
                    if attempt == self.policy.max_attempts {
                        error!("[STORAGE] Giving up on snapshot for {wallet}");
                        return InsertReport { committed: false, attempts: attempt };
                    }
                    thread::sleep(self.policy.backoff);
                }
            }
        }

        InsertReport { committed: false, attempts: self.policy.max_attempts }
    }

    /// Lazily open the connection, replacing one that no longer answers.
    fn ensure_connection(&mut self) -> rusqlite::Result<&mut Connection> {
        if let Some(conn) = &self.conn {
            let alive = conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok();
            if !alive {
                warn!("[STORAGE] Connection lost, reconnecting");
                self.conn = None;
            }
        }

        if self.conn.is_none() {
            let conn = Connection::open(&self.path)?;
            create_tables(&conn)?;
            info!("[STORAGE] Database connected at {}", self.path.display());
            self.conn = Some(conn);
        }

        Ok(self.conn.as_mut().expect("connection just established"))
    }

    pub fn close(&mut self) {
        self.conn = None;
    }
}

/// One all-or-nothing transaction: snapshot header, then positions and
/// orders referencing its generated id. Dropping the transaction on any
/// error path rolls it back.
fn try_insert(
    conn: &mut Connection,
    wallet: &str,
    snapshot_datetime: &str,
    parsed: &ParsedSnapshot,
) -> rusqlite::Result<i64> {
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO snapshots (
            wallet_address, snapshot_time_ms, snapshot_datetime,
            account_value, total_ntl_pos, total_raw_usd, total_margin_used,
            withdrawable, cross_maintenance_margin_used
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            wallet,
            parsed.snapshot_time_ms,
            snapshot_datetime,
            parsed.summary.account_value,
            parsed.summary.total_ntl_pos,
            parsed.summary.total_raw_usd,
            parsed.summary.total_margin_used,
            parsed.summary.withdrawable,
            parsed.summary.cross_maintenance_margin_used,
        ],
    )?;
    let snapshot_id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare(
            "INSERT INTO positions (
                snapshot_id, coin, position_type, size, leverage_type,
                leverage_value, entry_price, position_value,
                unrealized_pnl, return_on_equity
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for p in &parsed.positions {
            stmt.execute(params![
                snapshot_id,
                p.coin,
                p.position_type,
                p.size,
                p.leverage_type,
                p.leverage_value,
                p.entry_price,
                p.position_value,
                p.unrealized_pnl,
                p.return_on_equity,
            ])?;
        }
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO open_orders (
                order_id, snapshot_id, coin, side, limit_price,
                quantity, timestamp_ms, order_type, reduce_only, time_in_force
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for o in &parsed.orders {
            stmt.execute(params![
                o.order_id,
                snapshot_id,
                o.coin,
                o.side,
                o.limit_price,
                o.quantity,
                o.timestamp_ms,
                o.order_type,
                o.reduce_only,
                o.time_in_force,
            ])?;
        }
    }

    tx.commit()?;
    Ok(snapshot_id)
}

/// Classify a failure. Terminal errors describe data that can never be
/// stored (constraint violations, impossible values); retrying them would
/// fail identically. Everything else is treated as a connection-class
/// problem worth a reconnect and retry.
pub fn is_terminal(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::ConstraintViolation
                | ErrorCode::TooBig
                | ErrorCode::TypeMismatch
                | ErrorCode::ParameterOutOfRange
                | ErrorCode::ApiMisuse
        ),
        rusqlite::Error::ToSqlConversionFailure(_)
        | rusqlite::Error::InvalidParameterCount(..) => true,
        _ => false,
    }
}

fn format_datetime(time_ms: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(time_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
}
