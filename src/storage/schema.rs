//! Database schema creation.

use rusqlite::{Connection, Result};

/// Create the three related tables and their indexes. The snapshot unique
/// index makes a resubmitted (wallet, snapshot time) pair fail with the
/// same constraint violation every time.
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            wallet_address TEXT NOT NULL,
            snapshot_time_ms INTEGER NOT NULL,
            snapshot_datetime TEXT NOT NULL,
            account_value TEXT NOT NULL,
            total_ntl_pos TEXT NOT NULL,
            total_raw_usd TEXT NOT NULL,
            total_margin_used TEXT NOT NULL,
            withdrawable TEXT NOT NULL,
            cross_maintenance_margin_used TEXT,
            UNIQUE (wallet_address, snapshot_time_ms)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS positions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            snapshot_id INTEGER NOT NULL,
            coin TEXT NOT NULL,
            position_type TEXT NOT NULL,
            size TEXT NOT NULL,
            leverage_type TEXT NOT NULL,
            leverage_value INTEGER NOT NULL,
            entry_price TEXT,
            position_value TEXT NOT NULL,
            unrealized_pnl TEXT NOT NULL,
            return_on_equity TEXT NOT NULL,
            FOREIGN KEY (snapshot_id) REFERENCES snapshots(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS open_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id INTEGER NOT NULL,
            snapshot_id INTEGER NOT NULL,
            coin TEXT NOT NULL,
            side TEXT NOT NULL,
            limit_price TEXT NOT NULL,
            quantity TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            order_type TEXT NOT NULL,
            reduce_only INTEGER NOT NULL,
            time_in_force TEXT NOT NULL,
            FOREIGN KEY (snapshot_id) REFERENCES snapshots(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_wallet_time
         ON snapshots(wallet_address, snapshot_time_ms DESC)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_positions_snapshot ON positions(snapshot_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_orders_snapshot ON open_orders(snapshot_id)",
        [],
    )?;

    Ok(())
}
