//! Storage record types for SQLite persistence.

/// Snapshot header record (one per successful match)
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub account_value: String,
    pub total_ntl_pos: String,
    pub total_raw_usd: String,
    pub total_margin_used: String,
    pub withdrawable: String,
    /// Nullable in the schema
    pub cross_maintenance_margin_used: Option<String>,
}

/// Open position record, foreign-keyed to a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRecord {
    pub coin: String,
    pub position_type: String,
    pub size: String,
    pub leverage_type: String,
    pub leverage_value: i64,
    /// Nullable in the schema
    pub entry_price: Option<String>,
    pub position_value: String,
    pub unrealized_pnl: String,
    pub return_on_equity: String,
}

/// Open order record, foreign-keyed to a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub order_id: i64,
    pub coin: String,
    pub side: String,
    pub limit_price: String,
    pub quantity: String,
    pub timestamp_ms: i64,
    pub order_type: String,
    pub reduce_only: bool,
    pub time_in_force: String,
}

/// Everything extracted from one matched message; written in a single
/// transaction keyed by (wallet, snapshot time).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSnapshot {
    pub snapshot_time_ms: i64,
    pub summary: SnapshotRecord,
    pub positions: Vec<PositionRecord>,
    pub orders: Vec<OrderRecord>,
}
