//! Decoding of a matched account-snapshot message into storage records.
//!
//! Fields the store declares NOT NULL get documented defaults when the
//! feed omits them or sends null. Positions are kept only with a non-zero
//! size and a coin symbol; orders only when an order id is present.

use serde::Deserialize;
use serde_json::Value;

use crate::storage::types::{OrderRecord, ParsedSnapshot, PositionRecord, SnapshotRecord};

// === Wire shapes ===

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireSnapshot {
    clearinghouse_state: Option<WireClearinghouse>,
    #[serde(default)]
    open_orders: Vec<WireOrder>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireClearinghouse {
    margin_summary: Option<WireMarginSummary>,
    #[serde(default)]
    asset_positions: Vec<WireAssetPosition>,
    time: Option<i64>,
    withdrawable: Option<String>,
    cross_maintenance_margin_used: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct WireMarginSummary {
    account_value: Option<String>,
    total_ntl_pos: Option<String>,
    total_raw_usd: Option<String>,
    total_margin_used: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireAssetPosition {
    #[serde(rename = "type")]
    position_type: Option<String>,
    position: Option<WirePosition>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    coin: Option<String>,
    szi: Option<String>,
    leverage: Option<WireLeverage>,
    entry_px: Option<String>,
    position_value: Option<String>,
    unrealized_pnl: Option<String>,
    return_on_equity: Option<String>,
}

#[derive(Deserialize, Debug)]
struct WireLeverage {
    #[serde(rename = "type")]
    kind: Option<String>,
    value: Option<i64>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct WireOrder {
    oid: Option<i64>,
    coin: Option<String>,
    side: Option<String>,
    limit_px: Option<String>,
    sz: Option<String>,
    timestamp: Option<i64>,
    order_type: Option<String>,
    reduce_only: Option<bool>,
    tif: Option<String>,
}

// === Mapping ===

/// Decode the `data` object of a matched message.
///
/// `Ok(None)` means the message carries no snapshot time yet and the
/// session should keep waiting; `Err` means the payload is structurally
/// unusable and resubmitting it can never help.
pub fn parse_snapshot(data: &Value) -> Result<Option<ParsedSnapshot>, serde_json::Error> {
    let wire: WireSnapshot = serde_json::from_value(data.clone())?;

    let Some(clearinghouse) = wire.clearinghouse_state else {
        return Ok(None);
    };
    let Some(snapshot_time_ms) = clearinghouse.time else {
        return Ok(None);
    };

    let margin = clearinghouse.margin_summary.unwrap_or_default();

    let summary = SnapshotRecord {
        account_value: margin.account_value.unwrap_or_else(zero),
        total_ntl_pos: margin.total_ntl_pos.unwrap_or_else(zero),
        total_raw_usd: margin.total_raw_usd.unwrap_or_else(zero),
        total_margin_used: margin.total_margin_used.unwrap_or_else(zero),
        // Lives at the clearinghouse level, not inside the margin summary.
        withdrawable: clearinghouse.withdrawable.unwrap_or_else(zero),
        cross_maintenance_margin_used: clearinghouse.cross_maintenance_margin_used,
    };

    let positions = clearinghouse
        .asset_positions
        .into_iter()
        .filter_map(|asset| {
            let position = asset.position?;
            let size = position.szi.unwrap_or_else(|| "0".to_string());
            let coin = position.coin.unwrap_or_default();
            if size == "0" || coin.is_empty() {
                return None;
            }
            let leverage = position.leverage.unwrap_or(WireLeverage { kind: None, value: None });
            Some(PositionRecord {
                coin,
                position_type: asset.position_type.unwrap_or_else(|| "oneWay".to_string()),
                size,
                leverage_type: leverage.kind.unwrap_or_else(|| "cross".to_string()),
                leverage_value: leverage.value.unwrap_or(1),
                entry_price: position.entry_px,
                position_value: position.position_value.unwrap_or_else(zero),
                unrealized_pnl: position.unrealized_pnl.unwrap_or_else(zero),
                return_on_equity: position.return_on_equity.unwrap_or_else(zero),
            })
        })
        .collect();

    let orders = wire
        .open_orders
        .into_iter()
        .filter_map(|order| {
            let order_id = order.oid?;
            Some(OrderRecord {
                order_id,
                coin: order.coin.unwrap_or_default(),
                side: order.side.unwrap_or_default(),
                limit_price: order.limit_px.unwrap_or_else(zero),
                quantity: order.sz.unwrap_or_else(zero),
                timestamp_ms: order.timestamp.unwrap_or(0),
                order_type: order.order_type.unwrap_or_else(|| "Limit".to_string()),
                reduce_only: order.reduce_only.unwrap_or(false),
                time_in_force: order.tif.unwrap_or_else(|| "Gtc".to_string()),
            })
        })
        .collect();

    Ok(Some(ParsedSnapshot { snapshot_time_ms, summary, positions, orders }))
}

fn zero() -> String {
    "0.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_data() -> Value {
        json!({
            "clearinghouseState": {
                "marginSummary": {
                    "accountValue": "40522414.6792389974",
                    "totalNtlPos": "242594315.540809989",
                    "totalRawUsd": "-202071900.8615710139",
                    "totalMarginUsed": "19009551.0888400003"
                },
                "assetPositions": [
                    {
                        "type": "oneWay",
                        "position": {
                            "coin": "ETH",
                            "szi": "52353.9587",
                            "leverage": {"type": "cross", "value": 15},
                            "entryPx": "3201.03",
                            "positionValue": "157496413.9572100043",
                            "unrealizedPnl": "-10090518.7028960008",
                            "returnOnEquity": "-0.9031597998"
                        }
                    },
                    {
                        "type": "oneWay",
                        "position": {
                            "coin": "XRP",
                            "szi": "0",
                            "leverage": {"type": "isolated", "value": 10}
                        }
                    }
                ],
                "withdrawable": "21512863.5904",
                "time": 1764506145684i64
            },
            "openOrders": [
                {
                    "coin": "ETH",
                    "side": "A",
                    "limitPx": "3778.0",
                    "sz": "22000.0",
                    "oid": 250816029404i64,
                    "timestamp": 1764268400229i64,
                    "reduceOnly": false,
                    "orderType": "Limit",
                    "tif": "Gtc"
                },
                { "coin": "SOL", "side": "B" }
            ]
        })
    }

    #[test]
    fn maps_the_full_payload() {
        let parsed = parse_snapshot(&sample_data()).unwrap().unwrap();

        assert_eq!(parsed.snapshot_time_ms, 1764506145684);
        assert_eq!(parsed.summary.account_value, "40522414.6792389974");
        assert_eq!(parsed.summary.withdrawable, "21512863.5904");
        assert_eq!(parsed.summary.cross_maintenance_margin_used, None);

        // The zero-size XRP position is filtered out.
        assert_eq!(parsed.positions.len(), 1);
        let p = &parsed.positions[0];
        assert_eq!(p.coin, "ETH");
        assert_eq!(p.leverage_type, "cross");
        assert_eq!(p.leverage_value, 15);
        assert_eq!(p.entry_price.as_deref(), Some("3201.03"));

        // The order without an oid is filtered out.
        assert_eq!(parsed.orders.len(), 1);
        assert_eq!(parsed.orders[0].order_id, 250816029404);
        assert_eq!(parsed.orders[0].time_in_force, "Gtc");
    }

    #[test]
    fn defaults_cover_absent_and_null_fields() {
        let data = json!({
            "clearinghouseState": {
                "time": 1700000000000i64,
                "marginSummary": { "accountValue": null },
                "assetPositions": [
                    { "position": { "coin": "BTC", "szi": "1.5" } }
                ]
            },
            "openOrders": [ { "oid": 7 } ]
        });
        let parsed = parse_snapshot(&data).unwrap().unwrap();

        assert_eq!(parsed.summary.account_value, "0.0");
        assert_eq!(parsed.summary.withdrawable, "0.0");

        let p = &parsed.positions[0];
        assert_eq!(p.position_type, "oneWay");
        assert_eq!(p.leverage_type, "cross");
        assert_eq!(p.leverage_value, 1);
        assert_eq!(p.entry_price, None);
        assert_eq!(p.position_value, "0.0");

        let o = &parsed.orders[0];
        assert_eq!(o.order_type, "Limit");
        assert_eq!(o.time_in_force, "Gtc");
        assert!(!o.reduce_only);
        assert_eq!(o.limit_price, "0.0");
    }

    #[test]
    fn missing_snapshot_time_means_keep_waiting() {
        let data = json!({ "clearinghouseState": { "marginSummary": {} } });
        assert!(parse_snapshot(&data).unwrap().is_none());

        let data = json!({ "openOrders": [] });
        assert!(parse_snapshot(&data).unwrap().is_none());
    }

    #[test]
    fn structurally_unusable_payload_is_an_error() {
        let data = json!({ "clearinghouseState": { "time": "not-a-number" } });
        assert!(parse_snapshot(&data).is_err());
    }
}
