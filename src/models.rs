// src/models.rs
use alloy::primitives::{U256, U512};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::fmt::Display;

/// One confirmed transfer of the target amount to the watched recipient.
///
/// Created once by the scanner, never mutated. `tx_id` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub tx_id: String,
    pub block_height: u64,
    pub token_address: String,
    pub from_address: String,
    pub to_address: String,
    /// Sender of the transaction; differs from `from_address` for
    /// contract-mediated transfers.
    pub initiator_address: Option<String>,
    pub amount: U256,
    pub timestamp: DateTime<Utc>,
    pub gas_used: Option<u64>,
    pub gas_price: Option<U256>,
    pub status: Option<bool>,
}

/// Canonical textual timestamp used in the store. Fixed width, so it sorts
/// lexicographically in chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render a raw amount in token units, e.g. `4000000000000000000000` at
/// 18 decimals is `4000`. Falls back to the raw integer when the value does
/// not fit a `Decimal`.
pub fn format_units(amount: U256, decimals: u32) -> String {
    let as_decimal = i128::try_from(amount)
        .ok()
        .and_then(|v| Decimal::try_from_i128_with_scale(v, decimals).ok());
    match as_decimal {
        Some(d) => d.normalize().to_string(),
        None => amount.to_string(),
    }
}

/// Per-initiator count inside a ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiatorCount {
    pub initiator_address: String,
    pub count: u64,
}

/// Dense rank of one initiator among all initiators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiatorRank {
    pub initiator_address: String,
    pub count: u64,
    pub rank: u64,
    pub total_initiators: u64,
}

/// One day of the moving-average series. `None` means "unavailable".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovingAveragePoint {
    pub date: NaiveDate,
    pub average_gap_hours: Option<f64>,
}

/// Figures handed to the notifier alongside a freshly stored record.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStats {
    pub total_count: u64,
    #[serde(serialize_with = "ser_display")]
    pub total_amount: U512,
    pub initiator_rank: Option<InitiatorRank>,
    #[serde(serialize_with = "ser_gap_ms")]
    pub since_previous: Option<TimeDelta>,
}

/// Full read-through summary of the store. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateSnapshot {
    #[serde(serialize_with = "ser_display")]
    pub total_amount: U512,
    pub total_count: u64,
    pub distinct_initiators: u64,
    pub top_initiators: Vec<InitiatorCount>,
    #[serde(serialize_with = "ser_gap_ms")]
    pub average_gap: Option<TimeDelta>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub moving_average: Vec<MovingAveragePoint>,
}

/// API-facing shape of a stored transfer (amounts kept as strings).
#[derive(Debug, Serialize)]
pub struct TransferView {
    pub tx_id: String,
    pub block_height: u64,
    pub token_address: String,
    pub from_address: String,
    pub to_address: String,
    pub initiator_address: Option<String>,
    pub amount: String,
    pub timestamp: String,
    pub gas_used: Option<u64>,
    pub gas_price: Option<String>,
    pub status: Option<bool>,
}

impl From<&TransferRecord> for TransferView {
    fn from(r: &TransferRecord) -> Self {
        Self {
            tx_id: r.tx_id.clone(),
            block_height: r.block_height,
            token_address: r.token_address.clone(),
            from_address: r.from_address.clone(),
            to_address: r.to_address.clone(),
            initiator_address: r.initiator_address.clone(),
            amount: r.amount.to_string(),
            timestamp: format_timestamp(&r.timestamp),
            gas_used: r.gas_used,
            gas_price: r.gas_price.map(|p| p.to_string()),
            status: r.status,
        }
    }
}

fn ser_display<T: Display, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(v)
}

fn ser_gap_ms<S: Serializer>(v: &Option<TimeDelta>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(d) => s.serialize_some(&d.num_milliseconds()),
        None => s.serialize_none(),
    }
}
