// src/locator.rs
use crate::rpc::{GatewayError, LedgerGateway};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Blocks searched on either side of the rate-based estimate.
pub const SEARCH_RADIUS: u64 = 1000;

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("chain height query failed: {0}")]
    Height(#[source] GatewayError),
    #[error("head block {0} is unavailable")]
    HeadBlock(u64),
}

/// Maps wall-clock time to block height, assuming a roughly constant block
/// rate and non-decreasing block timestamps. Blocks within `confirmations`
/// of the chain head are never returned.
pub struct HistoricalLocator<G> {
    gateway: Arc<G>,
    seconds_per_block: f64,
    confirmations: u64,
}

impl<G: LedgerGateway> HistoricalLocator<G> {
    pub fn new(gateway: Arc<G>, seconds_per_block: f64, confirmations: u64) -> Self {
        Self {
            gateway,
            seconds_per_block,
            confirmations,
        }
    }

    /// Smallest height whose block timestamp is `>= target`, searched within
    /// `SEARCH_RADIUS` of an estimate. Falls back to the estimate itself if
    /// no block in that window qualifies.
    pub async fn locate_block_at_or_after(&self, target: DateTime<Utc>) -> Result<u64, LocateError> {
        let current = self
            .gateway
            .current_height()
            .await
            .map_err(LocateError::Height)?
            .saturating_sub(self.confirmations);
        let head = match self.gateway.block_by_height(current).await {
            Ok(Some(block)) => block,
            Ok(None) => return Err(LocateError::HeadBlock(current)),
            Err(e) => {
                warn!("Head block {} lookup failed: {}", current, e);
                return Err(LocateError::HeadBlock(current));
            }
        };

        let estimated = self.estimate(current, head.timestamp, target);
        let mut lo = estimated.saturating_sub(SEARCH_RADIUS);
        let mut hi = estimated.saturating_add(SEARCH_RADIUS).min(current);
        debug!(
            "Locating {} from block {} at {}: estimate {} (search {} → {})",
            target, head.height, head.timestamp, estimated, lo, hi
        );

        let mut best = None;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let satisfied = match self.gateway.block_by_height(mid).await {
                Ok(Some(block)) => Some(block.timestamp >= target),
                Ok(None) => None,
                Err(e) => {
                    debug!("Probe at {} failed: {}", mid, e);
                    None
                }
            };
            match satisfied {
                Some(false) => lo = mid + 1,
                // a failed probe counts as "too high"
                Some(true) | None => {
                    if satisfied == Some(true) {
                        best = Some(mid);
                    }
                    if mid == 0 {
                        break;
                    }
                    hi = mid - 1;
                }
            }
        }

        match best {
            Some(height) => {
                info!("Block {} is the first at or after {}", height, target);
                Ok(height)
            }
            None => {
                warn!(
                    "No block within ±{} of estimate {} reaches {}, using the estimate",
                    SEARCH_RADIUS, estimated, target
                );
                Ok(estimated)
            }
        }
    }

    fn estimate(&self, current: u64, head_time: DateTime<Utc>, target: DateTime<Utc>) -> u64 {
        let behind_secs = (head_time - target).num_seconds() as f64;
        let blocks_back = (behind_secs / self.seconds_per_block).floor();
        let estimated = current as f64 - blocks_back;
        estimated.clamp(0.0, current as f64) as u64
    }
}
