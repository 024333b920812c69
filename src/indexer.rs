use crate::aggregator;
use crate::config::Config;
use crate::db::{self, RecordFilter};
use crate::locator::HistoricalLocator;
use crate::models::TransferRecord;
use crate::notifier::Notifier;
use crate::poller::{Poller, PollerConfig};
use crate::rpc::LedgerGateway;
use crate::scanner::{EventScanner, ScannerConfig};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// Base pause between attempts of one backfill chunk; grows linearly.
const BACKFILL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Ties the poller, the store and the notifier together.
pub struct Indexer<G> {
    poller: Poller<G>,
    conn: Arc<Mutex<Connection>>,
    notifier: Arc<dyn Notifier>,
    filter: RecordFilter,
    seconds_per_block: f64,
    confirmations: u64,
    max_block_range: u64,
    max_window_retries: u32,
    top_initiators: usize,
    moving_average_max_days: u32,
    retry_delay: Duration,
}

impl<G: LedgerGateway> Indexer<G> {
    pub fn new(
        cfg: &Config,
        conn: Arc<Mutex<Connection>>,
        gateway: Arc<G>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let scanner = EventScanner::new(gateway, ScannerConfig::from_config(cfg)?);
        Ok(Self {
            poller: Poller::new(scanner, PollerConfig::from(cfg)),
            conn,
            notifier,
            filter: RecordFilter::for_pair(&cfg.token_address, &cfg.recipient_address),
            seconds_per_block: cfg.seconds_per_block,
            confirmations: cfg.confirmations,
            max_block_range: cfg.max_block_range.max(1),
            max_window_retries: cfg.max_window_retries,
            top_initiators: cfg.top_initiators,
            moving_average_max_days: cfg.moving_average_max_days,
            retry_delay: BACKFILL_RETRY_DELAY,
        })
    }

    pub fn poller(&self) -> &Poller<G> {
        &self.poller
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| eyre!("database mutex poisoned"))?;
        f(&mut conn)
    }

    /// Scan everything from the first block at or after `since` up to the
    /// confirmed head, store it, send one summary and hand over to live
    /// polling at the head. Returns the number of newly stored records.
    pub async fn backfill(&mut self, since: DateTime<Utc>) -> Result<usize> {
        let locator = HistoricalLocator::new(
            Arc::clone(self.poller.scanner().gateway()),
            self.seconds_per_block,
            self.confirmations,
        );
        let start = locator.locate_block_at_or_after(since).await?;
        let head = self.poller.confirmed_height().await?;
        info!("Backfill since {}: blocks {} → {}", since, start, head);

        let mut records = Vec::new();
        let mut from = start;
        while from <= head {
            let to = from.saturating_add(self.max_block_range - 1).min(head);
            records.extend(self.scan_with_retry(from, to).await);
            if to == head {
                break;
            }
            from = to + 1;
        }

        let stored = self.with_db(|conn| db::insert_transfers(conn, &records))?;
        info!(
            "Backfill done: {} matches, {} newly stored",
            records.len(),
            stored
        );

        let snapshot = self.with_db(|conn| {
            aggregator::snapshot(
                conn,
                &self.filter,
                self.top_initiators,
                Utc::now().date_naive(),
                Some(self.moving_average_max_days),
            )
        })?;
        self.notifier.notify_summary(&snapshot).await;

        self.poller.resume_from(head);
        Ok(stored)
    }

    async fn scan_with_retry(&self, from: u64, to: u64) -> Vec<TransferRecord> {
        let mut attempt: u32 = 0;
        loop {
            match self.poller.scanner().scan(from, to).await {
                Ok(records) => return records,
                Err(e) => {
                    attempt += 1;
                    if self.max_window_retries > 0 && attempt >= self.max_window_retries {
                        error!(
                            "Backfill skipping blocks {} → {} after {} failed attempts: {}",
                            from, to, attempt, e
                        );
                        return Vec::new();
                    }
                    warn!("Backfill blocks {} → {} failed (attempt {}): {}", from, to, attempt, e);
                    sleep(self.retry_delay * attempt).await;
                }
            }
        }
    }

    /// One poll: store the window's records, then commit the window and
    /// notify for every record that was not already stored. If storing
    /// fails the window stays uncommitted and is scanned again next tick.
    /// Returns how many records were new.
    pub async fn tick(&mut self) -> Result<usize> {
        let Some(window) = self.poller.poll_once().await? else {
            return Ok(0);
        };

        let fresh = self.with_db(|conn| db::insert_batch(conn, &window.records))?;
        self.poller.commit(&window);

        let mut stored = 0;
        for (record, new) in window.records.iter().zip(fresh) {
            if !new {
                info!("Transfer {} already stored", record.tx_id);
                continue;
            }
            stored += 1;
            match self.with_db(|conn| aggregator::transfer_stats(conn, &self.filter, record)) {
                Ok(stats) => self.notifier.notify_transfer(record, &stats).await,
                Err(e) => warn!(
                    "Transfer {} stored but its stats failed, not notifying: {:?}",
                    record.tx_id, e
                ),
            }
        }
        Ok(stored)
    }
}

pub async fn run<G: LedgerGateway>(
    cfg: Config,
    conn: Arc<Mutex<Connection>>,
    gateway: Arc<G>,
    notifier: Arc<dyn Notifier>,
) -> Result<()> {
    let mut indexer = Indexer::new(&cfg, conn, gateway, notifier)?;

    if let Some(since) = cfg.backfill_since {
        if let Err(e) = indexer.backfill(since).await {
            warn!("Backfill failed, continuing with live polling: {:?}", e);
        }
    }

    match indexer.poller().cursor().last_scanned_height() {
        Some(height) => info!("Live polling resumes after block {}", height),
        None => info!(
            "Live polling starts {} blocks behind the confirmed head",
            cfg.initial_window_blocks
        ),
    }
    info!(
        "Polling every {}s with {} confirmations",
        cfg.poll_interval.as_secs(),
        cfg.confirmations
    );
    loop {
        match indexer.tick().await {
            Ok(0) => {}
            Ok(n) => info!("Stored {} new transfers", n),
            Err(e) => warn!("Poll failed this round: {:?}", e),
        }
        sleep(cfg.poll_interval).await;
    }
}
