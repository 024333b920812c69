// src/poller.rs
use crate::config::Config;
use crate::models::TransferRecord;
use crate::rpc::LedgerGateway;
use crate::scanner::{EventScanner, ScanError};
use tracing::{debug, error, info, warn};

/// Process-local scan progress. Unset only before the first poll; once set
/// it never moves backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCursor {
    last_scanned_height: Option<u64>,
}

impl ScanCursor {
    pub fn last_scanned_height(&self) -> Option<u64> {
        self.last_scanned_height
    }

    fn advance(&mut self, height: u64) {
        self.last_scanned_height = Some(match self.last_scanned_height {
            Some(last) => last.max(height),
            None => height,
        });
    }
}

/// Result of one successful poll, not yet committed to the cursor.
#[derive(Debug)]
pub struct ScanWindow {
    pub start: u64,
    pub end: u64,
    pub records: Vec<TransferRecord>,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Width of the first window when no backfill seeded the cursor.
    pub initial_window_blocks: u64,
    /// Blocks behind the head that are not scanned yet.
    pub confirmations: u64,
    /// Consecutive failures of one window before skipping it. 0 retries forever.
    pub max_window_retries: u32,
}

impl From<&Config> for PollerConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            initial_window_blocks: cfg.initial_window_blocks,
            confirmations: cfg.confirmations,
            max_window_retries: cfg.max_window_retries,
        }
    }
}

pub struct Poller<G> {
    scanner: EventScanner<G>,
    config: PollerConfig,
    cursor: ScanCursor,
    consecutive_failures: u32,
}

impl<G: LedgerGateway> Poller<G> {
    pub fn new(scanner: EventScanner<G>, config: PollerConfig) -> Self {
        Self {
            scanner,
            config,
            cursor: ScanCursor::default(),
            consecutive_failures: 0,
        }
    }

    /// Treat everything up to `height` as already scanned (e.g. by a backfill).
    pub fn resume_from(&mut self, height: u64) {
        self.cursor.advance(height);
    }

    pub fn cursor(&self) -> ScanCursor {
        self.cursor
    }

    pub fn scanner(&self) -> &EventScanner<G> {
        &self.scanner
    }

    /// Chain head minus the confirmation lag.
    pub async fn confirmed_height(&self) -> Result<u64, ScanError> {
        let head = self
            .scanner
            .gateway()
            .current_height()
            .await
            .map_err(ScanError::Height)?;
        Ok(head.saturating_sub(self.config.confirmations))
    }

    /// Scan the next window `[last + 1, head]`, or the initial window on the
    /// first call. Returns `None`, without scanning, if the chain has not
    /// advanced. A successful scan does not move the cursor: the caller
    /// `commit`s the window once its records are stored.
    pub async fn poll_once(&mut self) -> Result<Option<ScanWindow>, ScanError> {
        let head = self.confirmed_height().await?;

        let (start, end) = match self.cursor.last_scanned_height {
            None => (head.saturating_sub(self.config.initial_window_blocks), head),
            Some(last) if head <= last => {
                debug!("No new blocks (head {}, last scanned {})", head, last);
                return Ok(None);
            }
            Some(last) => (last + 1, head),
        };

        match self.scanner.scan(start, end).await {
            Ok(records) => {
                self.consecutive_failures = 0;
                if !records.is_empty() {
                    info!("Window {} → {} produced {} records", start, end, records.len());
                }
                Ok(Some(ScanWindow {
                    start,
                    end,
                    records,
                }))
            }
            Err(e) => {
                self.consecutive_failures += 1;
                let limit = self.config.max_window_retries;
                if limit > 0 && self.consecutive_failures >= limit {
                    error!(
                        "Skipping blocks {} → {} after {} failed attempts: {}",
                        start, end, self.consecutive_failures, e
                    );
                    self.cursor.advance(end);
                    self.consecutive_failures = 0;
                } else {
                    warn!(
                        "Window {} → {} failed (attempt {}), will retry: {}",
                        start, end, self.consecutive_failures, e
                    );
                }
                Err(e)
            }
        }
    }

    /// Mark a scanned window as done. The next poll starts after its end.
    pub fn commit(&mut self, window: &ScanWindow) {
        self.cursor.advance(window.end);
    }
}
