// src/notifier.rs
use crate::config::{Config, TelegramConfig};
use crate::models::{format_units, AggregateSnapshot, TransferRecord, TransferStats};
use alloy::primitives::{ruint::UintTryFrom, U256, U512};
use async_trait::async_trait;
use chrono::TimeDelta;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 2;

/// Receives each newly stored transfer and periodic summaries. Delivery
/// problems are the implementation's to log; they never reach the engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_transfer(&self, record: &TransferRecord, stats: &TransferStats);

    async fn notify_summary(&self, snapshot: &AggregateSnapshot);
}

/// Plain-text rendering shared by the notifiers.
#[derive(Debug, Clone)]
pub struct MessageFormat {
    pub symbol: String,
    pub decimals: u32,
}

impl MessageFormat {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            symbol: cfg.token_symbol.clone(),
            decimals: cfg.token_decimals,
        }
    }

    fn amount(&self, amount: U256) -> String {
        format!("{} {}", format_units(amount, self.decimals), self.symbol)
    }

    fn total(&self, total: U512) -> String {
        match <U256 as UintTryFrom<U512>>::uint_try_from(total) {
            Ok(v) => self.amount(v),
            Err(_) => format!("{} raw {}", total, self.symbol),
        }
    }

    pub fn render_transfer(&self, record: &TransferRecord, stats: &TransferStats) -> String {
        let mut lines = vec![
            format!("New transfer of {}", self.amount(record.amount)),
            format!("Block {} · {}", record.block_height, record.timestamp.format("%Y-%m-%d %H:%M:%S UTC")),
            format!("Tx {}", record.tx_id),
            format!("From {}", record.from_address),
        ];
        if let Some(rank) = &stats.initiator_rank {
            lines.push(format!(
                "Initiator {}: {} transfers, rank #{} of {}",
                rank.initiator_address, rank.count, rank.rank, rank.total_initiators
            ));
        }
        lines.push(match stats.since_previous {
            Some(gap) => format!("{} since previous", format_gap(gap)),
            None => "First recorded transfer".to_string(),
        });
        lines.push(format!(
            "Total: {} transfers, {}",
            stats.total_count,
            self.total(stats.total_amount)
        ));
        lines.join("\n")
    }

    pub fn render_summary(&self, snapshot: &AggregateSnapshot) -> String {
        let mut lines = vec![
            format!("Transfers recorded: {}", snapshot.total_count),
            format!("Total amount: {}", self.total(snapshot.total_amount)),
            format!("Distinct initiators: {}", snapshot.distinct_initiators),
            match snapshot.average_gap {
                Some(gap) => format!("Average gap: {}", format_gap(gap)),
                None => "Average gap: unavailable".to_string(),
            },
        ];
        for (i, top) in snapshot.top_initiators.iter().enumerate() {
            lines.push(format!("{}. {} ({})", i + 1, top.initiator_address, top.count));
        }
        lines.join("\n")
    }
}

/// `1d 4h 12m`, dropping leading zero units. Negative gaps (timestamp jitter
/// inside one block range) render with a minus sign.
pub fn format_gap(gap: TimeDelta) -> String {
    let sign = if gap < TimeDelta::zero() { "-" } else { "" };
    let total_minutes = gap.num_minutes().abs();
    let (days, hours, minutes) = (total_minutes / 1440, (total_minutes % 1440) / 60, total_minutes % 60);
    if days > 0 {
        format!("{sign}{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{sign}{hours}h {minutes}m")
    } else {
        format!("{sign}{minutes}m")
    }
}

/// Writes notifications to the log only.
pub struct LogNotifier {
    format: MessageFormat,
}

impl LogNotifier {
    pub fn new(format: MessageFormat) -> Self {
        Self { format }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_transfer(&self, record: &TransferRecord, stats: &TransferStats) {
        info!("🔔 {}", self.format.render_transfer(record, stats).replace('\n', " | "));
    }

    async fn notify_summary(&self, snapshot: &AggregateSnapshot) {
        info!("📊 {}", self.format.render_summary(snapshot).replace('\n', " | "));
    }
}

/// Sends notifications to a Telegram chat.
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    chat_id: String,
    format: MessageFormat,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig, format: MessageFormat) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            client,
            api_base: format!("https://api.telegram.org/bot{}", config.bot_token),
            chat_id: config.chat_id.clone(),
            format,
        })
    }

    async fn send_message(&self, text: &str) {
        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(format!("{}/sendMessage", self.api_base))
                .json(&json!({
                    "chat_id": self.chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => warn!(
                    "Telegram send attempt {}/{} failed: {}",
                    attempt + 1,
                    MAX_RETRIES,
                    resp.status()
                ),
                Err(e) => warn!(
                    "Telegram send attempt {}/{} failed: {}",
                    attempt + 1,
                    MAX_RETRIES,
                    describe_send_error(e)
                ),
            }
            if attempt < MAX_RETRIES - 1 {
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS * (attempt as u64 + 1)))
                    .await;
            }
        }
        warn!("Giving up on Telegram message after {} attempts", MAX_RETRIES);
    }
}

/// The request URL embeds the bot token, so it is stripped before logging.
fn describe_send_error(e: reqwest::Error) -> String {
    format!("{:?}", e.without_url())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify_transfer(&self, record: &TransferRecord, stats: &TransferStats) {
        let body = escape_html(&self.format.render_transfer(record, stats));
        self.send_message(&format!("<b>🔔 Transfer</b>\n{body}")).await;
    }

    async fn notify_summary(&self, snapshot: &AggregateSnapshot) {
        let body = escape_html(&self.format.render_summary(snapshot));
        self.send_message(&format!("<b>📊 Summary</b>\n{body}")).await;
    }
}
