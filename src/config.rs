use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::risk::HaltModel;

pub const DEFAULT_BASE_URL: &str = "https://api.bybit.com";

#[derive(Debug, Clone)]
pub struct Config {
    // API Credentials
    pub api_key: String,
    pub api_secret: String,

    // Endpoints
    pub base_url: String,
    pub recv_window_ms: u64,

    pub strategy: StrategyConfig,
    pub halt_model: HaltModel,

    // Mode
    pub log_level: String,

    // Alerts
    pub discord_webhook: Option<String>,
}

/// Timing, sizing and selection parameters of the strategy.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// USD notional per entry.
    pub notional_usd: Decimal,
    /// Minimum |funding rate| to trade (0.005 = 0.5%).
    pub funding_threshold: Decimal,
    pub top_n: usize,
    /// Entry fires this long before the funding event.
    pub pre_offset: ChronoDuration,
    /// Exit fires this long after the funding event.
    pub post_offset: ChronoDuration,
    pub poll_interval: Duration,
    pub monitor_interval: Duration,
    pub close_max_attempts: u32,
    pub close_retry_delay: Duration,
    pub settle_coin: String,
    pub funding_window: FundingWindow,
}

/// Bounds used to attribute funding settlements to a trade.
///
/// These are heuristics, not venue settlement semantics.
#[derive(Debug, Clone, Copy)]
pub struct FundingWindow {
    /// Query padding on both sides of the holding period.
    pub query_pad: ChronoDuration,
    /// Accept settlements this long before the open.
    pub open_grace: ChronoDuration,
    /// Accept settlements this long after the close.
    pub close_grace: ChronoDuration,
}

impl Default for FundingWindow {
    fn default() -> Self {
        Self {
            query_pad: ChronoDuration::hours(12),
            open_grace: ChronoDuration::minutes(30),
            close_grace: ChronoDuration::minutes(5),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            notional_usd: dec!(100),
            funding_threshold: dec!(0.005),
            top_n: 10,
            pre_offset: ChronoDuration::seconds(5),
            post_offset: ChronoDuration::seconds(5),
            poll_interval: Duration::from_millis(2000),
            monitor_interval: Duration::from_secs(60),
            close_max_attempts: 5,
            close_retry_delay: Duration::from_millis(1000),
            settle_coin: "USDT".to_string(),
            funding_window: FundingWindow::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = StrategyConfig::default();
        let strategy = StrategyConfig {
            notional_usd: env_or("NOTIONAL_USD", defaults.notional_usd)?,
            funding_threshold: env_or("FUNDING_THRESHOLD", defaults.funding_threshold)?,
            top_n: env_or("TOP_N", defaults.top_n)?,
            pre_offset: ChronoDuration::seconds(env_or("PRE_OFFSET_SECS", 5i64)?),
            post_offset: ChronoDuration::seconds(env_or("POST_OFFSET_SECS", 5i64)?),
            poll_interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", 2000u64)?),
            monitor_interval: Duration::from_secs(env_or("MONITOR_INTERVAL_SECS", 60u64)?),
            close_max_attempts: env_or("CLOSE_MAX_ATTEMPTS", defaults.close_max_attempts)?,
            close_retry_delay: Duration::from_millis(env_or("CLOSE_RETRY_DELAY_MS", 1000u64)?),
            settle_coin: env::var("SETTLE_COIN").unwrap_or(defaults.settle_coin),
            funding_window: FundingWindow::default(),
        };

        let halt_model = match env::var("HALT_MODEL")
            .unwrap_or_else(|_| "drawdown".to_string())
            .as_str()
        {
            "drawdown" => HaltModel::Drawdown {
                limit_fraction: env_or("DRAWDOWN_LIMIT", dec!(0.03))?,
            },
            "cumulative_pnl" => HaltModel::CumulativePnl {
                stop_fraction: env_or("PNL_STOP_FRACTION", dec!(0.5))?,
                notional_usd: strategy.notional_usd,
            },
            other => anyhow::bail!("Invalid HALT_MODEL: {} (expected drawdown|cumulative_pnl)", other),
        };

        Ok(Config {
            // API Credentials
            api_key: env::var("BYBIT_API_KEY").context("BYBIT_API_KEY not set")?,
            api_secret: env::var("BYBIT_API_SECRET").context("BYBIT_API_SECRET not set")?,

            // Endpoints
            base_url: env::var("BYBIT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            recv_window_ms: env_or("BYBIT_RECV_WINDOW", 5000u64)?,

            strategy,
            halt_model,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            discord_webhook: env::var("DISCORD_WEBHOOK").ok(),
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}", key)),
        Err(_) => Ok(default),
    }
}
