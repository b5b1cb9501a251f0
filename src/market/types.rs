use crate::error::AppError;
use crate::market::metrics::{ConnectionHealth, FeedMetricsSnapshot};
use crate::market::orderbook::OrderBookSnapshot;
use crate::market::tape::{TickerState, TradeRecord, TradeStats};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WS_BASE_URL: &str = "ws://127.0.0.1:8080/ws/markets";
pub const DEFAULT_REST_BASE_URL: &str = "http://127.0.0.1:8080/api";
pub const DEFAULT_EMIT_INTERVAL_MS: u64 = 16;
pub const DEFAULT_REMOVAL_GRACE_MS: u64 = 3_000;
pub const DEFAULT_TRADE_WINDOW_MS: u64 = 300_000;
pub const DEFAULT_EXPIRY_SWEEP_MS: u64 = 5_000;
pub const DEFAULT_BACKOFF_FLOOR_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;
pub const DEFAULT_BOOTSTRAP_TRADE_LIMIT: u16 = 50;
pub const MIN_EMIT_INTERVAL_MS: u64 = 8;
pub const MAX_EMIT_INTERVAL_MS: u64 = 1_000;
pub const MAX_REMOVAL_GRACE_MS: u64 = 60_000;
pub const MIN_TRADE_WINDOW_MS: u64 = 1_000;
pub const MAX_TRADE_WINDOW_MS: u64 = 86_400_000;
pub const MIN_EXPIRY_SWEEP_MS: u64 = 250;
pub const MAX_EXPIRY_SWEEP_MS: u64 = 60_000;
pub const MIN_BACKOFF_FLOOR_MS: u64 = 100;
pub const MAX_BACKOFF_CAP_MS: u64 = 600_000;
pub const MAX_BOOTSTRAP_TRADE_LIMIT: u16 = 1_000;
const MAX_TICKER_LEN: usize = 128;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub state: FeedConnectionState,
    pub instrument: String,
    pub health: ConnectionHealth,
    pub reason: Option<String>,
}

impl FeedStatusSnapshot {
    pub fn stopped(instrument: String, reason: Option<String>) -> Self {
        Self {
            state: FeedConnectionState::Stopped,
            instrument,
            health: ConnectionHealth::default(),
            reason,
        }
    }
}

/// Static market description returned by the bootstrap endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarketMetadata {
    #[serde(alias = "ticker")]
    pub instrument: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "close_time")]
    pub close_time: Option<String>,
}

/// Everything a presentation layer needs for one instrument, emitted at most
/// once per emit interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedSnapshot {
    pub instrument: String,
    pub orderbook: OrderBookSnapshot,
    pub connected: bool,
    pub ticker: TickerState,
    pub trades: Vec<TradeRecord>,
    pub trade_stats: TradeStats,
    pub metrics: FeedMetricsSnapshot,
    pub market: Option<MarketMetadata>,
    pub emitted_at_ms: i64,
}

impl FeedSnapshot {
    pub fn empty(instrument: String) -> Self {
        Self {
            instrument,
            orderbook: OrderBookSnapshot::default(),
            connected: false,
            ticker: TickerState::default(),
            trades: Vec::new(),
            trade_stats: crate::market::tape::aggregate_trades(&[]),
            metrics: FeedMetricsSnapshot::default(),
            market: None,
            emitted_at_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartFeedArgs {
    pub instrument: Option<String>,
    pub ws_base_url: Option<String>,
    pub emit_interval_ms: Option<u64>,
    pub removal_grace_ms: Option<u64>,
    pub trade_window_ms: Option<u64>,
    pub expiry_sweep_ms: Option<u64>,
    pub backoff_floor_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub bootstrap_trade_limit: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub instrument: String,
    pub ws_base_url: String,
    pub emit_interval_ms: u64,
    pub removal_grace_ms: u64,
    pub trade_window_ms: u64,
    pub expiry_sweep_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_cap_ms: u64,
    pub bootstrap_trade_limit: u16,
}

impl FeedConfig {
    pub fn ws_url(&self) -> String {
        crate::market::connection::feed_endpoint(&self.ws_base_url, &self.instrument)
    }
}

impl StartFeedArgs {
    /// Builds args from `MARKET_SYNC_*` environment variables. Unset or blank
    /// variables fall back to the defaults applied by [`Self::normalize`].
    pub fn from_env() -> Result<Self, AppError> {
        Ok(Self {
            instrument: env_string("MARKET_SYNC_INSTRUMENT"),
            ws_base_url: env_string("MARKET_SYNC_WS_BASE_URL"),
            emit_interval_ms: env_number("MARKET_SYNC_EMIT_INTERVAL_MS")?,
            removal_grace_ms: env_number("MARKET_SYNC_REMOVAL_GRACE_MS")?,
            trade_window_ms: env_number("MARKET_SYNC_TRADE_WINDOW_MS")?,
            expiry_sweep_ms: env_number("MARKET_SYNC_EXPIRY_SWEEP_MS")?,
            backoff_floor_ms: env_number("MARKET_SYNC_BACKOFF_FLOOR_MS")?,
            backoff_cap_ms: env_number("MARKET_SYNC_BACKOFF_CAP_MS")?,
            bootstrap_trade_limit: env_number("MARKET_SYNC_BOOTSTRAP_TRADE_LIMIT")?,
        })
    }

    pub fn normalize(self) -> Result<FeedConfig, AppError> {
        let instrument = normalize_instrument(self.instrument.as_deref().unwrap_or_default())?;

        let ws_base_url = self
            .ws_base_url
            .unwrap_or_else(|| DEFAULT_WS_BASE_URL.to_string())
            .trim()
            .to_string();
        if !(ws_base_url.starts_with("ws://") || ws_base_url.starts_with("wss://")) {
            return Err(AppError::InvalidArgument(
                "wsBaseUrl must use the ws:// or wss:// scheme".to_string(),
            ));
        }

        let emit_interval_ms = self.emit_interval_ms.unwrap_or(DEFAULT_EMIT_INTERVAL_MS);
        if !(MIN_EMIT_INTERVAL_MS..=MAX_EMIT_INTERVAL_MS).contains(&emit_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "emitIntervalMs must be between {MIN_EMIT_INTERVAL_MS} and {MAX_EMIT_INTERVAL_MS}"
            )));
        }

        let removal_grace_ms = self.removal_grace_ms.unwrap_or(DEFAULT_REMOVAL_GRACE_MS);
        if removal_grace_ms > MAX_REMOVAL_GRACE_MS {
            return Err(AppError::InvalidArgument(format!(
                "removalGraceMs must be at most {MAX_REMOVAL_GRACE_MS}"
            )));
        }

        let trade_window_ms = self.trade_window_ms.unwrap_or(DEFAULT_TRADE_WINDOW_MS);
        if !(MIN_TRADE_WINDOW_MS..=MAX_TRADE_WINDOW_MS).contains(&trade_window_ms) {
            return Err(AppError::InvalidArgument(format!(
                "tradeWindowMs must be between {MIN_TRADE_WINDOW_MS} and {MAX_TRADE_WINDOW_MS}"
            )));
        }

        let expiry_sweep_ms = self.expiry_sweep_ms.unwrap_or(DEFAULT_EXPIRY_SWEEP_MS);
        if !(MIN_EXPIRY_SWEEP_MS..=MAX_EXPIRY_SWEEP_MS).contains(&expiry_sweep_ms) {
            return Err(AppError::InvalidArgument(format!(
                "expirySweepMs must be between {MIN_EXPIRY_SWEEP_MS} and {MAX_EXPIRY_SWEEP_MS}"
            )));
        }

        let backoff_floor_ms = self.backoff_floor_ms.unwrap_or(DEFAULT_BACKOFF_FLOOR_MS);
        let backoff_cap_ms = self.backoff_cap_ms.unwrap_or(DEFAULT_BACKOFF_CAP_MS);
        if backoff_floor_ms < MIN_BACKOFF_FLOOR_MS
            || backoff_cap_ms < backoff_floor_ms
            || backoff_cap_ms > MAX_BACKOFF_CAP_MS
        {
            return Err(AppError::InvalidArgument(format!(
                "backoff must satisfy {MIN_BACKOFF_FLOOR_MS} <= backoffFloorMs <= backoffCapMs <= {MAX_BACKOFF_CAP_MS}"
            )));
        }

        let bootstrap_trade_limit = self
            .bootstrap_trade_limit
            .unwrap_or(DEFAULT_BOOTSTRAP_TRADE_LIMIT);
        if bootstrap_trade_limit > MAX_BOOTSTRAP_TRADE_LIMIT {
            return Err(AppError::InvalidArgument(format!(
                "bootstrapTradeLimit must be at most {MAX_BOOTSTRAP_TRADE_LIMIT}"
            )));
        }

        Ok(FeedConfig {
            instrument,
            ws_base_url,
            emit_interval_ms,
            removal_grace_ms,
            trade_window_ms,
            expiry_sweep_ms,
            backoff_floor_ms,
            backoff_cap_ms,
            bootstrap_trade_limit,
        })
    }
}

pub fn normalize_instrument(raw: &str) -> Result<String, AppError> {
    let instrument = raw.trim().to_ascii_uppercase();
    let valid_chars = instrument
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));

    if instrument.is_empty() || instrument.len() > MAX_TICKER_LEN || !valid_chars {
        return Err(AppError::InvalidArgument(
            "instrument must be a non-empty ticker of ASCII letters, digits, '-', '_' or '.'"
                .to_string(),
        ));
    }
    Ok(instrument)
}

/// Reads `MARKET_SYNC_TICKERS` as a comma-separated list, falling back to
/// the single `MARKET_SYNC_INSTRUMENT`. Duplicates collapse after
/// normalization.
pub fn instruments_from_env() -> Result<Vec<String>, AppError> {
    let raw = env_string("MARKET_SYNC_TICKERS")
        .or_else(|| env_string("MARKET_SYNC_INSTRUMENT"))
        .unwrap_or_default();
    parse_instrument_list(&raw)
}

pub fn parse_instrument_list(raw: &str) -> Result<Vec<String>, AppError> {
    let mut instruments = Vec::new();
    for part in raw.split(',').filter(|part| !part.trim().is_empty()) {
        let instrument = normalize_instrument(part)?;
        if !instruments.contains(&instrument) {
            instruments.push(instrument);
        }
    }
    Ok(instruments)
}

pub fn rest_base_url_from_env() -> String {
    env_string("MARKET_SYNC_REST_BASE_URL").unwrap_or_else(|| DEFAULT_REST_BASE_URL.to_string())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_number<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
{
    match env_string(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::InvalidArgument(format!("{key} must be a number, got '{raw}'"))),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSession {
    pub running: bool,
    pub instrument: String,
    pub ws_url: String,
    pub emit_interval_ms: u64,
    pub removal_grace_ms: u64,
    pub trade_window_ms: u64,
    pub bootstrap_trade_limit: u16,
}

impl FeedSession {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            running: true,
            instrument: config.instrument.clone(),
            ws_url: config.ws_url(),
            emit_interval_ms: config.emit_interval_ms,
            removal_grace_ms: config.removal_grace_ms,
            trade_window_ms: config.trade_window_ms,
            bootstrap_trade_limit: config.bootstrap_trade_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStopResult {
    pub stopped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_for(instrument: &str) -> StartFeedArgs {
        StartFeedArgs {
            instrument: Some(instrument.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn normalizes_defaults() {
        let config = args_for(" kxbtc-25dec31-t100000 ")
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.instrument, "KXBTC-25DEC31-T100000");
        assert_eq!(config.ws_base_url, DEFAULT_WS_BASE_URL);
        assert_eq!(config.emit_interval_ms, DEFAULT_EMIT_INTERVAL_MS);
        assert_eq!(config.removal_grace_ms, DEFAULT_REMOVAL_GRACE_MS);
        assert_eq!(config.trade_window_ms, DEFAULT_TRADE_WINDOW_MS);
        assert_eq!(config.expiry_sweep_ms, DEFAULT_EXPIRY_SWEEP_MS);
        assert_eq!(config.backoff_floor_ms, DEFAULT_BACKOFF_FLOOR_MS);
        assert_eq!(config.backoff_cap_ms, DEFAULT_BACKOFF_CAP_MS);
        assert_eq!(config.bootstrap_trade_limit, DEFAULT_BOOTSTRAP_TRADE_LIMIT);
        assert!(config.ws_url().ends_with("/markets/KXBTC-25DEC31-T100000"));
    }

    #[test]
    fn rejects_missing_or_malformed_instrument() {
        assert!(StartFeedArgs::default().normalize().is_err());
        assert!(args_for("BAD TICKER").normalize().is_err());
        assert!(args_for("KX/../ESCAPE").normalize().is_err());
    }

    #[test]
    fn validates_emit_interval_range() {
        let result = StartFeedArgs {
            emit_interval_ms: Some(1),
            ..args_for("KXTEST")
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_backoff_ordering() {
        let result = StartFeedArgs {
            backoff_floor_ms: Some(5_000),
            backoff_cap_ms: Some(1_000),
            ..args_for("KXTEST")
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_websocket_base_url() {
        let result = StartFeedArgs {
            ws_base_url: Some("https://feed.example".to_string()),
            ..args_for("KXTEST")
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn metadata_accepts_snake_case_wire_fields() {
        let metadata: MarketMetadata = serde_json::from_str(
            r#"{"ticker":"KXTEST","title":"Will it rain?","status":"open","close_time":"2025-12-31T00:00:00Z"}"#,
        )
        .expect("metadata should decode");

        assert_eq!(metadata.instrument, "KXTEST");
        assert_eq!(metadata.status.as_deref(), Some("open"));
        assert_eq!(metadata.close_time.as_deref(), Some("2025-12-31T00:00:00Z"));
    }

    #[test]
    fn empty_snapshot_reports_even_trade_split() {
        let snapshot = FeedSnapshot::empty("KXTEST".to_string());
        assert_eq!(snapshot.trade_stats.yes_percentage, 50.0);
        assert!(!snapshot.connected);
    }

    #[test]
    fn parses_comma_separated_instruments() {
        let instruments =
            parse_instrument_list(" kxa , KXB,,kxa ").expect("list should parse");
        assert_eq!(instruments, vec!["KXA".to_string(), "KXB".to_string()]);
        assert!(parse_instrument_list("KXA,BAD TICKER").is_err());
        assert!(parse_instrument_list("").expect("empty list is valid").is_empty());
    }
}
