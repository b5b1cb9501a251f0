use crate::error::AppError;
use crate::market::orderbook::{BookSide, PriceLevel};
use crate::market::tape::{TickerUpdate, TradeRecord};
use chrono::DateTime;
use serde::Deserialize;

/// One decoded `{ "type": ..., "msg": {...} }` envelope from the feed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", content = "msg", rename_all = "snake_case")]
pub enum StreamFrame {
    OrderbookSnapshot(OrderbookSnapshotWire),
    OrderbookDelta(OrderbookDeltaWire),
    Ticker(TickerWire),
    Trade(TradeWire),
}

impl StreamFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderbookSnapshot(_) => "orderbook_snapshot",
            Self::OrderbookDelta(_) => "orderbook_delta",
            Self::Ticker(_) => "ticker",
            Self::Trade(_) => "trade",
        }
    }

    /// Server-side timestamp embedded in the frame, in unix milliseconds.
    pub fn server_timestamp_ms(&self) -> Option<i64> {
        match self {
            Self::Ticker(ticker) => ticker.ts.map(unix_seconds_to_ms),
            Self::Trade(trade) => trade.timestamp_ms().ok(),
            Self::OrderbookSnapshot(_) | Self::OrderbookDelta(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OrderbookSnapshotWire {
    #[serde(default)]
    pub yes: Vec<PriceLevel>,
    #[serde(default)]
    pub no: Vec<PriceLevel>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OrderbookDeltaWire {
    pub side: BookSide,
    pub price: i64,
    pub delta: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TickerWire {
    pub price: Option<i64>,
    pub volume: Option<i64>,
    pub open_interest: Option<i64>,
    pub yes_bid: Option<i64>,
    pub yes_ask: Option<i64>,
    pub ts: Option<i64>,
}

impl From<&TickerWire> for TickerUpdate {
    fn from(value: &TickerWire) -> Self {
        Self {
            price: value.price,
            volume: value.volume,
            open_interest: value.open_interest,
            best_bid: value.yes_bid,
            best_ask: value.yes_ask,
            server_timestamp_ms: value.ts.map(unix_seconds_to_ms),
        }
    }
}

/// Trade as pushed live and as returned by the bootstrap endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TradeWire {
    pub trade_id: Option<String>,
    pub taker_side: BookSide,
    pub yes_price: i64,
    pub count: i64,
    pub ts: Option<i64>,
    pub created_time: Option<String>,
}

impl TradeWire {
    /// Normalizes `ts` (unix seconds) or `created_time` (RFC 3339) to millis,
    /// preferring `ts` when both are present.
    pub fn timestamp_ms(&self) -> Result<i64, AppError> {
        if let Some(seconds) = self.ts {
            return Ok(unix_seconds_to_ms(seconds));
        }

        let created_time = self.created_time.as_deref().ok_or_else(|| {
            AppError::InvalidArgument("trade carries neither ts nor created_time".to_string())
        })?;
        Ok(DateTime::parse_from_rfc3339(created_time)?.timestamp_millis())
    }
}

impl TryFrom<TradeWire> for TradeRecord {
    type Error = AppError;

    fn try_from(value: TradeWire) -> Result<Self, Self::Error> {
        if value.count < 0 {
            return Err(AppError::InvalidArgument(
                "trade count must be non-negative".to_string(),
            ));
        }

        let server_timestamp_ms = value.timestamp_ms()?;
        Ok(Self {
            trade_id: value.trade_id,
            taker_side: value.taker_side,
            price: value.yes_price,
            quantity: value.count,
            server_timestamp_ms,
        })
    }
}

pub fn parse_stream_frame(payload: &mut [u8]) -> Result<StreamFrame, AppError> {
    Ok(simd_json::serde::from_slice(payload)?)
}

fn unix_seconds_to_ms(seconds: i64) -> i64 {
    seconds.saturating_mul(1_000)
}
