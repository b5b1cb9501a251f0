use crate::error::AppError;
use crate::market::protocol::TradeWire;
use crate::market::tape::TradeRecord;
use crate::market::types::MarketMetadata;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// Initial-state collaborator queried once per subscription start.
#[async_trait]
pub trait BootstrapSource: Send + Sync + 'static {
    async fn fetch_market(&self, instrument: &str) -> Result<MarketMetadata, AppError>;

    async fn fetch_recent_trades(
        &self,
        instrument: &str,
        limit: u16,
    ) -> Result<Vec<TradeRecord>, AppError>;
}

#[derive(Debug, Clone)]
pub struct RestBootstrap {
    client: Client,
    base_url: String,
}

impl RestBootstrap {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

fn market_endpoint(base_url: &str, instrument: &str) -> String {
    format!("{base_url}/markets/{instrument}")
}

fn trades_endpoint(base_url: &str, instrument: &str, limit: u16) -> String {
    format!("{base_url}/markets/trades?ticker={instrument}&limit={limit}")
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MarketPayload {
    Wrapped { market: MarketMetadata },
    Bare(MarketMetadata),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TradesPayload {
    Bare(Vec<TradeWire>),
    Wrapped { trades: Vec<TradeWire> },
}

impl TradesPayload {
    fn into_records(self) -> Vec<TradeRecord> {
        let wires = match self {
            Self::Bare(trades) | Self::Wrapped { trades } => trades,
        };

        wires
            .into_iter()
            .filter_map(|wire| match TradeRecord::try_from(wire) {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::debug!(error = %error, "skipping unusable bootstrap trade");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl BootstrapSource for RestBootstrap {
    async fn fetch_market(&self, instrument: &str) -> Result<MarketMetadata, AppError> {
        let endpoint = market_endpoint(&self.base_url, instrument);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<MarketPayload>().await?;
        Ok(match payload {
            MarketPayload::Wrapped { market } | MarketPayload::Bare(market) => market,
        })
    }

    async fn fetch_recent_trades(
        &self,
        instrument: &str,
        limit: u16,
    ) -> Result<Vec<TradeRecord>, AppError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let endpoint = trades_endpoint(&self.base_url, instrument, limit);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let payload = response.json::<TradesPayload>().await?;
        let mut records = payload.into_records();
        records.truncate(usize::from(limit));
        Ok(records)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapResult {
    pub market: Option<MarketMetadata>,
    pub trades: Vec<TradeRecord>,
}

/// Fetches metadata and recent trades concurrently. Failures degrade to an
/// empty result for that half and are logged, never propagated.
pub async fn load_bootstrap<B>(source: &B, instrument: &str, trade_limit: u16) -> BootstrapResult
where
    B: BootstrapSource + ?Sized,
{
    let (market_result, trades_result) = tokio::join!(
        source.fetch_market(instrument),
        source.fetch_recent_trades(instrument, trade_limit)
    );

    let market = match market_result {
        Ok(market) => Some(market),
        Err(error) => {
            tracing::warn!(instrument, error = %error, "market metadata unavailable");
            None
        }
    };

    let trades = match trades_result {
        Ok(trades) => trades,
        Err(error) => {
            tracing::warn!(
                instrument,
                error = %error,
                "bootstrap trades unavailable; starting with empty tape"
            );
            Vec::new()
        }
    };

    BootstrapResult { market, trades }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::orderbook::BookSide;

    struct FailingTrades;

    #[async_trait]
    impl BootstrapSource for FailingTrades {
        async fn fetch_market(&self, instrument: &str) -> Result<MarketMetadata, AppError> {
            Ok(MarketMetadata {
                instrument: instrument.to_string(),
                ..Default::default()
            })
        }

        async fn fetch_recent_trades(
            &self,
            _instrument: &str,
            _limit: u16,
        ) -> Result<Vec<TradeRecord>, AppError> {
            Err(AppError::Transport("connection refused".to_string()))
        }
    }

    #[test]
    fn market_endpoint_embeds_instrument() {
        let endpoint = market_endpoint("https://api.example/v2", "KXTEST");
        assert_eq!(endpoint, "https://api.example/v2/markets/KXTEST");
    }

    #[test]
    fn trades_endpoint_uses_instrument_and_limit() {
        let endpoint = trades_endpoint("https://api.example/v2", "KXTEST", 50);
        assert!(endpoint.contains("/markets/trades"));
        assert!(endpoint.contains("ticker=KXTEST"));
        assert!(endpoint.contains("limit=50"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let source = RestBootstrap::new(Client::new(), "https://api.example/v2/");
        assert_eq!(source.base_url, "https://api.example/v2");
    }

    #[test]
    fn decodes_wrapped_and_bare_trade_payloads() {
        let wrapped: TradesPayload = serde_json::from_str(
            r#"{"trades":[{"trade_id":"t1","taker_side":"yes","yes_price":55,"count":2,"created_time":"2025-10-09T08:53:20Z"}],"cursor":""}"#,
        )
        .expect("wrapped payload should decode");
        let records = wrapped.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].server_timestamp_ms, 1_760_000_000_000);
        assert_eq!(records[0].taker_side, BookSide::Yes);

        let bare: TradesPayload = serde_json::from_str(
            r#"[{"taker_side":"no","yes_price":40,"count":1,"ts":1760000000},{"taker_side":"no","yes_price":40,"count":1}]"#,
        )
        .expect("bare payload should decode");
        assert_eq!(bare.into_records().len(), 1);
    }

    #[test]
    fn decodes_wrapped_market_payload() {
        let payload: MarketPayload =
            serde_json::from_str(r#"{"market":{"ticker":"KXTEST","title":"Test market"}}"#)
                .expect("market payload should decode");
        let MarketPayload::Wrapped { market } = payload else {
            panic!("expected wrapped market payload");
        };
        assert_eq!(market.title.as_deref(), Some("Test market"));
    }

    #[tokio::test]
    async fn trade_fetch_failure_degrades_to_empty_tape() {
        let result = load_bootstrap(&FailingTrades, "KXTEST", 50).await;
        assert!(result.trades.is_empty());
        assert_eq!(
            result.market.map(|market| market.instrument),
            Some("KXTEST".to_string())
        );
    }
}
