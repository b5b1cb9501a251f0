pub mod commands;
pub mod error;
pub mod logging;
pub mod market;
pub mod state;
pub mod timer;

use commands::{
    feed::{subscribe_feed, unsubscribe_all, watch_feed},
    health::health,
};
use error::AppError;
use market::types::{instruments_from_env, rest_base_url_from_env, FeedSnapshot, StartFeedArgs};
use state::AppState;
use tokio::sync::watch;

/// Runs every instrument named in `MARKET_SYNC_TICKERS` until Ctrl-C, logging
/// emitted snapshots.
pub async fn run() -> Result<(), AppError> {
    logging::init_tracing(log_json_from_env());

    let instruments = instruments_from_env()?;
    if instruments.is_empty() {
        return Err(AppError::InvalidArgument(
            "set MARKET_SYNC_TICKERS to at least one instrument".to_string(),
        ));
    }

    let base_args = StartFeedArgs::from_env()?;
    let state = AppState::with_rest_base_url(rest_base_url_from_env());

    let mut watchers = Vec::with_capacity(instruments.len());
    for instrument in instruments {
        let args = StartFeedArgs {
            instrument: Some(instrument),
            ..base_args.clone()
        };
        let session = subscribe_feed(&state, Some(args)).await?;
        tracing::info!(instrument = %session.instrument, url = %session.ws_url, "feed subscribed");

        if let Some(receiver) = watch_feed(&state, &session.instrument).await? {
            watchers.push(tokio::spawn(log_snapshots(receiver)));
        }
    }

    tokio::signal::ctrl_c().await?;
    let report = health(&state).await;
    tracing::info!(
        uptime_ms = report.uptime_ms as u64,
        feeds = report.active_feeds,
        "shutting down"
    );

    unsubscribe_all(&state).await;
    for watcher in watchers {
        if let Err(error) = watcher.await {
            tracing::warn!(error = %error, "snapshot watcher failed");
        }
    }
    Ok(())
}

async fn log_snapshots(mut receiver: watch::Receiver<FeedSnapshot>) {
    while receiver.changed().await.is_ok() {
        let snapshot = receiver.borrow_and_update();
        tracing::debug!(
            instrument = %snapshot.instrument,
            connected = snapshot.connected,
            best_yes = ?snapshot.orderbook.yes.first(),
            best_no = ?snapshot.orderbook.no.first(),
            last_price = ?snapshot.ticker.price,
            trades = snapshot.trades.len(),
            yes_percentage = snapshot.trade_stats.yes_percentage,
            latency_ms = ?snapshot.metrics.health.latency_ms,
            reconnects = snapshot.metrics.health.reconnect_count,
            "snapshot"
        );
    }
}

fn log_json_from_env() -> bool {
    std::env::var("MARKET_SYNC_LOG_JSON")
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
