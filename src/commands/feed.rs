use crate::error::AppError;
use crate::market::api::BootstrapSource;
use crate::market::connection::FeedConnector;
use crate::market::pipeline::run_instrument_feed;
use crate::market::types::{
    normalize_instrument, FeedConnectionState, FeedSession, FeedSnapshot, FeedStatusSnapshot,
    FeedStopResult, StartFeedArgs,
};
use crate::state::{AppState, FeedHandle};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Starts a feed for the instrument in `args`. An existing feed for the same
/// instrument is torn down first, so at most one session runs per instrument.
pub async fn subscribe_feed<C, B>(
    state: &AppState<C, B>,
    args: Option<StartFeedArgs>,
) -> Result<FeedSession, AppError>
where
    C: FeedConnector,
    B: BootstrapSource,
{
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut feeds = state.feeds.lock().await;
        feeds.remove(&config.instrument)
    };
    if let Some(handle) = existing_handle {
        tracing::info!(instrument = %config.instrument, "replacing running feed");
        stop_handle(handle).await;
    }

    let cancellation_token = CancellationToken::new();
    let (publisher, snapshots) = watch::channel(FeedSnapshot::empty(config.instrument.clone()));
    let status = Arc::new(RwLock::new(FeedStatusSnapshot {
        state: FeedConnectionState::Connecting,
        instrument: config.instrument.clone(),
        health: Default::default(),
        reason: Some("feed starting".to_string()),
    }));

    let join_handle = tokio::spawn(run_instrument_feed(
        config.clone(),
        Arc::clone(&state.connector),
        Arc::clone(&state.bootstrap),
        publisher,
        Arc::clone(&status),
        cancellation_token.clone(),
    ));

    let displaced_handle = {
        let mut feeds = state.feeds.lock().await;
        feeds.insert(
            config.instrument.clone(),
            FeedHandle {
                cancellation_token,
                join_handle,
                snapshots,
                status,
                config: config.clone(),
            },
        )
    };
    if let Some(handle) = displaced_handle {
        tracing::info!(
            instrument = %config.instrument,
            "stopping feed displaced by concurrent subscribe"
        );
        stop_handle(handle).await;
    }

    Ok(FeedSession::from_config(&config))
}

/// Stops the instrument's feed. Unsubscribing an instrument that is not
/// running, or a malformed ticker, reports `stopped: false` instead of
/// failing.
pub async fn unsubscribe_feed<C, B>(
    state: &AppState<C, B>,
    instrument: &str,
) -> Result<FeedStopResult, AppError>
where
    C: FeedConnector,
    B: BootstrapSource,
{
    let instrument = match normalize_instrument(instrument) {
        Ok(instrument) => instrument,
        Err(error) => {
            tracing::debug!(error = %error, "unsubscribe for malformed instrument ignored");
            return Ok(FeedStopResult { stopped: false });
        }
    };
    let existing_handle = {
        let mut feeds = state.feeds.lock().await;
        feeds.remove(&instrument)
    };

    let stopped = match existing_handle {
        Some(handle) => {
            stop_handle(handle).await;
            true
        }
        None => false,
    };

    Ok(FeedStopResult { stopped })
}

pub async fn unsubscribe_all<C, B>(state: &AppState<C, B>) -> usize
where
    C: FeedConnector,
    B: BootstrapSource,
{
    let handles: Vec<FeedHandle> = {
        let mut feeds = state.feeds.lock().await;
        feeds.drain().map(|(_, handle)| handle).collect()
    };

    let stopped = handles.len();
    for handle in handles {
        stop_handle(handle).await;
    }
    stopped
}

pub async fn feed_status<C, B>(
    state: &AppState<C, B>,
    instrument: &str,
) -> Result<Option<FeedStatusSnapshot>, AppError>
where
    C: FeedConnector,
    B: BootstrapSource,
{
    let instrument = normalize_instrument(instrument)?;
    let feeds = state.feeds.lock().await;
    Ok(feeds
        .get(&instrument)
        .map(|handle| handle.status.read().clone()))
}

/// Latest emitted snapshot for a running feed.
pub async fn feed_snapshot<C, B>(
    state: &AppState<C, B>,
    instrument: &str,
) -> Result<Option<FeedSnapshot>, AppError>
where
    C: FeedConnector,
    B: BootstrapSource,
{
    let instrument = normalize_instrument(instrument)?;
    let feeds = state.feeds.lock().await;
    Ok(feeds
        .get(&instrument)
        .map(|handle| handle.snapshots.borrow().clone()))
}

/// Subscribes to every future emission of a running feed. The receiver sees
/// the channel close once the feed is stopped.
pub async fn watch_feed<C, B>(
    state: &AppState<C, B>,
    instrument: &str,
) -> Result<Option<watch::Receiver<FeedSnapshot>>, AppError>
where
    C: FeedConnector,
    B: BootstrapSource,
{
    let instrument = normalize_instrument(instrument)?;
    let feeds = state.feeds.lock().await;
    Ok(feeds.get(&instrument).map(|handle| handle.snapshots.clone()))
}

pub async fn list_feeds<C, B>(state: &AppState<C, B>) -> Vec<FeedSession>
where
    C: FeedConnector,
    B: BootstrapSource,
{
    let feeds = state.feeds.lock().await;
    let mut sessions: Vec<FeedSession> = feeds
        .values()
        .map(|handle| FeedSession::from_config(&handle.config))
        .collect();
    sessions.sort_by(|lhs, rhs| lhs.instrument.cmp(&rhs.instrument));
    sessions
}

async fn stop_handle(handle: FeedHandle) {
    handle.cancellation_token.cancel();
    if let Err(error) = handle.join_handle.await {
        tracing::warn!(
            instrument = %handle.config.instrument,
            error = %error,
            "feed task ended abnormally"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::tape::TradeRecord;
    use crate::market::types::MarketMetadata;
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    struct IdleConnector;

    #[async_trait]
    impl FeedConnector for IdleConnector {
        type Stream = BoxStream<'static, Result<Message, WsError>>;

        async fn connect(&self, _url: &str) -> Result<Self::Stream, AppError> {
            Ok(stream::pending().boxed())
        }
    }

    struct NoBootstrap;

    #[async_trait]
    impl BootstrapSource for NoBootstrap {
        async fn fetch_market(&self, _instrument: &str) -> Result<MarketMetadata, AppError> {
            Err(AppError::Transport("offline".to_string()))
        }

        async fn fetch_recent_trades(
            &self,
            _instrument: &str,
            _limit: u16,
        ) -> Result<Vec<TradeRecord>, AppError> {
            Err(AppError::Transport("offline".to_string()))
        }
    }

    fn state() -> AppState<IdleConnector, NoBootstrap> {
        AppState::new(IdleConnector, NoBootstrap)
    }

    fn args(instrument: &str) -> Option<StartFeedArgs> {
        Some(StartFeedArgs {
            instrument: Some(instrument.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn subscribe_then_double_unsubscribe_is_a_no_op() {
        let state = state();
        let session = subscribe_feed(&state, args("kxtest"))
            .await
            .expect("subscribe should succeed");
        assert!(session.running);
        assert_eq!(session.instrument, "KXTEST");

        let first = unsubscribe_feed(&state, "KXTEST")
            .await
            .expect("unsubscribe should succeed");
        let second = unsubscribe_feed(&state, "KXTEST")
            .await
            .expect("repeat unsubscribe should succeed");

        assert!(first.stopped);
        assert!(!second.stopped);
        assert!(list_feeds(&state).await.is_empty());
    }

    #[tokio::test]
    async fn resubscribing_replaces_existing_session() {
        let state = state();
        subscribe_feed(&state, args("KXTEST"))
            .await
            .expect("first subscribe should succeed");
        let mut old_snapshots = watch_feed(&state, "KXTEST")
            .await
            .expect("watch should succeed")
            .expect("feed should be running");

        subscribe_feed(&state, args("KXTEST"))
            .await
            .expect("second subscribe should succeed");

        assert_eq!(list_feeds(&state).await.len(), 1);
        while old_snapshots.changed().await.is_ok() {}

        unsubscribe_all(&state).await;
    }

    #[tokio::test]
    async fn instruments_run_independently() {
        let state = state();
        subscribe_feed(&state, args("KXA")).await.expect("KXA should start");
        subscribe_feed(&state, args("KXB")).await.expect("KXB should start");

        let instruments: Vec<String> = list_feeds(&state)
            .await
            .into_iter()
            .map(|session| session.instrument)
            .collect();
        assert_eq!(instruments, vec!["KXA".to_string(), "KXB".to_string()]);

        unsubscribe_feed(&state, "KXA").await.expect("KXA should stop");
        let remaining = feed_status(&state, "KXB")
            .await
            .expect("status lookup should succeed")
            .expect("KXB should still run");
        assert_ne!(remaining.state, FeedConnectionState::Stopped);
        assert!(feed_snapshot(&state, "KXA")
            .await
            .expect("snapshot lookup should succeed")
            .is_none());

        assert_eq!(unsubscribe_all(&state).await, 1);
    }

    #[tokio::test]
    async fn rejects_invalid_instrument_on_subscribe() {
        let state = state();
        assert!(subscribe_feed(&state, args("not a ticker")).await.is_err());
        assert!(list_feeds(&state).await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribing_malformed_instrument_is_a_no_op() {
        let state = state();
        subscribe_feed(&state, args("KXTEST"))
            .await
            .expect("subscribe should succeed");

        for instrument in ["", "not a ticker", "KX/../ESCAPE"] {
            let result = unsubscribe_feed(&state, instrument)
                .await
                .expect("malformed unsubscribe should not fail");
            assert!(!result.stopped);
        }
        assert_eq!(list_feeds(&state).await.len(), 1);

        unsubscribe_all(&state).await;
    }

    struct OpenStreamGuard(Arc<AtomicUsize>);

    impl Drop for OpenStreamGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct CountingConnector {
        open_streams: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedConnector for CountingConnector {
        type Stream = BoxStream<'static, Result<Message, WsError>>;

        async fn connect(&self, _url: &str) -> Result<Self::Stream, AppError> {
            self.open_streams.fetch_add(1, Ordering::SeqCst);
            let guard = OpenStreamGuard(Arc::clone(&self.open_streams));
            Ok(stream::pending()
                .map(move |message| {
                    let _held = &guard;
                    message
                })
                .boxed())
        }
    }

    #[tokio::test]
    async fn concurrent_resubscribes_leave_no_orphaned_feed() {
        let open_streams = Arc::new(AtomicUsize::new(0));
        let state = AppState::new(
            CountingConnector {
                open_streams: Arc::clone(&open_streams),
            },
            NoBootstrap,
        );
        subscribe_feed(&state, args("KXTEST"))
            .await
            .expect("first subscribe should succeed");
        tokio::task::yield_now().await;

        let (first, second) = tokio::join!(
            subscribe_feed(&state, args("KXTEST")),
            subscribe_feed(&state, args("KXTEST"))
        );
        first.expect("concurrent subscribe should succeed");
        second.expect("concurrent subscribe should succeed");
        assert_eq!(list_feeds(&state).await.len(), 1);

        assert_eq!(unsubscribe_all(&state).await, 1);
        assert_eq!(open_streams.load(Ordering::SeqCst), 0);
    }
}
