use crate::error::AppError;
use crate::market::api::{load_bootstrap, BootstrapResult, BootstrapSource};
use crate::market::connection::{
    BackoffPolicy, CloseOutcome, ConnectionManager, FeedConnector, OpenOutcome,
};
use crate::market::metrics::MetricsCollector;
use crate::market::orderbook::OrderBookReconciler;
use crate::market::protocol::{parse_stream_frame, StreamFrame};
use crate::market::tape::{TickerState, TickerUpdate, TradeRecord, TradeTape};
use crate::market::types::{
    FeedConfig, FeedConnectionState, FeedSnapshot, FeedStatusSnapshot, MarketMetadata,
};
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

const CLOSE_HANDSHAKE_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirective {
    Continue,
    PeerClosed,
}

/// All per-instrument state behind one subscription. Every mutation goes
/// through `&mut self`, so frames for one instrument apply strictly in
/// receive order.
#[derive(Debug)]
pub struct FeedEngine {
    instrument: String,
    book: OrderBookReconciler,
    ticker: TickerState,
    tape: TradeTape,
    metrics: MetricsCollector,
    connection: ConnectionManager,
    market: Option<MarketMetadata>,
    phase: FeedConnectionState,
    reason: Option<String>,
    dirty: bool,
}

impl FeedEngine {
    pub fn new(config: &FeedConfig) -> Self {
        let policy = BackoffPolicy {
            floor: Duration::from_millis(config.backoff_floor_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
        };

        Self {
            instrument: config.instrument.clone(),
            book: OrderBookReconciler::new(Duration::from_millis(config.removal_grace_ms)),
            ticker: TickerState::default(),
            tape: TradeTape::new(i64::try_from(config.trade_window_ms).unwrap_or(i64::MAX)),
            metrics: MetricsCollector::new(),
            connection: ConnectionManager::new(config.ws_url(), policy),
            market: None,
            phase: FeedConnectionState::Connecting,
            reason: Some("opening feed".to_string()),
            dirty: false,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn url(&self) -> &str {
        self.connection.url()
    }

    pub fn phase(&self) -> FeedConnectionState {
        self.phase
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn book(&self) -> &OrderBookReconciler {
        &self.book
    }

    pub fn begin_connect(&mut self, attempt_is_retry: bool) {
        if attempt_is_retry {
            self.phase = FeedConnectionState::Reconnecting;
            self.reason = Some("reconnecting".to_string());
        } else {
            self.phase = FeedConnectionState::Connecting;
            self.reason = Some("opening feed".to_string());
        }
    }

    pub fn on_transport_open(&mut self) -> OpenOutcome {
        let outcome = self.connection.on_open();
        if outcome.is_reconnect {
            self.metrics.record_reconnect();
        }
        self.metrics.set_connected(true);

        let cleared = self.book.reset_pending_removals();
        if cleared > 0 {
            tracing::debug!(
                instrument = %self.instrument,
                cleared,
                "dropped removal timers from previous session"
            );
        }

        self.phase = FeedConnectionState::Live;
        self.reason = None;
        self.dirty = true;
        outcome
    }

    pub fn on_transport_close(&mut self, now: Instant, reason: impl Into<String>) -> CloseOutcome {
        let reason = reason.into();
        self.metrics.set_connected(false);
        self.dirty = true;

        let outcome = self.connection.on_close(now);
        match outcome {
            CloseOutcome::ReconnectScheduled { delay } => {
                tracing::info!(
                    instrument = %self.instrument,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "feed closed; reconnect scheduled"
                );
                self.phase = FeedConnectionState::Reconnecting;
            }
            CloseOutcome::Suppressed => {
                self.phase = FeedConnectionState::Stopped;
            }
        }
        self.reason = Some(reason);
        outcome
    }

    pub fn on_transport_error(&mut self, error: &AppError) {
        self.connection.on_error(error);
        self.reason = Some(error.to_string());
    }

    pub fn handle_message(
        &mut self,
        message: Message,
        now: Instant,
        now_ms: i64,
    ) -> FrameDirective {
        match message {
            Message::Text(text) => {
                let mut payload = text.into_bytes();
                self.handle_payload(&mut payload, now, now_ms);
                FrameDirective::Continue
            }
            Message::Binary(mut payload) => {
                self.handle_payload(&mut payload, now, now_ms);
                FrameDirective::Continue
            }
            Message::Close(_) => FrameDirective::PeerClosed,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => FrameDirective::Continue,
        }
    }

    /// Parses and applies one data frame. Malformed frames are counted and
    /// dropped. Returns whether the frame was applied.
    pub fn handle_payload(&mut self, payload: &mut [u8], now: Instant, now_ms: i64) -> bool {
        self.metrics.record_frame(now_ms);

        let parse_started_at = std::time::Instant::now();
        let frame = match parse_stream_frame(payload) {
            Ok(frame) => frame,
            Err(error) => {
                self.metrics.record_dropped_frame();
                tracing::debug!(
                    instrument = %self.instrument,
                    error = %error,
                    "dropping malformed frame"
                );
                return false;
            }
        };
        let parse_elapsed_us = elapsed_us(parse_started_at);

        if let Some(server_timestamp_ms) = frame.server_timestamp_ms() {
            self.metrics.record_server_timestamp(now_ms, server_timestamp_ms);
        }

        let kind = frame.kind();
        let apply_started_at = std::time::Instant::now();
        if let Err(error) = self.apply_frame(frame, now) {
            self.metrics.record_dropped_frame();
            tracing::debug!(
                instrument = %self.instrument,
                kind,
                error = %error,
                "dropping unusable frame"
            );
            return false;
        }
        self.metrics
            .record_timings(parse_elapsed_us, elapsed_us(apply_started_at));
        true
    }

    pub fn apply_frame(&mut self, frame: StreamFrame, now: Instant) -> Result<(), AppError> {
        match frame {
            StreamFrame::OrderbookSnapshot(snapshot) => {
                self.book.apply_snapshot(&snapshot.yes, &snapshot.no, now);
            }
            StreamFrame::OrderbookDelta(delta) => {
                let changed = self
                    .book
                    .apply_delta(delta.side, delta.price, delta.delta, now);
                if !changed {
                    tracing::trace!(
                        instrument = %self.instrument,
                        side = delta.side.as_str(),
                        price = delta.price,
                        delta = delta.delta,
                        "delta absorbed without visible change"
                    );
                }
            }
            StreamFrame::Ticker(ticker) => {
                self.ticker.merge(&TickerUpdate::from(&ticker));
            }
            StreamFrame::Trade(trade) => {
                self.tape.push_live(TradeRecord::try_from(trade)?);
            }
        }
        self.dirty = true;
        Ok(())
    }

    pub fn seed_bootstrap(&mut self, bootstrap: BootstrapResult) {
        tracing::debug!(
            instrument = %self.instrument,
            trades = bootstrap.trades.len(),
            has_market = bootstrap.market.is_some(),
            "bootstrap loaded"
        );
        self.tape.seed_bootstrap(bootstrap.trades);
        if bootstrap.market.is_some() {
            self.market = bootstrap.market;
        }
        self.dirty = true;
    }

    /// Fires every removal whose grace window has passed. Returns `true` when
    /// the reconnect deadline is due and a new connect attempt should start.
    pub fn poll_timers(&mut self, now: Instant) -> bool {
        if self.book.fire_due_removals(now) > 0 {
            self.dirty = true;
        }
        self.connection.take_due_reconnect(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (
            self.book.next_removal_deadline(),
            self.connection.reconnect_deadline(),
        ) {
            (Some(removal), Some(reconnect)) => Some(removal.min(reconnect)),
            (removal, reconnect) => removal.or(reconnect),
        }
    }

    /// Periodic re-evaluation of the trade window, independent of traffic.
    pub fn sweep_expired(&mut self, now_ms: i64) -> usize {
        if !self.tape.has_expired(now_ms) {
            return 0;
        }
        self.dirty = true;
        self.tape.purge_expired(now_ms)
    }

    /// Coalesces every mutation since the previous call into one snapshot.
    pub fn take_snapshot(&mut self, now_ms: i64) -> Option<FeedSnapshot> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.metrics.record_emit();
        Some(self.snapshot(now_ms))
    }

    pub fn snapshot(&self, now_ms: i64) -> FeedSnapshot {
        let trades = self.tape.visible(now_ms);
        let trade_stats = crate::market::tape::aggregate_trades(&trades);
        let metrics = self.metrics.snapshot();

        FeedSnapshot {
            instrument: self.instrument.clone(),
            orderbook: self.book.snapshot(),
            connected: metrics.health.connected,
            ticker: self.ticker.clone(),
            trades,
            trade_stats,
            metrics,
            market: self.market.clone(),
            emitted_at_ms: now_ms,
        }
    }

    pub fn status(&self) -> FeedStatusSnapshot {
        FeedStatusSnapshot {
            state: self.phase,
            instrument: self.instrument.clone(),
            health: self.metrics.health().clone(),
            reason: self.reason.clone(),
        }
    }

    /// Intentional teardown: suppresses reconnects and cancels every
    /// outstanding timer and pending emission.
    pub fn shutdown(&mut self) {
        self.connection.close();
        self.book.clear();
        self.tape.clear();
        self.dirty = false;
        self.metrics.set_connected(false);
        self.phase = FeedConnectionState::Stopped;
        self.reason = Some("feed unsubscribed".to_string());
    }
}

pub async fn run_instrument_feed<C, B>(
    config: FeedConfig,
    connector: Arc<C>,
    bootstrap: Arc<B>,
    publisher: watch::Sender<FeedSnapshot>,
    status_store: Arc<RwLock<FeedStatusSnapshot>>,
    cancel_token: CancellationToken,
) where
    C: FeedConnector,
    B: BootstrapSource,
{
    let mut engine = FeedEngine::new(&config);
    let url = engine.url().to_string();
    publish_status(&status_store, &engine);

    let mut bootstrap_handle = Some({
        let instrument = config.instrument.clone();
        let limit = config.bootstrap_trade_limit;
        tokio::spawn(async move { load_bootstrap(bootstrap.as_ref(), &instrument, limit).await })
    });

    let mut emit_ticker = tokio::time::interval(Duration::from_millis(config.emit_interval_ms));
    emit_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_ticker = tokio::time::interval(Duration::from_millis(config.expiry_sweep_ms));
    sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let connect_timeout = Duration::from_millis(config.backoff_cap_ms);
    let mut stream: Option<C::Stream> = None;
    let mut connecting: Option<BoxFuture<'_, Result<C::Stream, AppError>>> = None;
    let mut connect_due = true;
    let mut attempt = 0_u32;

    loop {
        if connect_due {
            connect_due = false;
            engine.begin_connect(attempt > 0);
            publish_status(&status_store, &engine);
            attempt = attempt.saturating_add(1);
            connecting = Some(bounded_connect(connector.as_ref(), &url, connect_timeout));
        }

        let next_deadline = engine.next_deadline();
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            connected = next_connect(&mut connecting) => {
                connecting = None;
                match connected {
                    Ok(opened) => {
                        let outcome = engine.on_transport_open();
                        tracing::info!(
                            instrument = %config.instrument,
                            url = %url,
                            reconnect = outcome.is_reconnect,
                            "feed connected"
                        );
                        stream = Some(opened);
                    }
                    Err(error) => {
                        engine.on_transport_error(&error);
                        engine.on_transport_close(
                            Instant::now(),
                            format!("connect failed: {error}"),
                        );
                    }
                }
                publish_status(&status_store, &engine);
            }
            frame = next_frame(&mut stream) => {
                let closed_reason = match frame {
                    Some(Ok(message)) => {
                        match engine.handle_message(message, Instant::now(), now_unix_ms()) {
                            FrameDirective::Continue => None,
                            FrameDirective::PeerClosed => Some("closed by peer".to_string()),
                        }
                    }
                    Some(Err(error)) => {
                        let error = AppError::from(error);
                        engine.on_transport_error(&error);
                        Some(format!("transport error: {error}"))
                    }
                    None => Some("stream ended".to_string()),
                };

                if let Some(reason) = closed_reason {
                    stream = None;
                    engine.on_transport_close(Instant::now(), reason);
                    publish_status(&status_store, &engine);
                }
            }
            _ = sleep_until_deadline(next_deadline) => {
                if engine.poll_timers(Instant::now()) {
                    connect_due = true;
                }
            }
            _ = emit_ticker.tick() => {
                if let Some(snapshot) = engine.take_snapshot(now_unix_ms()) {
                    publisher.send_replace(snapshot);
                    publish_status(&status_store, &engine);
                }
            }
            _ = sweep_ticker.tick() => {
                let purged = engine.sweep_expired(now_unix_ms());
                if purged > 0 {
                    tracing::trace!(
                        instrument = %config.instrument,
                        purged,
                        "expired trades purged"
                    );
                }
            }
            bootstrap = join_bootstrap(&mut bootstrap_handle) => {
                engine.seed_bootstrap(bootstrap);
            }
        }
    }

    drop(connecting);
    if let Some(mut open_stream) = stream.take() {
        let close = connector.close(&mut open_stream);
        if tokio::time::timeout(Duration::from_millis(CLOSE_HANDSHAKE_TIMEOUT_MS), close)
            .await
            .is_err()
        {
            tracing::debug!(instrument = %config.instrument, "close handshake timed out");
        }
    }
    if let Some(handle) = bootstrap_handle.take() {
        handle.abort();
    }

    engine.shutdown();
    publish_status(&status_store, &engine);
    tracing::info!(instrument = %config.instrument, "feed stopped");
}

fn publish_status(status_store: &RwLock<FeedStatusSnapshot>, engine: &FeedEngine) {
    *status_store.write() = engine.status();
}

/// Connect attempt bounded by `limit`, so a hung handshake still ends in a
/// close and a scheduled retry.
fn bounded_connect<'a, C>(
    connector: &'a C,
    url: &'a str,
    limit: Duration,
) -> BoxFuture<'a, Result<C::Stream, AppError>>
where
    C: FeedConnector,
{
    let connect = connector.connect(url);
    Box::pin(async move {
        match tokio::time::timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Transport(format!(
                "connect timed out after {} ms",
                limit.as_millis()
            ))),
        }
    })
}

async fn next_connect<T>(
    connecting: &mut Option<BoxFuture<'_, Result<T, AppError>>>,
) -> Result<T, AppError> {
    match connecting.as_mut() {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}

async fn next_frame<S>(stream: &mut Option<S>) -> Option<Result<Message, WsError>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_bootstrap(handle: &mut Option<JoinHandle<BootstrapResult>>) -> BootstrapResult {
    let Some(pending) = handle.as_mut() else {
        return std::future::pending().await;
    };

    let result = pending.await;
    *handle = None;
    result.unwrap_or_else(|error| {
        tracing::warn!(error = %error, "bootstrap task failed");
        BootstrapResult::default()
    })
}

fn elapsed_us(started_at: std::time::Instant) -> u32 {
    started_at.elapsed().as_micros().min(u32::MAX as u128) as u32
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
