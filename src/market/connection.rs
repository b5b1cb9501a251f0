//! Streaming session lifecycle for one instrument.
//!
//! [`ConnectionManager`] is the pure state machine (open / close / error /
//! intentional close) with capped exponential backoff. [`FeedConnector`] is
//! the transport seam; [`TungsteniteConnector`] is the production websocket.

use crate::error::AppError;
use crate::timer::DeadlineSet;
use async_trait::async_trait;
use futures_util::Stream;
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_millis(1_000),
            cap: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOutcome {
    /// `false` for the first successful open of the subscription.
    pub is_reconnect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    ReconnectScheduled { delay: Duration },
    Suppressed,
}

#[derive(Debug)]
pub struct ConnectionManager {
    url: String,
    policy: BackoffPolicy,
    next_delay: Duration,
    opened_once: bool,
    intentionally_closed: bool,
    reconnect_timer: DeadlineSet<()>,
}

impl ConnectionManager {
    pub fn new(url: String, policy: BackoffPolicy) -> Self {
        Self {
            url,
            policy,
            next_delay: policy.floor,
            opened_once: false,
            intentionally_closed: false,
            reconnect_timer: DeadlineSet::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn on_open(&mut self) -> OpenOutcome {
        self.next_delay = self.policy.floor;
        self.reconnect_timer.cancel(&());
        let is_reconnect = self.opened_once;
        self.opened_once = true;
        OpenOutcome { is_reconnect }
    }

    /// Handles any close that was not requested through [`Self::close`] by
    /// scheduling a reconnect after the current backoff, then doubling it.
    pub fn on_close(&mut self, now: Instant) -> CloseOutcome {
        if self.intentionally_closed {
            return CloseOutcome::Suppressed;
        }

        let delay = self.next_delay;
        self.reconnect_timer.schedule((), delay, now);
        self.next_delay = delay.saturating_mul(2).min(self.policy.cap);
        CloseOutcome::ReconnectScheduled { delay }
    }

    /// Errors never reconnect on their own; the close that follows does.
    pub fn on_error(&self, error: &AppError) {
        tracing::warn!(url = %self.url, error = %error, "feed transport error");
    }

    pub fn close(&mut self) {
        self.intentionally_closed = true;
        self.reconnect_timer.cancel_all();
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_timer.next_deadline()
    }

    pub fn take_due_reconnect(&mut self, now: Instant) -> bool {
        !self.reconnect_timer.drain_expired(now).is_empty()
    }

    pub fn current_backoff(&self) -> Duration {
        self.next_delay
    }
}

#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    type Stream: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static;

    async fn connect(&self, url: &str) -> Result<Self::Stream, AppError>;

    /// Sends a clean close on intentional teardown.
    async fn close(&self, _stream: &mut Self::Stream) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl FeedConnector for TungsteniteConnector {
    type Stream = FeedWsStream;

    async fn connect(&self, url: &str) -> Result<Self::Stream, AppError> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let (stream, _) = connect_async_with_config(url, Some(ws_config), true).await?;
        Ok(stream)
    }

    async fn close(&self, stream: &mut Self::Stream) {
        if let Err(error) = stream.close(None).await {
            tracing::debug!(error = %error, "websocket close handshake failed");
        }
    }
}

pub fn feed_endpoint(ws_base_url: &str, ticker: &str) -> String {
    format!("{}/{}", ws_base_url.trim_end_matches('/'), ticker)
}
