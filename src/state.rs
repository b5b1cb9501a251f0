use crate::market::api::{BootstrapSource, RestBootstrap};
use crate::market::connection::{FeedConnector, TungsteniteConnector};
use crate::market::types::{FeedConfig, FeedSnapshot, FeedStatusSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct FeedHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub snapshots: watch::Receiver<FeedSnapshot>,
    pub status: Arc<RwLock<FeedStatusSnapshot>>,
    pub config: FeedConfig,
}

/// Registry of running feeds keyed by normalized instrument. Feeds share the
/// connector and bootstrap source but no book, ticker or tape state.
pub struct AppState<C = TungsteniteConnector, B = RestBootstrap> {
    pub started_at: Instant,
    pub connector: Arc<C>,
    pub bootstrap: Arc<B>,
    pub feeds: Mutex<HashMap<String, FeedHandle>>,
}

impl<C, B> AppState<C, B>
where
    C: FeedConnector,
    B: BootstrapSource,
{
    pub fn new(connector: C, bootstrap: B) -> Self {
        Self {
            started_at: Instant::now(),
            connector: Arc::new(connector),
            bootstrap: Arc::new(bootstrap),
            feeds: Mutex::new(HashMap::new()),
        }
    }
}

impl AppState {
    pub fn with_rest_base_url(rest_base_url: impl Into<String>) -> Self {
        Self::new(
            TungsteniteConnector,
            RestBootstrap::new(reqwest::Client::new(), rest_base_url),
        )
    }
}
