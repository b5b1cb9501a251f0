use crate::market::api::BootstrapSource;
use crate::market::connection::FeedConnector;
use crate::state::AppState;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub active_feeds: usize,
}

pub fn build_health_response(started_at: Instant, active_feeds: usize) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_ms: started_at.elapsed().as_millis(),
        active_feeds,
    }
}

pub async fn health<C, B>(state: &AppState<C, B>) -> HealthResponse
where
    C: FeedConnector,
    B: BootstrapSource,
{
    let active_feeds = state.feeds.lock().await.len();
    build_health_response(state.started_at, active_feeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reports_ok_status_and_feed_count() {
        let response = build_health_response(Instant::now(), 2);

        assert_eq!(response.status, "ok");
        assert_eq!(response.active_feeds, 2);
        assert!(response.uptime_ms <= 1_000);
    }

    #[test]
    fn serializes_camel_case() {
        let encoded = serde_json::to_value(build_health_response(Instant::now(), 0))
            .expect("health should serialize");
        assert_eq!(encoded["activeFeeds"], 0);
        assert!(encoded.get("uptimeMs").is_some());
    }
}
