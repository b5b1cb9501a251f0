use serde::{Deserialize, Serialize};

const PERF_WINDOW_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub connected: bool,
    pub latency_ms: Option<i64>,
    pub message_count: u64,
    pub reconnect_count: u64,
    pub last_message_at: Option<i64>,
    pub dropped_frames: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedPerfSnapshot {
    pub parse_p50_us: Option<u32>,
    pub parse_p95_us: Option<u32>,
    pub parse_p99_us: Option<u32>,
    pub apply_p50_us: Option<u32>,
    pub apply_p95_us: Option<u32>,
    pub apply_p99_us: Option<u32>,
    pub emit_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedMetricsSnapshot {
    #[serde(flatten)]
    pub health: ConnectionHealth,
    #[serde(flatten)]
    pub perf: FeedPerfSnapshot,
}

#[derive(Debug, Clone)]
struct RollingWindowU32 {
    values: Box<[u32; PERF_WINDOW_CAPACITY]>,
    len: usize,
    cursor: usize,
}

impl Default for RollingWindowU32 {
    fn default() -> Self {
        Self {
            values: Box::new([0; PERF_WINDOW_CAPACITY]),
            len: 0,
            cursor: 0,
        }
    }
}

impl RollingWindowU32 {
    fn push(&mut self, value: u32) {
        self.values[self.cursor] = value;
        self.cursor = (self.cursor + 1) % PERF_WINDOW_CAPACITY;
        if self.len < PERF_WINDOW_CAPACITY {
            self.len += 1;
        }
    }

    fn percentiles(&self) -> (Option<u32>, Option<u32>, Option<u32>) {
        if self.len == 0 {
            return (None, None, None);
        }

        let mut sorted = self.values[..self.len].to_vec();
        sorted.sort_unstable();

        (
            percentile_from_sorted(&sorted, 50),
            percentile_from_sorted(&sorted, 95),
            percentile_from_sorted(&sorted, 99),
        )
    }
}

fn percentile_from_sorted(sorted_values: &[u32], percentile: usize) -> Option<u32> {
    if sorted_values.is_empty() {
        return None;
    }
    let max_index = sorted_values.len().saturating_sub(1);
    let index = max_index.saturating_mul(percentile).saturating_div(100);
    sorted_values.get(index).copied()
}

/// Health and latency figures for one instrument feed. Only the dispatcher
/// that owns the feed mutates it.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    health: ConnectionHealth,
    parse_us: RollingWindowU32,
    apply_us: RollingWindowU32,
    emit_count: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.health.connected = connected;
    }

    pub fn record_reconnect(&mut self) {
        self.health.reconnect_count = self.health.reconnect_count.saturating_add(1);
    }

    pub fn record_frame(&mut self, received_at_ms: i64) {
        self.health.message_count = self.health.message_count.saturating_add(1);
        self.health.last_message_at = Some(received_at_ms);
    }

    /// Latency is receipt wall-clock time minus the server's embedded stamp.
    /// Clock skew can make the raw difference negative; it is floored at zero.
    pub fn record_server_timestamp(&mut self, received_at_ms: i64, server_timestamp_ms: i64) {
        let latency_ms = signed_time_delta_ms(received_at_ms, server_timestamp_ms).max(0);
        self.health.latency_ms = Some(latency_ms);
    }

    pub fn record_dropped_frame(&mut self) {
        self.health.dropped_frames = self.health.dropped_frames.saturating_add(1);
    }

    pub fn record_timings(&mut self, parse_us: u32, apply_us: u32) {
        self.parse_us.push(parse_us);
        self.apply_us.push(apply_us);
    }

    pub fn record_emit(&mut self) {
        self.emit_count = self.emit_count.saturating_add(1);
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        let (parse_p50_us, parse_p95_us, parse_p99_us) = self.parse_us.percentiles();
        let (apply_p50_us, apply_p95_us, apply_p99_us) = self.apply_us.percentiles();

        FeedMetricsSnapshot {
            health: self.health.clone(),
            perf: FeedPerfSnapshot {
                parse_p50_us,
                parse_p95_us,
                parse_p99_us,
                apply_p50_us,
                apply_p95_us,
                apply_p99_us,
                emit_count: self.emit_count,
            },
        }
    }
}

pub fn signed_time_delta_ms(lhs_ms: i64, rhs_ms: i64) -> i64 {
    let delta = (lhs_ms as i128) - (rhs_ms as i128);
    delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
