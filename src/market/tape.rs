use crate::market::orderbook::BookSide;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Latest best-of-book / activity view. Every field stays `None` until first
/// observed and is never cleared by a later message that omits it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TickerState {
    pub price: Option<i64>,
    pub volume: Option<i64>,
    pub open_interest: Option<i64>,
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
    pub updated_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickerUpdate {
    pub price: Option<i64>,
    pub volume: Option<i64>,
    pub open_interest: Option<i64>,
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
    pub server_timestamp_ms: Option<i64>,
}

impl TickerState {
    /// Merges the defined fields of `update`. Returns whether anything changed.
    pub fn merge(&mut self, update: &TickerUpdate) -> bool {
        let before = self.clone();
        merge_field(&mut self.price, update.price);
        merge_field(&mut self.volume, update.volume);
        merge_field(&mut self.open_interest, update.open_interest);
        merge_field(&mut self.best_bid, update.best_bid);
        merge_field(&mut self.best_ask, update.best_ask);
        merge_field(&mut self.updated_at_ms, update.server_timestamp_ms);
        *self != before
    }
}

fn merge_field(slot: &mut Option<i64>, incoming: Option<i64>) {
    if let Some(value) = incoming {
        *slot = Some(value);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub trade_id: Option<String>,
    pub taker_side: BookSide,
    pub price: i64,
    pub quantity: i64,
    pub server_timestamp_ms: i64,
}

impl TradeRecord {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.server_timestamp_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeStats {
    pub yes_volume: i64,
    pub no_volume: i64,
    pub total_volume: i64,
    pub total_notional: f64,
    pub yes_percentage: f64,
}

/// Rolling trade tape combining the bootstrap batch with live pushes.
///
/// Visibility is decided at read time against a trailing window; records are
/// only physically dropped by [`TradeTape::purge_expired`].
#[derive(Debug, Clone)]
pub struct TradeTape {
    live: Vec<TradeRecord>,
    bootstrap: Vec<TradeRecord>,
    window_ms: i64,
}

impl TradeTape {
    pub fn new(window_ms: i64) -> Self {
        Self {
            live: Vec::new(),
            bootstrap: Vec::new(),
            window_ms,
        }
    }

    pub fn seed_bootstrap(&mut self, records: Vec<TradeRecord>) {
        self.bootstrap = records;
    }

    /// Adds a live trade. A later push with an already-seen trade id replaces
    /// the earlier live copy.
    pub fn push_live(&mut self, record: TradeRecord) {
        if let Some(trade_id) = record.trade_id.as_deref() {
            if let Some(existing) = self
                .live
                .iter_mut()
                .find(|candidate| candidate.trade_id.as_deref() == Some(trade_id))
            {
                *existing = record;
                return;
            }
        }
        self.live.push(record);
    }

    /// Deduplicated, non-expired trades, newest first. Live copies win over
    /// bootstrap copies sharing a trade id.
    pub fn visible(&self, now_ms: i64) -> Vec<TradeRecord> {
        let live_ids: HashSet<&str> = self
            .live
            .iter()
            .filter_map(|record| record.trade_id.as_deref())
            .collect();

        let mut merged: Vec<TradeRecord> = self
            .live
            .iter()
            .chain(self.bootstrap.iter().filter(|record| {
                record
                    .trade_id
                    .as_deref()
                    .map(|trade_id| !live_ids.contains(trade_id))
                    .unwrap_or(true)
            }))
            .filter(|record| self.is_within_window(record, now_ms))
            .cloned()
            .collect();

        merged.sort_by(|lhs, rhs| rhs.server_timestamp_ms.cmp(&lhs.server_timestamp_ms));
        merged
    }

    pub fn stats(&self, now_ms: i64) -> TradeStats {
        aggregate_trades(&self.visible(now_ms))
    }

    pub fn purge_expired(&mut self, now_ms: i64) -> usize {
        let before = self.live.len() + self.bootstrap.len();
        let window_ms = self.window_ms;
        let keep = |record: &TradeRecord| record.age_ms(now_ms) <= window_ms;
        self.live.retain(keep);
        self.bootstrap.retain(keep);
        before - (self.live.len() + self.bootstrap.len())
    }

    /// Whether any stored record would be hidden by the window at `now_ms`.
    pub fn has_expired(&self, now_ms: i64) -> bool {
        self.live
            .iter()
            .chain(self.bootstrap.iter())
            .any(|record| !self.is_within_window(record, now_ms))
    }

    pub fn stored_len(&self) -> usize {
        self.live.len() + self.bootstrap.len()
    }

    pub fn clear(&mut self) {
        self.live.clear();
        self.bootstrap.clear();
    }

    fn is_within_window(&self, record: &TradeRecord, now_ms: i64) -> bool {
        record.age_ms(now_ms) <= self.window_ms
    }
}

pub fn aggregate_trades(trades: &[TradeRecord]) -> TradeStats {
    let mut stats = TradeStats::default();
    let mut notional_cents = 0_i64;

    for trade in trades {
        match trade.taker_side {
            BookSide::Yes => stats.yes_volume = stats.yes_volume.saturating_add(trade.quantity),
            BookSide::No => stats.no_volume = stats.no_volume.saturating_add(trade.quantity),
        }
        notional_cents = notional_cents.saturating_add(trade.price.saturating_mul(trade.quantity));
    }

    stats.total_volume = stats.yes_volume.saturating_add(stats.no_volume);
    stats.total_notional = notional_cents as f64 / 100.0;
    stats.yes_percentage = if stats.total_volume == 0 {
        50.0
    } else {
        stats.yes_volume as f64 / stats.total_volume as f64 * 100.0
    };
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_MS: i64 = 300_000;
    const NOW_MS: i64 = 1_760_000_000_000;

    fn trade(
        trade_id: Option<&str>,
        side: BookSide,
        price: i64,
        quantity: i64,
        age_ms: i64,
    ) -> TradeRecord {
        TradeRecord {
            trade_id: trade_id.map(str::to_string),
            taker_side: side,
            price,
            quantity,
            server_timestamp_ms: NOW_MS - age_ms,
        }
    }

    #[test]
    fn ticker_merge_preserves_omitted_fields() {
        let mut state = TickerState::default();
        state.merge(&TickerUpdate {
            price: Some(52),
            volume: Some(1_200),
            open_interest: Some(900),
            ..Default::default()
        });

        let changed = state.merge(&TickerUpdate {
            price: Some(55),
            ..Default::default()
        });

        assert!(changed);
        assert_eq!(state.price, Some(55));
        assert_eq!(state.volume, Some(1_200));
        assert_eq!(state.open_interest, Some(900));
        assert_eq!(state.best_bid, None);
    }

    #[test]
    fn ticker_merge_reports_no_change_for_identical_values() {
        let mut state = TickerState::default();
        let update = TickerUpdate {
            best_bid: Some(49),
            best_ask: Some(51),
            ..Default::default()
        };
        assert!(state.merge(&update));
        assert!(!state.merge(&update));
    }

    #[test]
    fn live_copy_wins_over_bootstrap_copy() {
        let mut tape = TradeTape::new(WINDOW_MS);
        tape.seed_bootstrap(vec![
            trade(Some("t-1"), BookSide::Yes, 40, 10, 60_000),
            trade(Some("t-2"), BookSide::No, 41, 3, 50_000),
        ]);
        tape.push_live(trade(Some("t-1"), BookSide::Yes, 42, 12, 1_000));

        let visible = tape.visible(NOW_MS);
        assert_eq!(visible.len(), 2);
        let deduped = visible
            .iter()
            .find(|record| record.trade_id.as_deref() == Some("t-1"))
            .expect("t-1 should be visible");
        assert_eq!(deduped.price, 42);
        assert_eq!(deduped.quantity, 12);
    }

    #[test]
    fn trades_without_id_are_never_merged() {
        let mut tape = TradeTape::new(WINDOW_MS);
        tape.seed_bootstrap(vec![trade(None, BookSide::Yes, 40, 1, 1_000)]);
        tape.push_live(trade(None, BookSide::Yes, 40, 1, 1_000));
        tape.push_live(trade(None, BookSide::Yes, 40, 1, 1_000));

        assert_eq!(tape.visible(NOW_MS).len(), 3);
    }

    #[test]
    fn window_excludes_trades_older_than_five_minutes() {
        let mut tape = TradeTape::new(WINDOW_MS);
        tape.push_live(trade(Some("old"), BookSide::Yes, 40, 7, 301_000));
        tape.push_live(trade(Some("fresh"), BookSide::No, 60, 4, 299_000));

        let visible = tape.visible(NOW_MS);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].trade_id.as_deref(), Some("fresh"));

        let stats = tape.stats(NOW_MS);
        assert_eq!(stats.yes_volume, 0);
        assert_eq!(stats.no_volume, 4);
        assert_eq!(stats.total_volume, 4);
    }

    #[test]
    fn visible_tape_is_newest_first() {
        let mut tape = TradeTape::new(WINDOW_MS);
        tape.seed_bootstrap(vec![
            trade(Some("a"), BookSide::Yes, 40, 1, 30_000),
            trade(Some("b"), BookSide::Yes, 40, 1, 10_000),
        ]);
        tape.push_live(trade(Some("c"), BookSide::No, 40, 1, 20_000));

        let order: Vec<_> = tape
            .visible(NOW_MS)
            .into_iter()
            .filter_map(|record| record.trade_id)
            .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn purge_drops_only_expired_records() {
        let mut tape = TradeTape::new(WINDOW_MS);
        tape.seed_bootstrap(vec![trade(Some("old"), BookSide::Yes, 40, 1, 400_000)]);
        tape.push_live(trade(Some("new"), BookSide::Yes, 40, 1, 1_000));

        assert!(tape.has_expired(NOW_MS));
        assert_eq!(tape.purge_expired(NOW_MS), 1);
        assert_eq!(tape.stored_len(), 1);
        assert!(!tape.has_expired(NOW_MS));
    }

    #[test]
    fn aggregates_volume_notional_and_yes_share() {
        let stats = aggregate_trades(&[
            trade(Some("1"), BookSide::Yes, 60, 30, 0),
            trade(Some("2"), BookSide::No, 40, 10, 0),
        ]);

        assert_eq!(stats.yes_volume, 30);
        assert_eq!(stats.no_volume, 10);
        assert_eq!(stats.total_volume, 40);
        assert!((stats.total_notional - 22.0).abs() < 1e-9);
        assert!((stats.yes_percentage - 75.0).abs() < 1e-9);
    }

    #[test]
    fn empty_tape_reports_even_split() {
        let stats = aggregate_trades(&[]);
        assert_eq!(stats.total_volume, 0);
        assert_eq!(stats.yes_percentage, 50.0);
    }
}
