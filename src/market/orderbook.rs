use crate::timer::DeadlineSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::{Duration, Instant};

pub type Price = i64;
pub type Quantity = i64;
pub type PriceLevel = (Price, Quantity);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Yes,
    No,
}

impl BookSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

/// Immutable copy of both sides of the book, best (highest) price first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderBookSnapshot {
    pub yes: Vec<PriceLevel>,
    pub no: Vec<PriceLevel>,
}

type LevelKey = (BookSide, Price);

/// Authoritative two-sided price-level state for one instrument.
///
/// A level that reaches zero stays visible at zero for the grace window and
/// is only deleted if it is still zero when its removal deadline passes. A
/// zero level always has a pending removal; a positive level never has one.
#[derive(Debug)]
pub struct OrderBookReconciler {
    yes: BTreeMap<Price, Quantity>,
    no: BTreeMap<Price, Quantity>,
    pending_removals: DeadlineSet<LevelKey>,
    grace: Duration,
}

impl OrderBookReconciler {
    pub fn new(grace: Duration) -> Self {
        Self {
            yes: BTreeMap::new(),
            no: BTreeMap::new(),
            pending_removals: DeadlineSet::new(),
            grace,
        }
    }

    /// Replaces both sides with the snapshot payload. Levels that were
    /// positive and are missing (or zero) in the payload are kept at zero and
    /// scheduled for removal instead of vanishing.
    pub fn apply_snapshot(&mut self, yes: &[PriceLevel], no: &[PriceLevel], now: Instant) {
        reconcile_side(
            &mut self.yes,
            &mut self.pending_removals,
            BookSide::Yes,
            yes,
            self.grace,
            now,
        );
        reconcile_side(
            &mut self.no,
            &mut self.pending_removals,
            BookSide::No,
            no,
            self.grace,
            now,
        );
    }

    /// Applies one incremental change. Returns `false` when the delta had no
    /// visible effect (unknown level driven to zero or below, or a level that
    /// is already at zero).
    pub fn apply_delta(
        &mut self,
        side: BookSide,
        price: Price,
        delta: Quantity,
        now: Instant,
    ) -> bool {
        let levels = match side {
            BookSide::Yes => &mut self.yes,
            BookSide::No => &mut self.no,
        };
        let key = (side, price);

        let Some(current) = levels.get(&price).copied() else {
            if delta <= 0 {
                return false;
            }
            levels.insert(price, delta);
            self.pending_removals.cancel(&key);
            return true;
        };

        let next = current.saturating_add(delta).max(0);
        if next > 0 {
            levels.insert(price, next);
            self.pending_removals.cancel(&key);
            return next != current;
        }

        if current == 0 {
            return false;
        }

        levels.insert(price, 0);
        self.pending_removals.schedule(key, self.grace, now);
        true
    }

    /// Deletes zero levels whose grace window has elapsed. Returns the number
    /// of levels physically removed.
    pub fn fire_due_removals(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for (side, price) in self.pending_removals.drain_expired(now) {
            let levels = match side {
                BookSide::Yes => &mut self.yes,
                BookSide::No => &mut self.no,
            };
            if levels.get(&price) == Some(&0) {
                levels.remove(&price);
                removed += 1;
            }
        }
        removed
    }

    pub fn next_removal_deadline(&self) -> Option<Instant> {
        self.pending_removals.next_deadline()
    }

    /// Drops removal timers left over from a previous session along with the
    /// zero levels they were guarding. A fresh snapshot is expected next.
    pub fn reset_pending_removals(&mut self) -> usize {
        let cancelled = self.pending_removals.cancel_all();
        self.yes.retain(|_, quantity| *quantity > 0);
        self.no.retain(|_, quantity| *quantity > 0);
        cancelled
    }

    pub fn clear(&mut self) {
        self.pending_removals.cancel_all();
        self.yes.clear();
        self.no.clear();
    }

    pub fn level(&self, side: BookSide, price: Price) -> Option<Quantity> {
        match side {
            BookSide::Yes => self.yes.get(&price).copied(),
            BookSide::No => self.no.get(&price).copied(),
        }
    }

    pub fn is_removal_pending(&self, side: BookSide, price: Price) -> bool {
        self.pending_removals.is_pending(&(side, price))
    }

    pub fn pending_removal_count(&self) -> usize {
        self.pending_removals.len()
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            yes: descending_levels(&self.yes),
            no: descending_levels(&self.no),
        }
    }
}

fn reconcile_side(
    levels: &mut BTreeMap<Price, Quantity>,
    pending_removals: &mut DeadlineSet<LevelKey>,
    side: BookSide,
    incoming: &[PriceLevel],
    grace: Duration,
    now: Instant,
) {
    let previous = std::mem::take(levels);
    let mut next: BTreeMap<Price, Quantity> = BTreeMap::new();
    for &(price, quantity) in incoming {
        next.insert(price, quantity.max(0));
    }

    for (&price, &previous_quantity) in &previous {
        let incoming_quantity = next.get(&price).copied().unwrap_or(0);
        if incoming_quantity > 0 {
            continue;
        }
        next.insert(price, 0);
        if previous_quantity > 0 {
            pending_removals.schedule((side, price), grace, now);
        }
    }

    // Zero entries with no prior level have nothing to fade out.
    next.retain(|price, quantity| *quantity > 0 || previous.contains_key(price));

    for (&price, &quantity) in &next {
        if quantity > 0 {
            pending_removals.cancel(&(side, price));
        }
    }

    *levels = next;
}

fn descending_levels(levels: &BTreeMap<Price, Quantity>) -> Vec<PriceLevel> {
    levels
        .iter()
        .rev()
        .map(|(&price, &quantity)| (price, quantity))
        .collect()
}
