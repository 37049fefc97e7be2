//! Preference filtering and seen-slot memory.
//!
//! `select` is the pure candidate-narrowing function: given the raw slot
//! set, the operator's window, and the memory of already-surfaced slots,
//! it returns the new matching slots ranked by `(date, time)` ascending.
//! Only the first is acted upon per poll cycle.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use tracing::debug;

use crate::config::MemoryConfig;
use crate::slot::{Slot, SlotKey};

/// The operator's date/time preferences. Bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceWindow {
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub earliest: NaiveTime,
    pub latest: NaiveTime,
}

impl PreferenceWindow {
    pub fn contains(&self, slot: &Slot) -> bool {
        slot.date >= self.first_date
            && slot.date <= self.last_date
            && slot.time >= self.earliest
            && slot.time <= self.latest
    }
}

/// Bounded memory of slots already surfaced to the operator.
///
/// A slot enters the memory when it is offered or attempted, never when it
/// is merely observed. Entries leave only by eviction: oldest-first once
/// `max_entries` is exceeded, and anything older than `max_age`.
#[derive(Debug, Clone)]
pub struct SeenSlotMemory {
    entries: HashMap<SlotKey, DateTime<Utc>>,
    max_entries: usize,
    max_age: Duration,
}

impl SeenSlotMemory {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: config.max_entries.max(1),
            max_age: Duration::hours(config.max_age_hours as i64),
        }
    }

    /// Record that a slot was surfaced. Evicts as needed.
    pub fn note(&mut self, key: SlotKey) {
        self.note_at(key, Utc::now());
    }

    /// Like [`note`](Self::note) with an explicit clock, for tests.
    pub fn note_at(&mut self, key: SlotKey, now: DateTime<Utc>) {
        self.entries.insert(key, now);
        self.evict(now);
    }

    pub fn contains(&self, key: &SlotKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, seen_at| now - *seen_at <= self.max_age);

        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, seen_at)| **seen_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }

        if self.entries.len() < before {
            debug!(
                "evicted {} seen-slot entries, {} remain",
                before - self.entries.len(),
                self.entries.len()
            );
        }
    }
}

/// Narrow the raw slot set to new, matching slots ranked by earliest date,
/// then earliest time. Pure and deterministic.
pub fn select(raw: &[Slot], window: &PreferenceWindow, memory: &SeenSlotMemory) -> Vec<Slot> {
    let mut picked: Vec<Slot> = raw
        .iter()
        .filter(|slot| window.contains(slot) && !memory.contains(&slot.key()))
        .cloned()
        .collect();
    picked.sort_by(|a, b| (a.date, a.time).cmp(&(b.date, b.time)));
    picked
}
