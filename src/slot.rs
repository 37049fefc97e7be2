//! Data model: slots, holds, epochs, and transfer targets.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to one booking page, optionally narrowed to a single test
/// section on that page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    /// Booking page URL.
    pub url: String,
    /// Restrict parsing to one test section. `None` scans every section
    /// found on the page (used for transfer targets).
    pub test_section: Option<String>,
}

impl PageRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            test_section: None,
        }
    }

    pub fn with_section(url: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            test_section: Some(section.into()),
        }
    }
}

/// One reservable appointment slot.
///
/// Identity is `(section_id, date, time)`; the tokens are transport
/// details and excluded from equality and hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    /// Test section this slot belongs to.
    pub section_id: String,
    /// Calendar day of the appointment.
    pub date: NaiveDate,
    /// Time of day of the appointment.
    pub time: NaiveTime,
    /// Opaque token used to claim the slot (a registration URL for the
    /// Moodle adapter).
    pub reserve_token: String,
    /// Opaque token to give the slot back; present only once claimed.
    pub release_token: Option<String>,
    /// Point after which the remote system refuses a release.
    pub release_deadline: Option<DateTime<Utc>>,
}

impl Slot {
    pub fn new(
        section_id: impl Into<String>,
        date: NaiveDate,
        time: NaiveTime,
        reserve_token: impl Into<String>,
    ) -> Self {
        Self {
            section_id: section_id.into(),
            date,
            time,
            reserve_token: reserve_token.into(),
            release_token: None,
            release_deadline: None,
        }
    }

    /// The slot's identity triple.
    pub fn key(&self) -> SlotKey {
        SlotKey {
            section_id: self.section_id.clone(),
            date: self.date,
            time: self.time,
        }
    }

    /// Whether another slot names the same appointment time, ignoring
    /// which section or page it lives on. Transfers match on this.
    pub fn same_moment(&self, other: &Slot) -> bool {
        self.date == other.date && self.time == other.time
    }
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        self.section_id == other.section_id && self.date == other.date && self.time == other.time
    }
}

impl Eq for Slot {}

impl Hash for Slot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.section_id.hash(state);
        self.date.hash(state);
        self.time.hash(state);
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date, self.time.format("%H:%M"))
    }
}

/// Owned identity of a slot, used as the key in [`SeenSlotMemory`].
///
/// [`SeenSlotMemory`]: crate::filter::SeenSlotMemory
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub section_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {}",
            self.section_id,
            self.date,
            self.time.format("%H:%M")
        )
    }
}

/// Monotonically increasing tag distinguishing successive holds.
///
/// A reply or timeout continuation scheduled against an earlier hold
/// compares its epoch against the orchestrator's current one and no-ops
/// when stale instead of corrupting a newer hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HoldEpoch(u64);

impl HoldEpoch {
    pub const ZERO: HoldEpoch = HoldEpoch(0);

    pub fn next(self) -> HoldEpoch {
        HoldEpoch(self.0 + 1)
    }
}

impl fmt::Display for HoldEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The currently-held seeker slot and everything needed to give it back.
///
/// At most one `HoldRecord` is active at a time; the orchestrator owns it
/// exclusively.
#[derive(Debug, Clone)]
pub struct HoldRecord {
    pub slot: Slot,
    pub release_token: String,
    pub release_deadline: Option<DateTime<Utc>>,
    pub epoch: HoldEpoch,
}

impl HoldRecord {
    /// Whether the remote system would by now refuse to release this hold.
    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        match self.release_deadline {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}

/// A configured transfer destination. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Display name shown to the operator.
    pub name: String,
    /// The destination booking page.
    pub page: PageRef,
}
