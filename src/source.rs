//! SlotSource trait: read-only view of a booking page.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::error::Result;
use crate::slot::{PageRef, Slot};

/// What a booking page currently shows: slots the operator already holds
/// there and slots open for reservation.
#[derive(Debug, Clone, Default)]
pub struct SlotSnapshot {
    pub held: Vec<Slot>,
    pub available: Vec<Slot>,
}

impl SlotSnapshot {
    /// Find an available slot at the given appointment moment.
    pub fn available_at(&self, wanted: &Slot) -> Option<&Slot> {
        self.available.iter().find(|s| s.same_moment(wanted))
    }
}

/// Read-only access to the current state of a booking page.
///
/// Implementations must distinguish a structural mismatch
/// (`SeekerError::Parse`) from a network failure (`SeekerError::Remote`):
/// the former is never retried.
#[async_trait]
pub trait SlotSource: Send + Sync + Debug {
    /// Fetch the page and return its held and available slots.
    /// Pure read; no remote side effects.
    async fn fetch(&self, page: &PageRef) -> Result<SlotSnapshot>;
}
