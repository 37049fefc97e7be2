//! ReservationAgent trait: claiming and releasing slots.

use async_trait::async_trait;
use std::fmt::Debug;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::slot::Slot;

/// What the remote system hands back for a successful reservation.
#[derive(Debug, Clone)]
pub struct ReservedHold {
    /// Opaque token that releases this reservation.
    pub release_token: String,
    /// Point after which the remote system refuses a release.
    pub release_deadline: Option<DateTime<Utc>>,
}

/// Mutating access to the remote reservation system.
#[async_trait]
pub trait ReservationAgent: Send + Sync + Debug {
    /// Attempt to claim a slot. At-most-once intent: callers must not
    /// retry a failed reserve blindly, since the remote state after a
    /// failure is unknown until re-observed. A lost race surfaces as
    /// `SeekerError::Conflict`.
    async fn reserve(&self, slot: &Slot) -> Result<ReservedHold>;

    /// Give a reservation back. Idempotent: releasing an already-released
    /// hold succeeds. `SeekerError::DeadlinePassed` when the remote
    /// system refuses because its release window closed.
    async fn release(&self, release_token: &str) -> Result<()>;
}
