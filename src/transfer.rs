//! TransferCoordinator: the seeker-to-target move protocol.
//!
//! The load-bearing ordering: claim the slot on the target page *before*
//! releasing the seeker hold. A transfer can briefly hold two slots but
//! never drops to zero on its own. Partial completion (target claimed,
//! seeker release failed) is a first-class outcome that the orchestrator
//! escalates rather than auto-corrects.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::booking::ReservationAgent;
use crate::config::RetryConfig;
use crate::error::SeekerError;
use crate::retry::{is_retryable, retry_async, RetryPolicy};
use crate::slot::{HoldRecord, Slot, TargetDescriptor};
use crate::source::SlotSource;

/// Where a partially-completed transfer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PartialStage {
    /// The target reservation is real; releasing the seeker hold failed.
    /// The operator now holds two slots.
    TargetReservedSeekerHeld,
}

impl fmt::Display for PartialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartialStage::TargetReservedSeekerHeld => {
                write!(f, "target slot reserved, seeker hold not released")
            }
        }
    }
}

/// Tagged result of a transfer attempt. This is the contract the
/// orchestrator uses to decide whether the hold is cleared, retained, or
/// escalated.
#[derive(Debug)]
pub enum TransferOutcome {
    /// The hold now lives on the target page; the returned slot carries
    /// the target-side release token.
    Succeeded(Slot),
    /// The target had no matching slot (or lost the race for it).
    /// Nothing changed; the seeker hold is intact.
    TargetUnavailable,
    /// The dangerous case: custody is ambiguous. Never auto-remediated.
    PartiallyCompleted(PartialStage),
    /// The transfer failed before anything destructive happened.
    /// `permanent` distinguishes escalation from a human re-prompt.
    Failed { error: SeekerError, permanent: bool },
}

/// Executes the seeker-to-target move protocol.
pub struct TransferCoordinator {
    source: Arc<dyn SlotSource>,
    agent: Arc<dyn ReservationAgent>,
    retry: RetryConfig,
}

impl TransferCoordinator {
    pub fn new(
        source: Arc<dyn SlotSource>,
        agent: Arc<dyn ReservationAgent>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            source,
            agent,
            retry,
        }
    }

    /// Move `hold` to `target`.
    ///
    /// Steps, each classified before proceeding:
    /// 1. fetch the target page; release any *different* prior hold there
    ///    (failure aborts the transfer before anything destructive);
    /// 2. find an available target slot at the hold's `(date, time)`;
    /// 3. reserve it (a prior target hold at the same moment skips 2-3);
    /// 4. only then release the seeker hold;
    /// 5. success.
    pub async fn transfer(&self, hold: &HoldRecord, target: &TargetDescriptor) -> TransferOutcome {
        info!(
            "starting transfer of {} to target '{}'",
            hold.slot, target.name
        );

        let source = self.source.clone();
        let mut policy = RetryPolicy::new(self.retry.clone());
        let snapshot = match retry_async(|| source.fetch(&target.page), &mut policy).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!("could not observe target '{}': {}", target.name, error);
                return TransferOutcome::Failed {
                    permanent: true,
                    error,
                };
            }
        };

        // A prior hold on the target page at a different moment has to be
        // released first; the page allows one registration per operator.
        if let Some(prior) = snapshot
            .held
            .iter()
            .find(|held| !held.same_moment(&hold.slot))
        {
            let Some(prior_token) = prior.release_token.clone() else {
                return TransferOutcome::Failed {
                    error: SeekerError::parse("prior target hold has no release token"),
                    permanent: true,
                };
            };
            info!(
                "target '{}' already holds {}, releasing it first",
                target.name, prior
            );
            let agent = self.agent.clone();
            let mut policy = RetryPolicy::new(self.retry.clone());
            if let Err(error) = retry_async(|| agent.release(&prior_token), &mut policy).await {
                // Nothing destructive has happened yet; the seeker hold is
                // untouched, so the operator can simply try again.
                warn!(
                    "failed to release prior hold on target '{}': {}",
                    target.name, error
                );
                return TransferOutcome::Failed {
                    permanent: false,
                    error,
                };
            }
        }

        let reserved = match snapshot.held.iter().find(|h| h.same_moment(&hold.slot)) {
            // The target already holds the wanted moment (e.g. a retried
            // transfer whose release step failed last time).
            Some(existing) => existing.clone(),
            None => {
                let Some(candidate) = snapshot.available_at(&hold.slot) else {
                    info!(
                        "target '{}' has no slot at {}, nothing changed",
                        target.name, hold.slot
                    );
                    return TransferOutcome::TargetUnavailable;
                };

                // At-most-once intent: a reserve is never blindly retried.
                match self.agent.reserve(candidate).await {
                    Ok(reserved) => {
                        let mut slot = candidate.clone();
                        slot.release_token = Some(reserved.release_token);
                        slot.release_deadline = reserved.release_deadline;
                        slot
                    }
                    Err(SeekerError::Conflict) => {
                        info!(
                            "lost race for target slot {} on '{}'",
                            hold.slot, target.name
                        );
                        return TransferOutcome::TargetUnavailable;
                    }
                    Err(error) => {
                        let permanent = !is_retryable(&error);
                        warn!(
                            "reserving target slot on '{}' failed: {}",
                            target.name, error
                        );
                        return TransferOutcome::Failed { error, permanent };
                    }
                }
            }
        };

        info!("target slot reserved on '{}', releasing seeker hold", target.name);

        // The deadline governs the timeout path, not this one; still worth
        // knowing that a refusal here is expected rather than anomalous.
        let deadline_passed = hold.deadline_passed(Utc::now());
        if deadline_passed {
            debug!("seeker release deadline already passed, release may be refused");
        }

        let agent = self.agent.clone();
        let mut policy = RetryPolicy::new(self.retry.clone());
        match retry_async(|| agent.release(&hold.release_token), &mut policy).await {
            Ok(()) => {
                info!("transfer of {} to '{}' complete", hold.slot, target.name);
                TransferOutcome::Succeeded(reserved)
            }
            Err(error) => {
                if deadline_passed {
                    info!("seeker release refused past deadline: {}", error);
                } else {
                    warn!("seeker release failed after target reserve: {}", error);
                }
                TransferOutcome::PartiallyCompleted(PartialStage::TargetReservedSeekerHeld)
            }
        }
    }
}

impl fmt::Debug for TransferCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCoordinator")
            .field("retry", &self.retry)
            .finish()
    }
}
