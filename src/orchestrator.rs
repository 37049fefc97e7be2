//! SeekerOrchestrator: the control loop tying polling cadence, hold
//! lifecycle, the human-reply wait, and transfer execution together.
//!
//! The orchestrator is a single task that owns all mutable state. A poll
//! tick and a reply wait are phases of one loop, so two
//! poll-and-maybe-reserve cycles can never overlap by construction, not
//! by locking. Reply and timeout reactions carry the [`HoldEpoch`] they
//! were scheduled against and no-op when the hold has since changed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::booking::ReservationAgent;
use crate::channel::{parse_target_choice, ConversationId, ResponseChannel};
use crate::config::{Settings, POLL_INTERVAL_FLOOR_SECS};
use crate::error::SeekerError;
use crate::filter::{select, PreferenceWindow, SeenSlotMemory};
use crate::retry::{retry_async, RetryPolicy};
use crate::slot::{HoldEpoch, HoldRecord, PageRef, Slot, SlotKey, TargetDescriptor};
use crate::source::SlotSource;
use crate::transfer::{TransferCoordinator, TransferOutcome};

/// Which phase of its lifecycle the orchestrator is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No active hold; polling enabled.
    Searching,
    /// Slot reserved on the seeker page; operator prompt outstanding.
    Holding,
    /// Operator replied; a transfer is in progress.
    Transferring,
    /// Terminal for this hold: operator attention required. Polling on
    /// this section stays suspended; the process stays alive.
    Escalated,
}

/// Why [`SeekerOrchestrator::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Escalated { reason: String },
}

/// The core state machine. See the module docs for the concurrency model.
pub struct SeekerOrchestrator {
    seeker_page: PageRef,
    window: PreferenceWindow,
    targets: Vec<TargetDescriptor>,
    poll_interval: Duration,
    poll_jitter: Duration,
    reply_timeout: Duration,
    max_transfer_attempts: u32,
    retry: crate::config::RetryConfig,

    source: Arc<dyn SlotSource>,
    agent: Arc<dyn ReservationAgent>,
    channel: Arc<dyn ResponseChannel>,
    coordinator: TransferCoordinator,

    memory: SeenSlotMemory,
    hold: Option<HoldRecord>,
    epoch: HoldEpoch,
    phase: Phase,
    conversation: Option<ConversationId>,
    transfer_attempts: u32,
    parse_reported: bool,
    escalation: Option<String>,
}

impl SeekerOrchestrator {
    pub fn new(
        settings: &Settings,
        source: Arc<dyn SlotSource>,
        agent: Arc<dyn ReservationAgent>,
        channel: Arc<dyn ResponseChannel>,
    ) -> Self {
        let coordinator =
            TransferCoordinator::new(source.clone(), agent.clone(), settings.retry.clone());
        Self {
            seeker_page: settings.seeker_page(),
            window: settings.window(),
            targets: settings.target_descriptors(),
            poll_interval: settings.poll_interval(),
            poll_jitter: settings.poll_jitter(),
            reply_timeout: settings.reply_timeout(),
            max_transfer_attempts: settings.transfer.max_attempts,
            retry: settings.retry.clone(),
            source,
            agent,
            channel,
            coordinator,
            memory: SeenSlotMemory::new(&settings.memory),
            hold: None,
            epoch: HoldEpoch::ZERO,
            phase: Phase::Searching,
            conversation: None,
            transfer_attempts: 0,
            parse_reported: false,
            escalation: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Epoch of the currently active hold lifecycle.
    pub fn current_epoch(&self) -> HoldEpoch {
        self.epoch
    }

    pub fn held_slot(&self) -> Option<&Slot> {
        self.hold.as_ref().map(|h| &h.slot)
    }

    /// Whether a slot identity has already been surfaced to the operator.
    pub fn remembers(&self, key: &SlotKey) -> bool {
        self.memory.contains(key)
    }

    pub fn escalation_reason(&self) -> Option<&str> {
        self.escalation.as_deref()
    }

    /// Drive the state machine until escalation. Runs forever otherwise;
    /// cancel the future to shut down.
    pub async fn run(&mut self) -> RunEnd {
        info!(
            "monitoring '{}' on {} (interval {:?})",
            self.seeker_page.test_section.as_deref().unwrap_or("<page>"),
            self.seeker_page.url,
            self.poll_interval
        );
        loop {
            match self.phase {
                Phase::Searching => {
                    sleep(self.tick_delay()).await;
                    self.poll_once().await;
                }
                Phase::Holding => {
                    let (conversation, epoch) = match (&self.conversation, &self.hold) {
                        (Some(c), Some(h)) => (c.clone(), h.epoch),
                        _ => {
                            warn!("holding phase without conversation or hold, resuming search");
                            self.phase = Phase::Searching;
                            continue;
                        }
                    };
                    match self
                        .channel
                        .await_reply(&conversation, self.reply_timeout)
                        .await
                    {
                        Ok(text) => self.deliver_reply(epoch, &text).await,
                        Err(SeekerError::ReplyTimeout { .. }) => {
                            self.deliver_reply_timeout(epoch).await
                        }
                        Err(e) => {
                            // A broken reply channel is indistinguishable
                            // from an operator who cannot answer: free the
                            // slot rather than sit on it.
                            warn!("reply channel failed: {}", e);
                            self.deliver_reply_timeout(epoch).await;
                        }
                    }
                }
                Phase::Transferring => {
                    // deliver_reply runs transfers inline and always leaves
                    // a different phase behind.
                    warn!("unexpected transferring phase at loop head, resuming search");
                    self.phase = Phase::Searching;
                }
                Phase::Escalated => {
                    return RunEnd::Escalated {
                        reason: self.escalation.clone().unwrap_or_default(),
                    };
                }
            }
        }
    }

    /// One poll-and-maybe-reserve cycle. Suppressed while a hold is
    /// active; at most one reservation attempt per cycle.
    pub async fn poll_once(&mut self) {
        if self.hold.is_some() {
            debug!("already holding a slot, tick suppressed");
            return;
        }

        let source = self.source.clone();
        let page = self.seeker_page.clone();
        let mut policy = RetryPolicy::new(self.retry.clone());
        let snapshot = match retry_async(|| source.fetch(&page), &mut policy).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.report_poll_failure(e).await;
                return;
            }
        };
        self.parse_reported = false;

        if !snapshot.held.is_empty() {
            // A remote hold we do not know about. Reserving another slot
            // on top of it would double-hold; leave it to the operator.
            warn!("seeker page already shows a held slot, not reserving another");
            return;
        }

        let candidates = select(&snapshot.available, &self.window, &self.memory);
        let Some(slot) = candidates.into_iter().next() else {
            debug!("no new matching slots");
            return;
        };

        // Only the top-ranked candidate is acted on this tick. The rest
        // stay out of memory so later ticks can still pick them up.
        self.memory.note(slot.key());
        info!("found matching slot {}", slot);

        match self.agent.reserve(&slot).await {
            Ok(reserved) => {
                self.epoch = self.epoch.next();
                let mut held_slot = slot.clone();
                held_slot.release_token = Some(reserved.release_token.clone());
                held_slot.release_deadline = reserved.release_deadline;
                self.hold = Some(HoldRecord {
                    slot: held_slot,
                    release_token: reserved.release_token,
                    release_deadline: reserved.release_deadline,
                    epoch: self.epoch,
                });
                self.transfer_attempts = 0;
                info!("reserved seeker slot {} (epoch {})", slot, self.epoch);
                let prompt = format!(
                    "Found and reserved a seeker slot\n\n\
                     <b>Test:</b> {}\n<b>Date:</b> {}\n<b>Time:</b> {}\n\n\
                     <b>Which target should this move to?</b>\n\
                     Reply with a number, a target name, or a page URL.",
                    slot.section_id,
                    slot.date,
                    slot.time.format("%H:%M"),
                );
                self.open_conversation(prompt).await;
            }
            Err(SeekerError::Conflict) => {
                // Expected: someone else got there first. The slot is in
                // memory now, so the next tick will not hammer it again.
                info!("lost the race for {}", slot);
            }
            Err(e) => {
                warn!("reserving {} failed: {}", slot, e);
            }
        }
    }

    /// React to an operator reply observed for the hold of `epoch`.
    /// A reply tagged with an older epoch is stale and has no effect.
    pub async fn deliver_reply(&mut self, epoch: HoldEpoch, text: &str) {
        let Some(hold) = &self.hold else {
            debug!("reply with no active hold, ignoring");
            return;
        };
        if hold.epoch != epoch {
            debug!(
                "stale reply for epoch {}, current is {}",
                epoch, hold.epoch
            );
            return;
        }

        match parse_target_choice(text, &self.targets) {
            Some(target) => {
                let target = target.clone();
                info!("operator chose target '{}'", target.name);
                self.notify_operator(&format!(
                    "<b>Transfer started</b>\n\n<b>Target:</b> {}",
                    target.name
                ))
                .await;
                self.run_transfer(target).await;
            }
            None => {
                warn!("could not interpret reply '{}'", text.trim());
                self.transfer_attempts += 1;
                if self.transfer_attempts >= self.max_transfer_attempts {
                    self.release_hold_or_escalate("too many unusable replies")
                        .await;
                } else {
                    self.open_conversation(
                        "I could not match that reply to a target.\n\
                         Reply with a number, a target name, or a page URL."
                            .to_string(),
                    )
                    .await;
                }
            }
        }
    }

    /// React to the reply wait expiring for the hold of `epoch`. The
    /// operator did not answer in time; the slot should not be wasted.
    pub async fn deliver_reply_timeout(&mut self, epoch: HoldEpoch) {
        let Some(hold) = &self.hold else {
            debug!("timeout with no active hold, ignoring");
            return;
        };
        if hold.epoch != epoch {
            debug!(
                "stale timeout for epoch {}, current is {}",
                epoch, hold.epoch
            );
            return;
        }
        info!("no operator reply within bound for {}", hold.slot);
        self.release_hold_or_escalate("no reply within the configured bound")
            .await;
    }

    async fn run_transfer(&mut self, target: TargetDescriptor) {
        let Some(hold) = self.hold.clone() else {
            return;
        };
        self.phase = Phase::Transferring;

        match self.coordinator.transfer(&hold, &target).await {
            TransferOutcome::Succeeded(slot) => {
                self.memory.note(slot.key());
                self.hold = None;
                self.conversation = None;
                self.phase = Phase::Searching;
                self.notify_operator(&format!(
                    "<b>Transfer successful</b>\n\n\
                     <b>Target:</b> {}\n<b>Date:</b> {}\n<b>Time:</b> {}\n\n\
                     Seeker page has been freed for the next search.",
                    target.name,
                    slot.date,
                    slot.time.format("%H:%M"),
                ))
                .await;
            }
            TransferOutcome::TargetUnavailable => {
                self.transfer_attempts += 1;
                if self.transfer_attempts >= self.max_transfer_attempts {
                    self.release_hold_or_escalate("transfer attempts exhausted")
                        .await;
                } else {
                    self.open_conversation(format!(
                        "'{}' has no slot matching {}.\n\
                         Pick a different target.",
                        target.name, hold.slot,
                    ))
                    .await;
                }
            }
            TransferOutcome::PartiallyCompleted(stage) => {
                self.escalate(format!(
                    "transfer to '{}' partially completed: {stage}; \
                     slots may be held in both places, manual attention required",
                    target.name
                ))
                .await;
            }
            TransferOutcome::Failed {
                error,
                permanent: true,
            } => {
                self.escalate(format!(
                    "transfer to '{}' failed permanently: {error}",
                    target.name
                ))
                .await;
            }
            TransferOutcome::Failed {
                error,
                permanent: false,
            } => {
                self.transfer_attempts += 1;
                if self.transfer_attempts >= self.max_transfer_attempts {
                    self.release_hold_or_escalate("transfer attempts exhausted")
                        .await;
                } else {
                    self.open_conversation(format!(
                        "Transfer to '{}' hit a transient failure ({error}).\n\
                         Pick a target to try again.",
                        target.name,
                    ))
                    .await;
                }
            }
        }
    }

    /// Send a prompt and enter the holding phase; if the operator is
    /// unreachable the hold is freed rather than silently kept.
    async fn open_conversation(&mut self, prompt: String) {
        let choices: Vec<String> = self.targets.iter().map(|t| t.name.clone()).collect();
        let channel = self.channel.clone();
        let mut policy = RetryPolicy::new(self.retry.clone());
        match retry_async(|| channel.ask(&prompt, &choices), &mut policy).await {
            Ok(conversation) => {
                self.conversation = Some(conversation);
                self.phase = Phase::Holding;
            }
            Err(e) => {
                warn!("cannot reach operator: {}", e);
                self.release_hold_or_escalate("operator unreachable").await;
            }
        }
    }

    /// Give the current hold back, or escalate when that is impossible.
    async fn release_hold_or_escalate(&mut self, reason: &str) {
        let Some(hold) = self.hold.clone() else {
            self.phase = Phase::Searching;
            return;
        };

        if hold.deadline_passed(Utc::now()) {
            self.escalate(format!(
                "{reason}, and the release deadline for {} has passed; \
                 the hold may now be permanently stuck or auto-expired by the remote system",
                hold.slot
            ))
            .await;
            return;
        }

        let agent = self.agent.clone();
        let mut policy = RetryPolicy::new(self.retry.clone());
        match retry_async(|| agent.release(&hold.release_token), &mut policy).await {
            Ok(()) => {
                info!("released seeker slot {} ({})", hold.slot, reason);
                self.hold = None;
                self.conversation = None;
                self.phase = Phase::Searching;
                self.notify_operator(&format!(
                    "Released seeker slot {} ({reason}). Searching again.",
                    hold.slot
                ))
                .await;
            }
            Err(e) => {
                self.escalate(format!(
                    "{reason}, and releasing {} failed: {e}",
                    hold.slot
                ))
                .await;
            }
        }
    }

    /// Freeze automated action on this hold and tell the operator, once.
    async fn escalate(&mut self, reason: String) {
        error!("escalating: {}", reason);
        self.notify_operator(&format!("<b>Escalation</b>\n\n{reason}"))
            .await;
        self.escalation = Some(reason);
        self.phase = Phase::Escalated;
    }

    async fn report_poll_failure(&mut self, error: SeekerError) {
        match &error {
            SeekerError::Parse { .. } => {
                if self.parse_reported {
                    debug!("seeker page still unparseable: {}", error);
                } else {
                    error!("seeker page shape changed: {}", error);
                    self.notify_operator(&format!(
                        "<b>Seeker page could not be parsed</b>\n\n{error}\n\n\
                         Polling continues; this is reported once until it recovers."
                    ))
                    .await;
                    self.parse_reported = true;
                }
            }
            SeekerError::SessionExpired => {
                warn!("session expired during poll, will re-authenticate on the next tick");
            }
            _ => {
                warn!("seeker poll failed: {}", error);
            }
        }
    }

    /// Notification delivery with retries; failure is logged, never fatal.
    async fn notify_operator(&self, message: &str) {
        let channel = self.channel.clone();
        let mut policy = RetryPolicy::new(self.retry.clone());
        if let Err(e) = retry_async(|| channel.notify(message), &mut policy).await {
            error!("notification lost: {}", e);
        }
    }

    /// Next tick delay: configured interval with jitter, floored so the
    /// remote system's implicit rate limit is respected.
    fn tick_delay(&self) -> Duration {
        let floor_ms = POLL_INTERVAL_FLOOR_SECS as i64 * 1000;
        let base_ms = self.poll_interval.as_millis() as i64;
        let jitter_ms = self.poll_jitter.as_millis() as i64;
        let delay_ms = if jitter_ms == 0 {
            base_ms
        } else {
            use rand::Rng;
            base_ms + rand::thread_rng().gen_range(-jitter_ms..=jitter_ms)
        };
        Duration::from_millis(delay_ms.max(floor_ms) as u64)
    }
}

impl std::fmt::Debug for SeekerOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekerOrchestrator")
            .field("phase", &self.phase)
            .field("epoch", &self.epoch)
            .field("holding", &self.hold.is_some())
            .finish()
    }
}
