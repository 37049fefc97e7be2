//! Scripted fakes for the orchestration seams.
//!
//! Each fake pops pre-loaded responses off a queue and records every call
//! into a shared log, so tests can assert cross-fake ordering (e.g. that
//! a target reserve happens before the seeker release).

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};

use tc_seeker::{
    ConversationId, PageRef, ReservationAgent, ReservedHold, ResponseChannel, Result, SeekerError,
    Settings, SettingsBuilder, Slot, SlotSnapshot, SlotSource,
};

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub const SEEKER_URL: &str = "https://moodle.example/mod/tcb/view.php?id=1";
pub const TARGET_A_URL: &str = "https://moodle.example/mod/tcb/view.php?id=2";
pub const TARGET_B_URL: &str = "https://moodle.example/mod/tcb/view.php?id=3";

/// Settings with two targets, a wide preference window, and retries that
/// fail fast so scripted errors surface without real backoff sleeps.
pub fn test_settings() -> Settings {
    let mut settings = SettingsBuilder::new()
        .credentials("user", "pass")
        .telegram("token", "chat")
        .seeker(SEEKER_URL, "UNIX exam")
        .date_range(
            NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        )
        .time_range(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        )
        .target("Centre A", TARGET_A_URL)
        .target("Centre B", TARGET_B_URL)
        .build();
    settings.retry.max_retries = 0;
    settings.retry.initial_delay_ms = 1;
    settings.retry.max_delay_ms = 1;
    settings.retry.jitter = false;
    settings
}

/// A slot in January 2026 inside the test window.
pub fn slot(day: u32, hour: u32, minute: u32) -> Slot {
    Slot::new(
        "UNIX exam",
        NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap(),
        format!("reserve-{day}-{hour}{minute:02}"),
    )
}

pub fn snapshot(available: Vec<Slot>) -> SlotSnapshot {
    SlotSnapshot {
        held: Vec::new(),
        available,
    }
}

#[derive(Debug)]
pub struct ScriptedSource {
    log: CallLog,
    script: Mutex<VecDeque<Result<SlotSnapshot>>>,
}

impl ScriptedSource {
    pub fn new(log: CallLog, script: Vec<Result<SlotSnapshot>>) -> Self {
        Self {
            log,
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl SlotSource for ScriptedSource {
    async fn fetch(&self, page: &PageRef) -> Result<SlotSnapshot> {
        self.log.lock().unwrap().push(format!("fetch {}", page.url));
        match self.script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(SlotSnapshot::default()),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedAgent {
    log: CallLog,
    reserve_script: Mutex<VecDeque<Result<ReservedHold>>>,
    release_script: Mutex<VecDeque<Result<()>>>,
    token_counter: AtomicU64,
}

impl ScriptedAgent {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn script_reserve(&self, response: Result<ReservedHold>) {
        self.reserve_script.lock().unwrap().push_back(response);
    }

    pub fn script_release(&self, response: Result<()>) {
        self.release_script.lock().unwrap().push_back(response);
    }

    pub fn hold(token: &str) -> ReservedHold {
        ReservedHold {
            release_token: token.to_string(),
            release_deadline: None,
        }
    }
}

#[async_trait]
impl ReservationAgent for ScriptedAgent {
    async fn reserve(&self, slot: &Slot) -> Result<ReservedHold> {
        self.log
            .lock()
            .unwrap()
            .push(format!("reserve {}", slot.reserve_token));
        match self.reserve_script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => {
                let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
                Ok(Self::hold(&format!("release-{n}")))
            }
        }
    }

    async fn release(&self, release_token: &str) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("release {release_token}"));
        match self.release_script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedChannel {
    log: CallLog,
    pub notifications: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<String>>,
    ask_script: Mutex<VecDeque<Result<ConversationId>>>,
    reply_script: Mutex<VecDeque<Result<String>>>,
    conversation_counter: AtomicU64,
}

impl ScriptedChannel {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn script_ask(&self, response: Result<ConversationId>) {
        self.ask_script.lock().unwrap().push_back(response);
    }

    pub fn script_reply(&self, response: Result<String>) {
        self.reply_script.lock().unwrap().push_back(response);
    }

    pub fn notifications_containing(&self, needle: &str) -> usize {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.contains(needle))
            .count()
    }
}

#[async_trait]
impl ResponseChannel for ScriptedChannel {
    async fn notify(&self, message: &str) -> Result<()> {
        self.log.lock().unwrap().push("notify".to_string());
        self.notifications.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn ask(&self, prompt: &str, _choices: &[String]) -> Result<ConversationId> {
        self.log.lock().unwrap().push("ask".to_string());
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.ask_script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => {
                let n = self.conversation_counter.fetch_add(1, Ordering::SeqCst);
                Ok(ConversationId(n.to_string()))
            }
        }
    }

    async fn await_reply(
        &self,
        _conversation: &ConversationId,
        timeout: Duration,
    ) -> Result<String> {
        match self.reply_script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Err(SeekerError::ReplyTimeout {
                waited_secs: timeout.as_secs(),
            }),
        }
    }
}

/// Index of the first log entry starting with `prefix`, if any.
pub fn log_position(log: &CallLog, prefix: &str) -> Option<usize> {
    log.lock()
        .unwrap()
        .iter()
        .position(|entry| entry.starts_with(prefix))
}

pub fn log_count(log: &CallLog, prefix: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.starts_with(prefix))
        .count()
}
