//! ResponseChannel trait: talking to the human operator.
//!
//! Outbound messages are fire-and-forget notifications; a prompt opens a
//! conversation whose replies are correlated by an explicit handle, so a
//! late reply to an abandoned prompt can be told apart from the reply the
//! orchestrator is actually waiting for.

use async_trait::async_trait;
use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::Result;
use crate::slot::TargetDescriptor;

/// Handle correlating a prompt with the replies it provokes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asynchronous messaging channel to the operator.
///
/// `await_reply` is single-consumer: one outstanding wait per channel.
#[async_trait]
pub trait ResponseChannel: Send + Sync + Debug {
    /// Deliver a one-way notification.
    async fn notify(&self, message: &str) -> Result<()>;

    /// Ask a question with enumerated choices; returns the conversation
    /// handle replies will be correlated against.
    async fn ask(&self, prompt: &str, choices: &[String]) -> Result<ConversationId>;

    /// Wait for the next reply belonging to `conversation`. Replies from
    /// earlier conversations are discarded. `SeekerError::ReplyTimeout`
    /// when the bound expires.
    async fn await_reply(
        &self,
        conversation: &ConversationId,
        timeout: Duration,
    ) -> Result<String>;
}

/// Interpret an operator reply as a choice of transfer target.
///
/// Accepted forms, in order: a 1-based index into the configured list, a
/// page URL of a configured target, or a case-insensitive (partial) name
/// match in either direction.
pub fn parse_target_choice<'a>(
    reply: &str,
    targets: &'a [TargetDescriptor],
) -> Option<&'a TargetDescriptor> {
    let reply = reply.trim();
    if reply.is_empty() {
        return None;
    }

    if let Ok(index) = reply.parse::<usize>() {
        if index >= 1 && index <= targets.len() {
            return Some(&targets[index - 1]);
        }
        return None;
    }

    if reply.starts_with("http") {
        return targets.iter().find(|t| t.page.url == reply);
    }

    let lowered = reply.to_lowercase();
    targets.iter().find(|t| {
        let name = t.name.to_lowercase();
        name.contains(&lowered) || lowered.contains(&name)
    })
}
