//! Confirmation gate: approval of mutating tool calls before they run

use parking_lot::Mutex;
use quill_wire::{ConfirmRequest, ConfirmationPrompt, Decision};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Message shown after the user declines a gated action
pub const CANCELLED_MESSAGE: &str = "Action cancelled.";

/// A tool call waiting for the user's decision
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConfirmation {
    /// Locally assigned identifier, unique within this client
    pub id: String,
    /// Identifier the server attached to the prompt, if any
    pub server_id: Option<String>,
    /// Tool the agent wants to run
    pub tool: String,
    /// Arguments the agent proposed
    pub args: Value,
    /// Question to put to the user
    pub message: String,
}

impl PendingConfirmation {
    /// Wrap a server prompt under a local identifier
    pub fn new(prompt: ConfirmationPrompt, id: String) -> Self {
        Self {
            id,
            server_id: prompt.id,
            tool: prompt.tool,
            args: prompt.args,
            message: prompt.message,
        }
    }

    /// Build the resolution request for a decision.
    ///
    /// The original arguments always travel with the request; `modified_args`
    /// is only sent when given.
    pub fn request(&self, decision: Decision, modified_args: Option<Value>) -> ConfirmRequest {
        ConfirmRequest {
            confirmation_id: self.id.clone(),
            action: decision,
            tool: self.tool.clone(),
            args: self.args.clone(),
            modified_args,
        }
    }
}

/// Issues confirmation identifiers from the arrival clock.
///
/// Identifiers are epoch milliseconds, bumped when two prompts land in the
/// same millisecond so they stay strictly increasing.
#[derive(Debug, Default)]
pub struct ConfirmationIds {
    last: i64,
}

impl ConfirmationIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for a prompt arriving now
    pub fn next(&mut self) -> String {
        self.next_at(chrono::Utc::now().timestamp_millis())
    }

    /// Identifier for a prompt arriving at `now_ms`
    pub fn next_at(&mut self, now_ms: i64) -> String {
        let id = now_ms.max(self.last + 1);
        self.last = id;
        id.to_string()
    }
}

/// Tracks which confirmations have a resolution request in flight
#[derive(Debug, Default, Clone)]
pub struct ResolutionLatch {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ResolutionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to resolve `id`.
    ///
    /// Returns `None` while another resolution for the same id is running.
    /// The claim is released when the guard drops.
    pub fn try_begin(&self, id: &str) -> Option<ResolutionGuard> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(id.to_string()) {
            return None;
        }
        Some(ResolutionGuard {
            latch: self.clone(),
            id: id.to_string(),
        })
    }

    /// Whether a resolution for `id` is running
    pub fn is_resolving(&self, id: &str) -> bool {
        self.in_flight.lock().contains(id)
    }
}

/// Releases a [`ResolutionLatch`] claim on drop
#[derive(Debug)]
pub struct ResolutionGuard {
    latch: ResolutionLatch,
    id: String,
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        self.latch.in_flight.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prompt() -> ConfirmationPrompt {
        ConfirmationPrompt {
            id: Some("srv-1".into()),
            tool: "write_file".into(),
            args: json!({"path": "a.md"}),
            message: "Apply edit?".into(),
        }
    }

    #[test]
    fn test_ids_strictly_increase_within_a_millisecond() {
        let mut ids = ConfirmationIds::new();
        assert_eq!(ids.next_at(1_000), "1000");
        assert_eq!(ids.next_at(1_000), "1001");
        assert_eq!(ids.next_at(1_000), "1002");
        assert_eq!(ids.next_at(5_000), "5000");
        // clock going backwards still yields a fresh id
        assert_eq!(ids.next_at(4_000), "5001");
    }

    #[test]
    fn test_local_id_differs_from_server_id() {
        let mut ids = ConfirmationIds::new();
        let pending = PendingConfirmation::new(prompt(), ids.next());
        assert_eq!(pending.server_id.as_deref(), Some("srv-1"));
        assert_ne!(pending.id, "srv-1");
    }

    #[test]
    fn test_request_carries_original_args() {
        let pending = PendingConfirmation::new(prompt(), "42".into());
        let request = pending.request(Decision::Modify, Some(json!({"path": "b.md"})));
        assert_eq!(request.confirmation_id, "42");
        assert_eq!(request.tool, "write_file");
        assert_eq!(request.args, json!({"path": "a.md"}));
        assert_eq!(request.modified_args, Some(json!({"path": "b.md"})));

        let request = pending.request(Decision::Reject, None);
        assert_eq!(request.action, Decision::Reject);
        assert!(request.modified_args.is_none());
    }

    #[test]
    fn test_latch_is_single_shot_until_released() {
        let latch = ResolutionLatch::new();
        let guard = latch.try_begin("1").expect("first claim");
        assert!(latch.is_resolving("1"));
        assert!(latch.try_begin("1").is_none());
        // other confirmations are independent
        assert!(latch.try_begin("2").is_some());

        drop(guard);
        assert!(!latch.is_resolving("1"));
        assert!(latch.try_begin("1").is_some());
    }
}
