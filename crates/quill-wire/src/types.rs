//! Wire types exchanged with the quill service

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse phase of an agent interaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Thinking,
    Executing,
    Asking,
    Completed,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Thinking => "thinking",
            AgentStatus::Executing => "executing",
            AgentStatus::Asking => "asking",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
        }
    }
}

/// Progress of a single agent step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Progress of a single tool action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// A numbered unit of agent progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// 1-based index; the session reducer drops records with index 0
    pub step: u32,
    #[serde(default)]
    pub description: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
}

/// A tool invocation performed by the agent, keyed by its type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a `status` event
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusUpdate {
    pub status: AgentStatus,
    #[serde(default)]
    pub message: String,
}

/// Payload carrying only narration (`thinking`, `message`, `error`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Narration {
    #[serde(default)]
    pub message: String,
}

/// Payload of a `confirmation` event: the agent wants approval for a tool call
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfirmationPrompt {
    /// Identifier chosen by the server, if any. Not trusted to be unique.
    #[serde(default)]
    pub id: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub message: String,
}

/// Payload of a `result` event: the final snapshot of a session
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FinalResult {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
}

/// Raw `{type, data}` record as it appears after the `data: ` prefix
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// A decoded event from the chat stream
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Status(StatusUpdate),
    Thinking(Narration),
    Step(StepRecord),
    Confirmation(ConfirmationPrompt),
    Action(ActionRecord),
    Message(Narration),
    Result(FinalResult),
    Error(Narration),
    Done,
    /// An event type this client does not know about
    Unknown { kind: String },
}

impl ServerEvent {
    /// Decode a typed event from its envelope.
    ///
    /// Unknown types decode successfully as [`ServerEvent::Unknown`]; a known
    /// type whose `data` does not match its shape is an error.
    pub fn from_envelope(envelope: Envelope) -> serde_json::Result<Self> {
        let Envelope { kind, data } = envelope;
        Ok(match kind.as_str() {
            "status" => ServerEvent::Status(serde_json::from_value(data)?),
            "thinking" => ServerEvent::Thinking(serde_json::from_value(data)?),
            "step" => ServerEvent::Step(serde_json::from_value(data)?),
            "confirmation" => ServerEvent::Confirmation(serde_json::from_value(data)?),
            "action" => ServerEvent::Action(serde_json::from_value(data)?),
            "message" => ServerEvent::Message(serde_json::from_value(data)?),
            "result" => ServerEvent::Result(serde_json::from_value(data)?),
            "error" => ServerEvent::Error(serde_json::from_value(data)?),
            "done" => ServerEvent::Done,
            _ => ServerEvent::Unknown { kind },
        })
    }

    /// The wire name of this event type
    pub fn kind(&self) -> &str {
        match self {
            ServerEvent::Status(_) => "status",
            ServerEvent::Thinking(_) => "thinking",
            ServerEvent::Step(_) => "step",
            ServerEvent::Confirmation(_) => "confirmation",
            ServerEvent::Action(_) => "action",
            ServerEvent::Message(_) => "message",
            ServerEvent::Result(_) => "result",
            ServerEvent::Error(_) => "error",
            ServerEvent::Done => "done",
            ServerEvent::Unknown { kind } => kind,
        }
    }

    /// Check if this event ends the session (`done` or `error`)
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::Done | ServerEvent::Error(_))
    }
}

/// Body of the streamed chat request
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub message: String,
    pub context: Value,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, context: Option<Value>) -> Self {
        Self {
            message: message.into(),
            context: context.unwrap_or_else(|| Value::Object(Default::default())),
        }
    }
}

/// A user's answer to a confirmation prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
    Modify,
}

impl Decision {
    /// Whether the gated tool call goes ahead after this decision
    pub fn proceeds(&self) -> bool {
        !matches!(self, Decision::Reject)
    }
}

/// Body of the confirmation resolution request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub confirmation_id: String,
    pub action: Decision,
    pub tool: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_args: Option<Value>,
}

// ============================================================================
// Collaborator (request/response) types
// ============================================================================

/// A repository connected to the service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repo {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub default_branch: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub last_processed_commit: Option<String>,
    #[serde(default)]
    pub last_processed_at: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A documentation job recorded by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub repo_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
}

/// Filters for the job history listing
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub repo_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
}

impl JobQuery {
    /// Query-string pairs, omitting unset filters
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![];
        if let Some(ref repo_id) = self.repo_id {
            pairs.push(("repoId", repo_id.clone()));
        }
        if let Some(ref status) = self.status {
            pairs.push(("status", status.clone()));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        pairs
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepoList<T> {
    #[serde(default = "Vec::new")]
    pub repos: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JobList {
    #[serde(default)]
    pub jobs: Vec<Job>,
}

/// Read-only view of a live-feed payload.
///
/// Feed payloads are application-defined; these are the fields observed in
/// practice. Anything else stays in the raw JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedNotice {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl FeedNotice {
    /// One-line description: summary, else commit, else the touched files
    pub fn headline(&self) -> String {
        if let Some(summary) = self.summary.as_ref().filter(|s| !s.is_empty()) {
            return summary.clone();
        }
        if let Some(sha) = self.commit_sha.as_ref().filter(|s| !s.is_empty()) {
            return sha.clone();
        }
        self.files.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> serde_json::Result<ServerEvent> {
        ServerEvent::from_envelope(serde_json::from_value(value)?)
    }

    #[test]
    fn test_decode_step_with_total() {
        let event = decode(json!({
            "type": "step",
            "data": {"step": 2, "description": "Write docs", "status": "in_progress", "totalSteps": 4}
        }))
        .unwrap();
        assert_eq!(
            event,
            ServerEvent::Step(StepRecord {
                step: 2,
                description: "Write docs".into(),
                status: StepStatus::InProgress,
                total_steps: Some(4),
            })
        );
    }

    #[test]
    fn test_decode_action_uses_type_key() {
        let event = decode(json!({
            "type": "action",
            "data": {"type": "update_readme", "status": "executing", "description": "Updating"}
        }))
        .unwrap();
        match event {
            ServerEvent::Action(action) => {
                assert_eq!(action.kind, "update_readme");
                assert_eq!(action.status, ActionStatus::Executing);
                assert!(action.result.is_none());
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_done_without_data() {
        assert_eq!(decode(json!({"type": "done"})).unwrap(), ServerEvent::Done);
    }

    #[test]
    fn test_decode_unknown_type() {
        let event = decode(json!({"type": "heartbeat", "data": {}})).unwrap();
        assert_eq!(event.kind(), "heartbeat");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_decode_known_type_with_bad_shape_fails() {
        assert!(decode(json!({"type": "step", "data": {"description": "no index"}})).is_err());
        assert!(decode(json!({"type": "status", "data": {"status": "sleeping"}})).is_err());
    }

    #[test]
    fn test_result_defaults_to_empty_lists() {
        let event = decode(json!({"type": "result", "data": {"message": "Done"}})).unwrap();
        match event {
            ServerEvent::Result(result) => {
                assert_eq!(result.message, "Done");
                assert!(result.steps.is_empty());
                assert!(result.actions.is_empty());
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn test_confirm_request_wire_shape() {
        let request = ConfirmRequest {
            confirmation_id: "1700000000000".into(),
            action: Decision::Modify,
            tool: "write_file".into(),
            args: json!({"path": "a.md"}),
            modified_args: Some(json!({"path": "b.md"})),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "confirmationId": "1700000000000",
                "action": "modify",
                "tool": "write_file",
                "args": {"path": "a.md"},
                "modifiedArgs": {"path": "b.md"}
            })
        );

        let reject = ConfirmRequest {
            action: Decision::Reject,
            modified_args: None,
            ..request
        };
        let value = serde_json::to_value(&reject).unwrap();
        assert!(value.get("modifiedArgs").is_none());
        assert_eq!(value["action"], "reject");
    }

    #[test]
    fn test_chat_request_defaults_context_to_object() {
        let value = serde_json::to_value(ChatRequest::new("hi", None)).unwrap();
        assert_eq!(value, json!({"message": "hi", "context": {}}));
    }

    #[test]
    fn test_status_names_match_wire() {
        for status in [AgentStatus::Asking, AgentStatus::Completed, AgentStatus::Idle] {
            assert_eq!(serde_json::to_value(status).unwrap(), json!(status.as_str()));
        }
    }

    #[test]
    fn test_job_query_pairs() {
        let query = JobQuery {
            repo_id: Some("r1".into()),
            status: None,
            limit: Some(50),
        };
        assert_eq!(
            query.to_pairs(),
            vec![("repoId", "r1".to_string()), ("limit", "50".to_string())]
        );
    }

    #[test]
    fn test_feed_notice_headline_fallbacks() {
        let notice: FeedNotice =
            serde_json::from_value(json!({"type": "push", "commitSha": "abc123"})).unwrap();
        assert_eq!(notice.headline(), "abc123");

        let notice: FeedNotice =
            serde_json::from_value(json!({"type": "docs", "files": ["README.md", "CHANGELOG.md"]}))
                .unwrap();
        assert_eq!(notice.headline(), "README.md, CHANGELOG.md");

        let notice: FeedNotice = serde_json::from_value(
            json!({"summary": "Regenerated docs", "commitSha": "abc123"}),
        )
        .unwrap();
        assert_eq!(notice.headline(), "Regenerated docs");
    }
}
