//! Interaction state and the event reducer that folds a chat stream into it.

use quill_wire::{ActionRecord, AgentStatus, ServerEvent, StepRecord};

use crate::confirmation::{ConfirmationIds, PendingConfirmation};

/// Everything a consumer needs to render one request/response cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InteractionState {
    /// Current phase
    pub status: AgentStatus,
    /// Latest narration, last write wins
    pub message: String,
    /// Steps ordered by index, one record per index
    pub steps: Vec<StepRecord>,
    /// Actions in first-seen order, one record per type
    pub actions: Vec<ActionRecord>,
    /// Tool call awaiting the user's decision
    pub confirmation: Option<PendingConfirmation>,
    /// Whether the chat stream is still being read
    pub is_streaming: bool,
}

impl InteractionState {
    /// Idle, empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// State at the moment a request is issued
    pub fn started() -> Self {
        Self {
            status: AgentStatus::Thinking,
            is_streaming: true,
            ..Self::default()
        }
    }

    /// Whether the confirmation gate is closed
    pub fn is_gated(&self) -> bool {
        self.confirmation.is_some()
    }

    /// Look up a step by index
    pub fn step(&self, index: u32) -> Option<&StepRecord> {
        self.steps
            .binary_search_by_key(&index, |s| s.step)
            .ok()
            .map(|i| &self.steps[i])
    }

    /// Look up an action by type
    pub fn action(&self, kind: &str) -> Option<&ActionRecord> {
        self.actions.iter().find(|a| a.kind == kind)
    }

    /// Apply one decoded event.
    ///
    /// While a confirmation is pending the status stays `asking`: only a new
    /// prompt, an `error` event, a resolution or a reset moves it.
    pub fn apply(&mut self, event: ServerEvent, ids: &mut ConfirmationIds) {
        match event {
            ServerEvent::Status(update) => {
                self.message = update.message;
                if self.is_gated() {
                    tracing::debug!("Holding 'asking' over status {:?}", update.status);
                } else if update.status == AgentStatus::Asking {
                    tracing::debug!("Ignoring 'asking' status without a pending confirmation");
                } else {
                    self.status = update.status;
                }
            }
            ServerEvent::Thinking(narration) => {
                self.message = narration.message;
                self.set_status(AgentStatus::Thinking);
            }
            ServerEvent::Step(step) if step.step == 0 => {
                tracing::warn!("Dropping step with index 0: {}", step.description);
            }
            ServerEvent::Step(step) => {
                self.upsert_step(step);
                self.set_status(AgentStatus::Executing);
            }
            ServerEvent::Confirmation(prompt) => {
                if let Some(ref previous) = self.confirmation {
                    tracing::warn!(
                        "Confirmation {} for '{}' superseded before it was resolved",
                        previous.id,
                        previous.tool
                    );
                }
                self.confirmation = Some(PendingConfirmation::new(prompt, ids.next()));
                self.status = AgentStatus::Asking;
            }
            ServerEvent::Action(action) => {
                self.upsert_action(action);
            }
            ServerEvent::Message(narration) => {
                self.message = narration.message;
            }
            ServerEvent::Result(result) => {
                self.message = result.message;
                self.steps = result.steps;
                let before = self.steps.len();
                self.steps.retain(|s| s.step >= 1);
                if self.steps.len() != before {
                    tracing::warn!("Dropped result steps with index 0");
                }
                self.actions = result.actions;
                self.set_status(AgentStatus::Completed);
            }
            ServerEvent::Error(narration) => {
                self.status = AgentStatus::Error;
                self.message = narration.message;
                self.confirmation = None;
                self.is_streaming = false;
            }
            ServerEvent::Done => {
                self.finish_stream();
            }
            ServerEvent::Unknown { kind } => {
                tracing::debug!("Ignoring unknown event type '{}'", kind);
            }
        }
    }

    /// Mark the stream as over without an error.
    ///
    /// A pending confirmation survives so the user can still decide.
    pub fn finish_stream(&mut self) {
        self.is_streaming = false;
        if self.status != AgentStatus::Error {
            self.set_status(AgentStatus::Completed);
        }
    }

    /// Record a transport-level failure
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = AgentStatus::Error;
        self.message = message.into();
        self.confirmation = None;
        self.is_streaming = false;
    }

    fn set_status(&mut self, status: AgentStatus) {
        if !self.is_gated() {
            self.status = status;
        }
    }

    fn upsert_step(&mut self, step: StepRecord) {
        match self.steps.binary_search_by_key(&step.step, |s| s.step) {
            Ok(i) => self.steps[i] = step,
            Err(i) => self.steps.insert(i, step),
        }
    }

    fn upsert_action(&mut self, action: ActionRecord) {
        match self.actions.iter_mut().find(|a| a.kind == action.kind) {
            Some(existing) => *existing = action,
            None => self.actions.push(action),
        }
    }
}

/// Fold a whole event sequence into a fresh session state
pub fn reduce(
    events: impl IntoIterator<Item = ServerEvent>,
    ids: &mut ConfirmationIds,
) -> InteractionState {
    let mut state = InteractionState::started();
    for event in events {
        state.apply(event, ids);
    }
    state
}
