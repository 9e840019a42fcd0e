//! Session controller: drives one request/response cycle at a time
//!
//! The controller owns the [`InteractionState`] of the active session. Every
//! mutation goes through a single `watch` channel so updates are serialized
//! and consumers only ever see whole snapshots. A generation counter, bumped
//! under the same lock on every send and reset, keeps events of an abandoned
//! session from touching the state of the next one.

use futures::StreamExt;
use parking_lot::Mutex;
use quill_wire::{AgentStatus, ChatRequest, Decision, ServerEvent, ServerEventStream};
use serde_json::Value;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    confirmation::{CANCELLED_MESSAGE, ConfirmationIds, ResolutionLatch},
    error::{Error, Result},
    handle::SessionHandle,
    state::InteractionState,
    transport::ChatTransport,
};

/// Owner of the interaction state for one user-facing conversation surface.
///
/// Cloning is cheap and every clone drives the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn ChatTransport>,
    state: watch::Sender<InteractionState>,
    /// Only modified inside `state` write closures
    generation: AtomicU64,
    ids: Mutex<ConfirmationIds>,
    latch: ResolutionLatch,
    handle: SessionHandle,
}

/// Message recorded when a session stops before its stream settled it
pub const CANCELLED_REQUEST_MESSAGE: &str = "Request cancelled.";

/// Ends the session as cancelled if `run` stops without settling it, either
/// through [`SessionHandle::abort`] or because its future was dropped.
struct SettleGuard<'a> {
    controller: &'a SessionController,
    generation: u64,
    armed: bool,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let generation = self.generation;
        self.controller.mutate(generation, |state| {
            if !state.is_streaming {
                return false;
            }
            tracing::debug!("Session {} cancelled", generation);
            state.fail(CANCELLED_REQUEST_MESSAGE);
            true
        });
    }
}

/// How a read loop ended
enum LoopExit {
    Terminal,
    Ended,
    Failed(String),
    Cancelled,
    Stale,
}

impl SessionController {
    /// Create an idle controller on top of a transport
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        let (state, _) = watch::channel(InteractionState::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                state,
                generation: AtomicU64::new(0),
                ids: Mutex::new(ConfirmationIds::new()),
                latch: ResolutionLatch::new(),
                handle: SessionHandle::new(),
            }),
        }
    }

    /// Receive a snapshot every time the state changes
    pub fn subscribe(&self) -> watch::Receiver<InteractionState> {
        self.inner.state.subscribe()
    }

    /// Current state
    pub fn snapshot(&self) -> InteractionState {
        self.inner.state.borrow().clone()
    }

    /// Handle for aborting or awaiting the read loop
    pub fn handle(&self) -> SessionHandle {
        self.inner.handle.clone()
    }

    /// Whether a stream is being read
    pub fn is_streaming(&self) -> bool {
        self.inner.state.borrow().is_streaming
    }

    /// Send a message and reduce the agent's response until the stream ends.
    ///
    /// Rejected with [`Error::Busy`], without touching the state, while a
    /// session is streaming. Transport failures are not returned: they are
    /// recorded in the state, which is returned once the session stops.
    pub async fn send(
        &self,
        text: impl Into<String>,
        context: Option<Value>,
    ) -> Result<InteractionState> {
        let (generation, cancel) = self.begin()?;
        let request = ChatRequest::new(text, context);
        Ok(self.run(generation, cancel, request).await)
    }

    /// Like [`send`](Self::send), but drives the session on a spawned task.
    ///
    /// The busy check happens before this returns.
    pub fn spawn_send(
        &self,
        text: impl Into<String>,
        context: Option<Value>,
    ) -> Result<JoinHandle<InteractionState>> {
        let (generation, cancel) = self.begin()?;
        let request = ChatRequest::new(text, context);
        let this = self.clone();
        Ok(tokio::spawn(async move {
            this.run(generation, cancel, request).await
        }))
    }

    /// Answer the pending confirmation.
    ///
    /// No-op when nothing is pending. On success the gate opens: `accept` and
    /// `modify` continue execution, `reject` returns to idle. On failure the
    /// confirmation stays pending so the decision can be retried.
    pub async fn resolve(&self, decision: Decision, modified_args: Option<Value>) -> Result<()> {
        let (generation, pending) = {
            let state = self.inner.state.borrow();
            match state.confirmation {
                Some(ref pending) => (
                    self.inner.generation.load(Ordering::Acquire),
                    pending.clone(),
                ),
                None => return Ok(()),
            }
        };

        let _claim = self
            .inner
            .latch
            .try_begin(&pending.id)
            .ok_or_else(|| Error::ResolutionInFlight(pending.id.clone()))?;

        let request = pending.request(decision, modified_args);
        tracing::debug!(
            "Resolving confirmation {} for '{}': {:?}",
            pending.id,
            pending.tool,
            decision
        );

        match self.inner.transport.confirm(request).await {
            Ok(()) => {
                self.mutate(generation, |state| {
                    let still_pending = state
                        .confirmation
                        .as_ref()
                        .is_some_and(|c| c.id == pending.id);
                    if !still_pending {
                        tracing::debug!("Confirmation {} superseded while resolving", pending.id);
                        return false;
                    }
                    state.confirmation = None;
                    if decision.proceeds() {
                        state.status = AgentStatus::Executing;
                    } else {
                        state.status = AgentStatus::Idle;
                        state.message = CANCELLED_MESSAGE.to_string();
                    }
                    true
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to resolve confirmation {}: {}", pending.id, e);
                let message = e.to_string();
                self.mutate(generation, |state| {
                    state.status = AgentStatus::Error;
                    state.message = message;
                    true
                });
                Err(e.into())
            }
        }
    }

    /// Drop the current session and return to the idle state.
    ///
    /// Stops the read loop and releases its connection; anything the old
    /// stream still delivers is ignored.
    pub fn reset(&self) {
        self.inner.state.send_modify(|state| {
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            self.inner.handle.abort();
            *state = InteractionState::default();
        });
        tracing::debug!("Session reset");
    }

    /// Start a new session, or refuse if one is streaming
    fn begin(&self) -> Result<(u64, CancellationToken)> {
        let mut started = None;
        self.inner.state.send_if_modified(|state| {
            if state.is_streaming {
                return false;
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let cancel = self.inner.handle.renew();
            *state = InteractionState::started();
            started = Some((generation, cancel));
            true
        });
        started.ok_or_else(|| {
            tracing::debug!("Rejected send while streaming");
            Error::Busy
        })
    }

    async fn run(
        &self,
        generation: u64,
        cancel: CancellationToken,
        request: ChatRequest,
    ) -> InteractionState {
        let _running = self.inner.handle.enter();
        let mut settle = SettleGuard {
            controller: self,
            generation,
            armed: true,
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Session {} cancelled before the stream opened", generation);
                drop(settle);
                return self.snapshot();
            }
            opened = self.inner.transport.open_chat(request) => opened,
        };

        let exit = match opened {
            Ok(events) => self.read_loop(generation, &cancel, events).await,
            Err(e) => LoopExit::Failed(e.to_string()),
        };

        settle.armed = matches!(exit, LoopExit::Cancelled);
        match exit {
            LoopExit::Ended => {
                tracing::debug!("Session {} stream ended without 'done'", generation);
                self.mutate(generation, |state| {
                    state.finish_stream();
                    true
                });
            }
            LoopExit::Failed(message) => {
                tracing::warn!("Session {} failed: {}", generation, message);
                self.mutate(generation, |state| {
                    state.fail(message);
                    true
                });
            }
            LoopExit::Terminal | LoopExit::Cancelled | LoopExit::Stale => {}
        }

        drop(settle);
        self.snapshot()
    }

    /// Apply events in arrival order until the session is over.
    ///
    /// The stream is dropped, closing its connection, when this returns.
    async fn read_loop(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        mut events: ServerEventStream,
    ) -> LoopExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let terminal = event.is_terminal();
                    if !self.apply(generation, event) {
                        return LoopExit::Stale;
                    }
                    if terminal {
                        return LoopExit::Terminal;
                    }
                }
                Some(Err(e)) => return LoopExit::Failed(e.to_string()),
                None => return LoopExit::Ended,
            }
        }
    }

    /// Reduce one event into the state; `false` if the session is no longer current
    fn apply(&self, generation: u64, event: ServerEvent) -> bool {
        let mut current = false;
        self.inner.state.send_if_modified(|state| {
            if self.inner.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            current = true;
            let before = state.clone();
            state.apply(event, &mut self.inner.ids.lock());
            *state != before
        });
        current
    }

    /// Run `f` against the state if `generation` is still the active session
    fn mutate(&self, generation: u64, f: impl FnOnce(&mut InteractionState) -> bool) {
        self.inner.state.send_if_modified(|state| {
            if self.inner.generation.load(Ordering::Acquire) != generation {
                return false;
            }
            f(state)
        });
    }
}
