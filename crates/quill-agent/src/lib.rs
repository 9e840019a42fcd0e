//! quill-agent: Realtime agent interaction engine
//!
//! This crate turns the agent's event stream into observable session state,
//! gates mutating tool calls behind user confirmation and keeps live
//! per-resource feeds open.

pub mod confirmation;
pub mod error;
pub mod feed;
pub mod handle;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod transport;

pub use confirmation::{ConfirmationIds, PendingConfirmation, ResolutionLatch};
pub use error::{Error, Result};
pub use feed::{EventSourceFeed, FeedEvent, FeedHandle, FeedHistory, FeedTransport, LiveFeed};
pub use handle::SessionHandle;
pub use reconnect::ReconnectPolicy;
pub use session::SessionController;
pub use state::{InteractionState, reduce};
pub use transport::{ChatTransport, HttpTransport};
