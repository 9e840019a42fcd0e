//! quill-wire: wire contract for the quill documentation agent service
//!
//! This crate holds the event and request types exchanged with the service,
//! the line framing used by its streamed responses, and an HTTP client for the
//! chat stream, confirmation, live-feed and listing endpoints.

pub mod client;
pub mod error;
pub mod stream;
pub mod types;

pub use client::{ApiClient, ApiConfig};
pub use error::{Error, Result};
pub use stream::{LineDecoder, ServerEventStream, read_events};
pub use types::*;
