//! Error types for quill-agent

use thiserror::Error;

/// Result type alias using quill-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a session or a live feed
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire/transport layer
    #[error(transparent)]
    Wire(#[from] quill_wire::Error),

    /// A session is already streaming; the new request was not issued
    #[error("A request is already in progress")]
    Busy,

    /// A decision for this confirmation is already being submitted
    #[error("Confirmation {0} is already being resolved")]
    ResolutionInFlight(String),
}
