//! Transport abstraction for running agent sessions

use async_trait::async_trait;
use quill_wire::{ApiClient, ChatRequest, ConfirmRequest, Result, ServerEventStream};

/// How a session reaches the agent service
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issue one chat request and return its event sequence.
    ///
    /// Errors here mean no event was received at all.
    async fn open_chat(&self, request: ChatRequest) -> Result<ServerEventStream>;

    /// Submit a confirmation decision; resolves once the server accepted it
    async fn confirm(&self, request: ConfirmRequest) -> Result<()>;
}

/// Direct HTTP transport - talks to the service through [`ApiClient`]
pub struct HttpTransport {
    client: ApiClient,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_chat(&self, request: ChatRequest) -> Result<ServerEventStream> {
        self.client.chat_stream(&request).await
    }

    async fn confirm(&self, request: ConfirmRequest) -> Result<()> {
        let response = self.client.confirm(&request).await?;
        tracing::debug!("Confirmation {} accepted: {}", request.confirmation_id, response);
        Ok(())
    }
}
