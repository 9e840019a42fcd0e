//! HTTP client for the quill service

use crate::{
    error::{Error, Result},
    stream::{ServerEventStream, read_events},
    types::{ChatRequest, ConfirmRequest, Job, JobList, JobQuery, Repo, RepoList},
};
use reqwest_eventsource::EventSource;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Default service origin
pub const DEFAULT_API_URL: &str = "http://localhost:9000";
/// Default API version segment
pub const DEFAULT_API_VERSION: &str = "v1";

/// Where the service lives and how to authenticate against it
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Service origin, e.g. `https://api.example.com`
    pub api_url: String,
    /// Version segment inserted after `/api/`
    pub api_version: String,
    /// Bearer token attached to every request
    pub access_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            access_token: None,
        }
    }
}

impl ApiConfig {
    /// Root every endpoint path is appended to
    pub fn base_url(&self) -> String {
        format!(
            "{}/api/{}",
            self.api_url.trim_end_matches('/'),
            self.api_version.trim_matches('/')
        )
    }

    /// Absolute URL for an endpoint path
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }
}

/// Client for the streamed chat, confirmation, live-feed and listing endpoints
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    config: ApiConfig,
}

impl ApiClient {
    /// Create a client for the given configuration
    pub fn new(config: ApiConfig) -> Result<Self> {
        if !config.api_url.starts_with("http://") && !config.api_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "api_url must be an http(s) URL, got '{}'",
                config.api_url
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            config,
        })
    }

    /// The configuration this client was built with
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.access_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Issue the chat request and return its decoded event sequence.
    ///
    /// Fails before yielding anything if the connection cannot be made or the
    /// server answers with a non-success status.
    pub async fn chat_stream(&self, request: &ChatRequest) -> Result<ServerEventStream> {
        let url = self.config.endpoint("ai/chat/stream");
        tracing::debug!("Opening chat stream: {}", url);

        let response = self
            .authorize(self.client.post(&url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(read_events(response.bytes_stream()))
    }

    /// Submit a decision for a pending confirmation
    pub async fn confirm(&self, request: &ConfirmRequest) -> Result<Value> {
        let url = self.config.endpoint("ai/confirm");
        tracing::debug!(
            "Resolving confirmation {} ({:?})",
            request.confirmation_id,
            request.action
        );

        let response = self
            .authorize(self.client.post(&url))
            .json(request)
            .send()
            .await?;

        let response = check_status(response).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// URL of the live event channel for a resource
    pub fn feed_url(&self, resource_id: &str) -> String {
        self.config.endpoint(&format!("events/{}", resource_id))
    }

    /// Build (but do not yet connect) the live event channel for a resource.
    ///
    /// The channel's own retry behaviour is disabled: a transport error ends
    /// it, and reconnection is left to the caller.
    pub fn open_feed(&self, resource_id: &str) -> Result<EventSource> {
        let request = self.authorize(self.client.get(self.feed_url(resource_id)));
        let mut event_source = EventSource::new(request)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
        event_source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));
        Ok(event_source)
    }

    /// Repositories connected to the service
    pub async fn connected_repos(&self) -> Result<Vec<Repo>> {
        let list: RepoList<Repo> = self.get_json("repos", &[]).await?;
        Ok(list.repos)
    }

    /// Repositories the user could connect
    pub async fn available_repos(&self) -> Result<Vec<Value>> {
        let list: RepoList<Value> = self.get_json("repos/list", &[]).await?;
        Ok(list.repos)
    }

    /// Job history, optionally filtered
    pub async fn jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let list: JobList = self.get_json("jobs", &query.to_pairs()).await?;
        Ok(list.jobs)
    }

    /// What the agent can do, as reported by the service
    pub async fn capabilities(&self) -> Result<Value> {
        self.get_json("ai/capabilities", &[]).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&'static str, String)],
    ) -> Result<T> {
        let url = self.config.endpoint(path);
        tracing::debug!("GET {}", url);

        let response = self
            .authorize(self.client.get(&url))
            .query(query)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

/// Turn a non-success response into `Error::Status`
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::status(status.as_u16(), error_message(status, &body)))
}

/// Pull a human-readable message out of an error body
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error"] {
            if let Some(text) = value.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }
    let body = body.trim();
    if body.is_empty() || body.len() > 200 {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_defaults() {
        let config = ApiConfig::default();
        assert_eq!(config.base_url(), "http://localhost:9000/api/v1");
        assert_eq!(
            config.endpoint("/ai/chat/stream"),
            "http://localhost:9000/api/v1/ai/chat/stream"
        );
    }

    #[test]
    fn test_base_url_trims_slashes() {
        let config = ApiConfig {
            api_url: "https://docs.example.com/".into(),
            api_version: "/v2/".into(),
            access_token: None,
        };
        assert_eq!(config.endpoint("jobs"), "https://docs.example.com/api/v2/jobs");
    }

    #[test]
    fn test_feed_url() {
        let client = ApiClient::new(ApiConfig::default()).unwrap();
        assert_eq!(
            client.feed_url("65a1f0"),
            "http://localhost:9000/api/v1/events/65a1f0"
        );
    }

    #[test]
    fn test_rejects_non_http_url() {
        let config = ApiConfig {
            api_url: "localhost:9000".into(),
            ..Default::default()
        };
        assert!(matches!(ApiClient::new(config), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_error_message_prefers_json_fields() {
        let status = reqwest::StatusCode::BAD_REQUEST;
        assert_eq!(error_message(status, r#"{"message":"Insufficient credits"}"#), "Insufficient credits");
        assert_eq!(error_message(status, r#"{"error":"Invalid repo"}"#), "Invalid repo");
        assert_eq!(error_message(status, "plain failure"), "plain failure");
        assert_eq!(error_message(status, ""), "Bad Request");
    }
}
