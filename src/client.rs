//! Convenience client for the backend's session lifecycle and streaming
//! run endpoints. A consumer of the gateway's forwarding contract; it
//! speaks the same authentication header the gateway checks.

use std::time::Duration;

use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::stream::{delta_stream, Delta};

/// Generous timeout: covers backends that cold-start on first request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_RECURSION_LIMIT: u32 = 15;

#[derive(Debug, Deserialize)]
struct ThreadInfo {
    thread_id: Uuid,
}

/// Client for backend thread management and streaming runs.
pub struct ThreadClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ThreadClient {
    /// # Errors
    ///
    /// Returns `GatewayError::Transport` if the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: http::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .timeout(REQUEST_TIMEOUT);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    /// Create a thread for the given user, returning the existing one if
    /// it is already present.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError` on transport failure or a non-success
    /// backend status.
    pub async fn create_thread(&self, user_id: Uuid) -> Result<Uuid, GatewayError> {
        let response = self
            .request(http::Method::POST, "/threads")
            .json(&json!({
                "thread_id": Uuid::new_v4(),
                "metadata": {"user_id": user_id},
                "if_exists": "do_nothing",
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("Thread create failed: {e}")))?
            .error_for_status()
            .map_err(|e| GatewayError::Upstream(format!("Thread create rejected: {e}")))?;

        let info: ThreadInfo = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("Invalid thread response: {e}")))?;
        Ok(info.thread_id)
    }

    /// Find all threads belonging to the given user.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError` on transport failure or a non-success
    /// backend status.
    pub async fn search_threads(&self, user_id: Uuid) -> Result<Vec<Uuid>, GatewayError> {
        let response = self
            .request(http::Method::POST, "/threads/search")
            .json(&json!({
                "metadata": {"user_id": user_id},
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("Thread search failed: {e}")))?
            .error_for_status()
            .map_err(|e| GatewayError::Upstream(format!("Thread search rejected: {e}")))?;

        let threads: Vec<ThreadInfo> = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("Invalid search response: {e}")))?;
        Ok(threads.into_iter().map(|t| t.thread_id).collect())
    }

    /// Delete a thread by its id.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError` on transport failure or a non-success
    /// backend status.
    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<(), GatewayError> {
        self.request(http::Method::DELETE, &format!("/threads/{thread_id}"))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("Thread delete failed: {e}")))?
            .error_for_status()
            .map_err(|e| GatewayError::Upstream(format!("Thread delete rejected: {e}")))?;
        Ok(())
    }

    /// Start a streaming run on a thread and decode the response into
    /// application-level deltas.
    ///
    /// A fresh decode state is created for each call; decode failures are
    /// absorbed inside the stream, transport failures end it.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError` when the run cannot be started.
    pub async fn run_stream(
        &self,
        thread_id: Uuid,
        assistant_id: &str,
        message: &str,
        configurable: Value,
    ) -> Result<impl Stream<Item = Delta> + Send, GatewayError> {
        // No overall timeout here: runs legitimately stream for minutes.
        let mut builder = self.http.request(
            http::Method::POST,
            format!("{}/threads/{thread_id}/runs/stream", self.base_url),
        );
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.header("x-api-key", key);
        }
        let response = builder
            .json(&json!({
                "assistant_id": assistant_id,
                "input": {"messages": [message]},
                "config": {
                    "recursion_limit": DEFAULT_RECURSION_LIMIT,
                    "configurable": configurable,
                },
                "stream_mode": "messages-tuple",
                "stream_subgraphs": false,
            }))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("Run stream failed to start: {e}")))?
            .error_for_status()
            .map_err(|e| GatewayError::Upstream(format!("Run stream rejected: {e}")))?;

        Ok(delta_stream(response.bytes_stream()))
    }
}
