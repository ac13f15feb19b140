//! `HttpInvoker` — the production [`ActionInvoker`] over HTTP(S).
//!
//! Wire contract with an action provider rooted at `action_url`:
//! - `POST {action_url}/run` with `{"request_id", "body", "manage_by"?}`
//!   starts an instance and returns `{"action_id", "status", ...}`.
//! - `GET  {action_url}/{action_id}/status` returns `{"status", "result"?}`.
//! - `DELETE {action_url}/{action_id}` releases a terminal instance.
//!
//! The `request_id` is the idempotency key: a retried `run` carries the same
//! id, and providers are expected to return the original instance.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{ActionHandle, ActionInvoker, ActionRequest, ActionStatus, InvokerError};

/// Configuration for the HTTP invoker.
#[derive(Debug, Clone)]
pub struct HttpInvokerConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Bearer token attached to every request, if any.
    pub bearer_token: Option<String>,
}

impl Default for HttpInvokerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            bearer_token: None,
        }
    }
}

/// Invoker that talks to real action providers with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpInvoker {
    client: Client,
    config: HttpInvokerConfig,
}

/// Body of `POST {action_url}/run`.
#[derive(Debug, Serialize)]
struct RunRequestBody<'a> {
    request_id: Uuid,
    body: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_as: Option<&'a str>,
}

/// The part of the provider's run response the invoker needs.
#[derive(Debug, Deserialize)]
struct RunResponseBody {
    action_id: String,
}

impl HttpInvoker {
    pub fn new(config: HttpInvokerConfig) -> Result<Self, InvokerError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InvokerError::Transport {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { client, config })
    }

    /// Invoker with default configuration and an optional bearer token.
    pub fn with_token(bearer_token: Option<String>) -> Result<Self, InvokerError> {
        Self::new(HttpInvokerConfig {
            bearer_token,
            ..HttpInvokerConfig::default()
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Turn a non-success response into a `Protocol` error carrying the
    /// provider's body verbatim.
    async fn check(url: &str, response: Response) -> Result<Response, InvokerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(InvokerError::Protocol {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    fn transport(url: &str, err: reqwest::Error) -> InvokerError {
        InvokerError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl ActionInvoker for HttpInvoker {
    #[instrument(skip(self, request), fields(action_url = %request.action_url, request_id = %request.request_id))]
    async fn run(&self, request: ActionRequest) -> Result<ActionHandle, InvokerError> {
        let url = format!("{}/run", request.action_url);
        let body = RunRequestBody {
            request_id: request.request_id,
            body: &request.body,
            run_as: request.run_as.as_deref(),
        };

        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport(&url, e))?;
        let response = Self::check(&url, response).await?;

        let run_response: RunResponseBody = response
            .json()
            .await
            .map_err(|e| Self::transport(&url, e))?;

        debug!(action_id = %run_response.action_id, "action started");

        Ok(ActionHandle {
            action_url: request.action_url,
            action_id: run_response.action_id,
        })
    }

    async fn status(&self, handle: &ActionHandle) -> Result<ActionStatus, InvokerError> {
        let url = format!("{}/{}/status", handle.action_url, handle.action_id);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| Self::transport(&url, e))?;
        let response = Self::check(&url, response).await?;

        response.json().await.map_err(|e| Self::transport(&url, e))
    }

    async fn release(&self, handle: &ActionHandle) -> Result<(), InvokerError> {
        let url = format!("{}/{}", handle.action_url, handle.action_id);

        let response = self
            .authorize(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| Self::transport(&url, e))?;
        Self::check(&url, response).await?;

        Ok(())
    }
}
