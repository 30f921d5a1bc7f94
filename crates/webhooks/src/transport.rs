//! Webhook transport trait and implementations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::WebhookEventId;
use domain::WebhookEventType;
use serde::Serialize;

use crate::payload::{HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_TIMESTAMP};

/// One outbound webhook POST.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub event_id: WebhookEventId,
    pub event_type: WebhookEventType,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl DeliveryResult {
    /// Classifies an HTTP response status: 2xx succeeds, anything else fails.
    pub fn from_status(status_code: u16) -> Self {
        let success = (200..300).contains(&status_code);
        Self {
            success,
            status_code: Some(status_code),
            error: (!success).then(|| format!("HTTP {status_code}")),
        }
    }

    /// A failure that produced no HTTP response.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code: None,
            error: Some(error.into()),
        }
    }
}

/// Sends webhook requests.
///
/// Implementations never return an error: every problem is expressed as a
/// failed [`DeliveryResult`].
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, request: &WebhookRequest, timeout: Duration) -> DeliveryResult;
}

/// Transport that POSTs JSON over HTTP with `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn send(&self, request: &WebhookRequest, timeout: Duration) -> DeliveryResult {
        let response = self
            .client
            .post(&request.url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header(HEADER_EVENT_TYPE, request.event_type.as_str())
            .header(HEADER_EVENT_ID, request.event_id.to_string())
            .header(HEADER_TIMESTAMP, request.timestamp.to_rfc3339())
            .json(&request.body)
            .send()
            .await;

        match response {
            Ok(response) => DeliveryResult::from_status(response.status().as_u16()),
            Err(e) if e.is_timeout() => {
                DeliveryResult::failed(format!("timed out after {timeout:?}"))
            }
            Err(e) => DeliveryResult::failed(e.to_string()),
        }
    }
}

/// Scripted reply used by [`InMemoryWebhookTransport`].
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Status(u16),
    Error(String),
}

#[derive(Debug)]
struct InMemoryTransportState {
    script: VecDeque<ScriptedResponse>,
    default_status: u16,
    delay: Option<Duration>,
    requests: Vec<WebhookRequest>,
}

impl Default for InMemoryTransportState {
    fn default() -> Self {
        Self {
            script: VecDeque::new(),
            default_status: 200,
            delay: None,
            requests: Vec::new(),
        }
    }
}

/// In-memory transport for testing.
///
/// Replies with scripted responses in order, then with the default status.
/// Every request is recorded.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWebhookTransport {
    state: Arc<Mutex<InMemoryTransportState>>,
}

impl InMemoryWebhookTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, InMemoryTransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the status returned once the script is exhausted.
    pub fn set_default_status(&self, status: u16) {
        self.state().default_status = status;
    }

    /// Queues a status for the next unscripted request.
    pub fn push_status(&self, status: u16) {
        self.state().script.push_back(ScriptedResponse::Status(status));
    }

    /// Queues a connection-level failure.
    pub fn push_error(&self, error: impl Into<String>) {
        self.state()
            .script
            .push_back(ScriptedResponse::Error(error.into()));
    }

    /// Makes every request take `delay` before replying.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.state().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state().requests.len()
    }
}

#[async_trait]
impl WebhookTransport for InMemoryWebhookTransport {
    async fn send(&self, request: &WebhookRequest, _timeout: Duration) -> DeliveryResult {
        let (reply, delay) = {
            let mut state = self.state();
            state.requests.push(request.clone());
            let reply = state
                .script
                .pop_front()
                .unwrap_or(ScriptedResponse::Status(state.default_status));
            (reply, state.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match reply {
            ScriptedResponse::Status(status) => DeliveryResult::from_status(status),
            ScriptedResponse::Error(error) => DeliveryResult::failed(error),
        }
    }
}
