//! Transport proxy: one HTTP call per request, classified
//!
//! The proxy never retries and never throws; every outcome comes back as a
//! [`TaskResult`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Result, TokenlaneError};
use crate::llm::classify::{ClassifiedError, TaskResult, classify_response};
use crate::llm::types::ChatRequest;

/// Something that can run a chat completion
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one request; resolves early with a `Network` error once `cancel` fires
    async fn send(&self, request: &ChatRequest, cancel: CancelSignal) -> TaskResult;
}

/// Cloneable, fire-once cancellation signal
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal; later calls are no-ops
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// How the endpoint expects to be authenticated
#[derive(Clone, PartialEq, Eq)]
pub enum EndpointAuth {
    /// Azure style `api-key: <key>` header
    ApiKey(String),
    /// `Authorization: Bearer <token>`
    Bearer(String),
    None,
}

impl fmt::Debug for EndpointAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey(..)"),
            Self::Bearer(_) => f.write_str("Bearer(..)"),
            Self::None => f.write_str("None"),
        }
    }
}

/// reqwest-backed transport for one chat completion endpoint
pub struct HttpProxy {
    client: Client,
    endpoint: String,
    auth: EndpointAuth,
    model: Option<String>,
}

impl HttpProxy {
    /// Create a proxy for `endpoint`
    ///
    /// No client-wide timeout is set; the worker bounds each call with its
    /// per-attempt timeout.
    pub fn new(endpoint: impl Into<String>, auth: EndpointAuth) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| TokenlaneError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            auth,
            model: None,
        })
    }

    /// Inject `model` into request bodies that do not name one
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_body(&self, request: &ChatRequest) -> std::result::Result<Value, ClassifiedError> {
        let mut body = serde_json::to_value(request).map_err(|e| ClassifiedError::Parse {
            message: format!("Failed to encode request: {}", e),
        })?;
        if let (None, Some(model)) = (&request.model, &self.model) {
            body["model"] = Value::String(model.clone());
        }
        Ok(body)
    }

    async fn post(&self, body: Value) -> TaskResult {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json");
        builder = match &self.auth {
            EndpointAuth::ApiKey(key) => builder.header("api-key", key),
            EndpointAuth::Bearer(token) => builder.bearer_auth(token),
            EndpointAuth::None => builder,
        };

        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifiedError::network(format!("Request failed: {}", e)))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ClassifiedError::network(format!("Failed to read response body: {}", e)))?;

        classify_response(status, &text)
    }
}

#[async_trait]
impl ChatTransport for HttpProxy {
    async fn send(&self, request: &ChatRequest, cancel: CancelSignal) -> TaskResult {
        if cancel.is_cancelled() {
            return Err(ClassifiedError::network("Request cancelled"));
        }
        let body = self.build_body(request)?;

        tokio::select! {
            result = self.post(body) => result,
            _ = cancel.cancelled() => {
                tracing::debug!(endpoint = %self.endpoint, "Request cancelled in flight");
                Err(ClassifiedError::network("Request cancelled"))
            }
        }
    }
}

impl fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProxy")
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth)
            .field("model", &self.model)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_signal_starts_clear() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn test_cancel_signal_shared_between_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        clone.cancel();
        assert!(signal.is_cancelled());
        clone.cancel();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_cancel() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_fired() {
        let signal = CancelSignal::new();
        signal.cancel();
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_build_body_injects_configured_model() {
        let proxy = HttpProxy::new("http://localhost/chat", EndpointAuth::None)
            .unwrap()
            .with_model("gpt-4o");
        let body = proxy.build_body(&ChatRequest::new("").with_user_message("hi")).unwrap();
        assert_eq!(body["model"], "gpt-4o");

        let mut request = ChatRequest::new("").with_user_message("hi");
        request.model = Some("gpt-4o-mini".to_string());
        let body = proxy.build_body(&request).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_build_body_without_model() {
        let proxy = HttpProxy::new("http://localhost/chat", EndpointAuth::None).unwrap();
        let body = proxy.build_body(&ChatRequest::new("").with_user_message("hi")).unwrap();
        assert!(body.get("model").is_none());
    }

    #[tokio::test]
    async fn test_send_when_already_cancelled() {
        let proxy = HttpProxy::new("http://127.0.0.1:9/chat", EndpointAuth::None).unwrap();
        let cancel = CancelSignal::new();
        cancel.cancel();

        let result = proxy.send(&ChatRequest::default(), cancel).await;
        assert_eq!(result, Err(ClassifiedError::network("Request cancelled")));
    }

    #[test]
    fn test_debug_hides_credentials() {
        let proxy = HttpProxy::new("http://localhost/chat", EndpointAuth::ApiKey("secret-key".to_string())).unwrap();
        let debug_str = format!("{:?}", proxy);
        assert!(debug_str.contains("HttpProxy"));
        assert!(debug_str.contains("localhost"));
        assert!(!debug_str.contains("secret-key"));
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpProxy>();
    }
}
