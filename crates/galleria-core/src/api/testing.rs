//! Scripted [`Transport`] for unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{ApiRequest, ApiResponse, Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub path: String,
    pub bearer: Option<String>,
    pub retry: bool,
}

type Handler = dyn Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, TransportError> + Send + Sync;

/// Answers every request through a closure and records what was sent.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            path: request.path.clone(),
            bearer: bearer.map(str::to_string),
            retry: request.is_retry(),
        });
        // Let concurrently started requests interleave like real I/O would.
        tokio::task::yield_now().await;
        (self.handler)(request, bearer)
    }
}

/// Never answers.
pub struct HangingTransport;

#[async_trait]
impl Transport for HangingTransport {
    async fn send(
        &self,
        _request: &ApiRequest,
        _bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        std::future::pending().await
    }
}
