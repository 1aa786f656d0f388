//! Scripted transport for unit tests: records every request and answers
//! through a closure.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;

use super::{ApiRequest, ApiResponse, Transport, TransportError};

type Handler = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync>;

pub(crate) struct ScriptedTransport {
    handler: Handler,
    calls: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn calls_to(&self, target: &str) -> usize {
        self.calls.lock().iter().filter(|r| r.target == target).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.calls.lock().push(request.clone());
        // Suspend like real I/O so concurrent callers interleave
        tokio::task::yield_now().await;
        (self.handler)(request)
    }
}

pub(crate) fn respond(status: u16, body: &str) -> Result<ApiResponse, TransportError> {
    let status = StatusCode::from_u16(status).expect("valid status code");
    Ok(ApiResponse::new(status, body))
}
