//! Scripted endpoint for deterministic tests and replays.
//!
//! Responses come from a queue, or from a responder closure that sees each
//! request. Every request is recorded so tests can inspect exactly what the
//! loop sent.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use super::endpoint::{ModelEndpoint, ModelFuture, ModelRequest, ModelResponse};
use crate::error::ModelError;

type Responder = Box<dyn Fn(&ModelRequest, usize) -> Result<ModelResponse, ModelError> + Send + Sync>;

/// A [`ModelEndpoint`] that replays scripted responses.
///
/// # Example
///
/// ```
/// use tether_rs::api::{ModelResponse, ScriptedEndpoint};
///
/// let endpoint = ScriptedEndpoint::new()
///     .then(ModelResponse::text("first"))
///     .then(ModelResponse::text("second"));
/// assert_eq!(endpoint.remaining(), 2);
/// ```
pub struct ScriptedEndpoint {
    queue: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ModelRequest>>,
    delay: Option<Duration>,
}

impl fmt::Debug for ScriptedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedEndpoint")
            .field("remaining", &self.remaining())
            .field("calls", &self.call_count())
            .field("delay", &self.delay)
            .finish()
    }
}

impl Default for ScriptedEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Queue a response (builder pattern).
    pub fn then(self, response: ModelResponse) -> Self {
        self.then_result(Ok(response))
    }

    /// Queue an error (builder pattern).
    pub fn then_error(self, error: ModelError) -> Self {
        self.then_result(Err(error))
    }

    pub fn then_result(self, result: Result<ModelResponse, ModelError>) -> Self {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(result);
        self
    }

    /// Answer every call the queue does not cover with `f(request, call_index)`.
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&ModelRequest, usize) -> Result<ModelResponse, ModelError> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// Wait this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Queued responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn record(&self, request: &ModelRequest) -> usize {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.push(request.clone());
        requests.len() - 1
    }

    fn answer(&self, request: &ModelRequest, index: usize) -> Result<ModelResponse, ModelError> {
        let queued = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match (queued, &self.responder) {
            (Some(result), _) => result,
            (None, Some(responder)) => responder(request, index),
            (None, None) => Err(ModelError::Other("scripted responses exhausted".into())),
        }
    }
}

impl ModelEndpoint for ScriptedEndpoint {
    fn complete<'a>(&'a self, request: &'a ModelRequest) -> ModelFuture<'a> {
        Box::pin(async move {
            let index = self.record(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.answer(request, index)
        })
    }
}
