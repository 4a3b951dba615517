//! Request dispatch to the compute backend.
//!
//! Implement [`ComputeBackend`] to plug an image generator into the worker.

use anyhow::Result as AnyResult;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::protocol::{RequestEnvelope, RequestKind};
use crate::queue::QueueSender;
use crate::server::InboundHandler;

/// The generation backend driven by the worker.
///
/// # Example
///
/// ```rust
/// use sd_bridge::{ComputeBackend, RequestKind};
/// use serde_json::{Map, Value};
///
/// struct FakeBackend;
///
/// impl ComputeBackend for FakeBackend {
///     fn sample(&self, kind: RequestKind, options: &Map<String, Value>) -> anyhow::Result<Option<Vec<u8>>> {
///         let prompt = options.get("prompt").and_then(|v| v.as_str()).unwrap_or("");
///         let path = format!("/tmp/{}-{}.png", kind, prompt.len());
///         Ok(Some(serde_json::to_vec(&[path])?))
///     }
/// }
/// ```
pub trait ComputeBackend: Send + Sync {
    /// Run one generation job synchronously.
    ///
    /// `Ok(None)` (or an empty result) means there is nothing to send back.
    fn sample(&self, kind: RequestKind, options: &Map<String, Value>) -> AnyResult<Option<Vec<u8>>>;
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for Arc<B> {
    fn sample(&self, kind: RequestKind, options: &Map<String, Value>) -> AnyResult<Option<Vec<u8>>> {
        (**self).sample(kind, options)
    }
}

/// Routes parsed requests to the backend and queues non-empty results.
///
/// Jobs run one at a time per dispatcher; concurrent callers wait for the
/// current job to finish.
pub struct RequestDispatcher<B: ComputeBackend> {
    backend: B,
    responses: QueueSender<Vec<u8>>,
    job: Mutex<()>,
}

impl<B: ComputeBackend> RequestDispatcher<B> {
    pub fn new(backend: B, responses: QueueSender<Vec<u8>>) -> Self {
        Self {
            backend,
            responses,
            job: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one request. Returns whether a response was queued.
    pub fn dispatch(&self, request: &RequestEnvelope) -> Result<bool> {
        let _job = self.job.lock().unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();
        debug!(kind = %request.kind, "Dispatching request");

        let result = self
            .backend
            .sample(request.kind, &request.options)
            .map_err(|e| BridgeError::Backend(format!("{:#}", e)))?;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match result {
            Some(bytes) if !bytes.is_empty() => {
                info!(kind = %request.kind, elapsed_ms, bytes = bytes.len(), "Job finished");
                self.responses.push(bytes)?;
                Ok(true)
            }
            _ => {
                debug!(kind = %request.kind, elapsed_ms, "Job produced no result");
                Ok(false)
            }
        }
    }
}

impl<B: ComputeBackend> InboundHandler for RequestDispatcher<B> {
    fn handle(&self, payload: &[u8]) -> Result<()> {
        let request = RequestEnvelope::from_wire(payload).inspect_err(|e| {
            warn!(error = %e, bytes = payload.len(), "Rejecting request");
        })?;
        self.dispatch(&request).map(|_| ())
    }
}
