//! Demo: worker that answers every request with a fake image path.
//!
//! # Run the worker
//! ```bash
//! cargo run --example echo_worker
//! ```
//!
//! Set `SD_BRIDGE_HOST_PID` to make the worker exit when that process dies.
//!
//! # Send a request by hand
//! ```bash
//! nc 127.0.0.1 50007 &
//! printf '{"type":"txt2img","options":{"prompt":"a cat","seed":42}}' | nc -q1 127.0.0.1 50006
//! ```

use anyhow::Result;
use sd_bridge::logging::init_stderr_logging;
use sd_bridge::{BridgeConfig, ComputeBackend, ConnectionLifecycle, RequestKind, WorkerBridge};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Pretends to render and reports where the image would be.
#[derive(Default)]
struct EchoSampler {
    jobs: AtomicUsize,
}

impl ComputeBackend for EchoSampler {
    fn sample(&self, kind: RequestKind, options: &Map<String, Value>) -> Result<Option<Vec<u8>>> {
        let job = self.jobs.fetch_add(1, Ordering::SeqCst) + 1;
        let prompt = options.get("prompt").and_then(Value::as_str).unwrap_or("");
        tracing::info!(%kind, job, prompt, "Rendering");
        let path = format!("/tmp/{}-{}.png", kind, job);
        Ok(Some(serde_json::to_vec(&[path])?))
    }
}

fn main() -> Result<()> {
    init_stderr_logging("info")?;

    let config = BridgeConfig::default().with_env_overrides()?;
    config.validate()?;

    let mut worker = WorkerBridge::new(config, EchoSampler::default());
    worker.start()?;
    worker.run_until_quit();
    Ok(())
}
