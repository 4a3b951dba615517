//! # sd-bridge
//!
//! Resilient two-channel socket bridge between an image-generation worker
//! and the host application that drives it.
//!
//! The worker runs a [`WorkerBridge`]: a request server, a response server,
//! a [`RequestDispatcher`] in front of a [`ComputeBackend`] and a
//! [`ResponseSender`]. The host runs a [`HostBridge`] with one reconnecting
//! [`ClientEndpoint`] per port. Either side may start first and either side
//! may restart; the clients reconnect on a fixed interval and resend anything
//! they could not deliver in the meantime.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sd_bridge::{BridgeConfig, ComputeBackend, ConnectionLifecycle, RequestKind, WorkerBridge};
//! use serde_json::{Map, Value};
//!
//! struct Sampler;
//!
//! impl ComputeBackend for Sampler {
//!     fn sample(&self, kind: RequestKind, options: &Map<String, Value>) -> anyhow::Result<Option<Vec<u8>>> {
//!         let _ = (kind, options);
//!         Ok(Some(br#"["/tmp/out1.png"]"#.to_vec()))
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::default().with_env_overrides()?;
//!     let mut worker = WorkerBridge::new(config, Sampler);
//!     worker.start()?;
//!     worker.run_until_quit();
//!     Ok(())
//! }
//! ```
//!
//! ## Protocol Overview
//!
//! One JSON document per write, no framing, read with a single 1024-byte read.
//!
//! **Request** (host to worker, port 50006):
//! ```json
//! {"type":"txt2img","options":{"prompt":"a cat","seed":42}}
//! ```
//!
//! **Response** (worker to host, port 50007):
//! ```json
//! {"response":["/tmp/out1.png"]}
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod sender;
pub mod server;
pub mod signal;
pub mod state;
pub mod transport;
pub mod watchdog;
pub mod worker;

// Re-exports for convenience
pub use client::{ClientEndpoint, FailedMessageList, ResponseHandler};
pub use config::{BridgeConfig, DEFAULT_READ_BUFFER_SIZE, DEFAULT_REQUEST_PORT, DEFAULT_RESPONSE_PORT};
pub use dispatcher::{ComputeBackend, RequestDispatcher};
pub use error::{BridgeError, Result};
pub use host::HostBridge;
pub use lifecycle::{ConnectionLifecycle, ThreadRegistry};
pub use protocol::{InboundMessage, RequestEnvelope, RequestKind, ResponseEnvelope};
pub use queue::{queue, Next, QueueReceiver, QueueSender};
pub use sender::ResponseSender;
pub use server::{InboundHandler, ServerEndpoint};
pub use signal::QuitSignal;
pub use state::ConnectionState;
pub use transport::{SharedConnection, Transport};
pub use watchdog::{is_process_running, LivenessWatchdog, OsProcessTable, ProcessProbe};
pub use worker::WorkerBridge;
