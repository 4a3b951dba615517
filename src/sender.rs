//! Response sender: drains the response queue onto the peer connection.
//!
//! Delivery is best effort. A response that cannot be written because no peer
//! is connected, or because the write fails, is logged and dropped.

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::protocol::ResponseEnvelope;
use crate::queue::{Next, QueueReceiver};
use crate::signal::QuitSignal;
use crate::transport::Transport;

pub struct ResponseSender<T: Transport> {
    transport: T,
    queue: QueueReceiver<Vec<u8>>,
    quit: QuitSignal,
    read_bound: usize,
}

impl<T: Transport> ResponseSender<T> {
    /// `read_bound` is the peer's single-read size, used only to warn about
    /// responses that will arrive truncated.
    pub fn new(
        transport: T,
        queue: QueueReceiver<Vec<u8>>,
        quit: QuitSignal,
        read_bound: usize,
    ) -> Self {
        Self {
            transport,
            queue,
            quit,
            read_bound,
        }
    }

    /// Wrap one backend result and write it to the peer.
    pub fn send(&self, result: &[u8]) -> Result<()> {
        let wire = ResponseEnvelope::from_result_bytes(result).to_wire()?;
        if wire.len() > self.read_bound {
            warn!(
                bytes = wire.len(),
                limit = self.read_bound,
                "Response exceeds the peer read size and will arrive truncated"
            );
        }
        self.transport.send(&wire).map_err(BridgeError::SendFailure)
    }

    /// Drain the queue until the sentinel or quit arrives.
    pub fn run(self, poll: Duration) {
        debug!("Response sender started");
        loop {
            match self.queue.next(&self.quit, poll) {
                Next::Item(result) => match self.send(&result) {
                    Ok(()) => debug!(bytes = result.len(), "Response sent"),
                    Err(e) => warn!(error = %e, "Failed to send response, dropping it"),
                },
                Next::Idle => {}
                Next::Stop => break,
            }
        }
        debug!("Response sender stopped");
    }
}
