//! FIFO queues bridging socket threads and worker threads.
//!
//! Every queue carries [`Queued::Sentinel`] in addition to payloads so a
//! worker blocked on a read can be released during shutdown.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::signal::QuitSignal;

/// One queue slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Queued<T> {
    Message(T),
    /// Reserved value telling the consumer to exit.
    Sentinel,
}

/// Producer half of a bridge queue.
#[derive(Debug)]
pub struct QueueSender<T> {
    tx: Sender<Queued<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> QueueSender<T> {
    /// Push a payload. Fails with [`BridgeError::Closed`] once the consumer exited.
    pub fn push(&self, item: T) -> Result<()> {
        self.tx
            .send(Queued::Message(item))
            .map_err(|_| BridgeError::Closed)
    }

    /// Push the sentinel. A consumer that already exited is not an error.
    pub fn push_sentinel(&self) {
        let _ = self.tx.send(Queued::Sentinel);
    }
}

/// Consumer half of a bridge queue.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: Receiver<Queued<T>>,
}

/// What a consumer should do after one bounded wait.
#[derive(Debug, PartialEq)]
pub enum Next<T> {
    Item(T),
    /// Nothing arrived within the poll interval.
    Idle,
    /// Sentinel received, quit observed, or every producer dropped.
    Stop,
}

impl<T> QueueReceiver<T> {
    /// Wait at most `poll` for the next payload.
    ///
    /// A sentinel sets `quit` before returning [`Next::Stop`].
    pub fn next(&self, quit: &QuitSignal, poll: Duration) -> Next<T> {
        if quit.is_set() {
            return Next::Stop;
        }
        match self.rx.recv_timeout(poll) {
            Ok(Queued::Message(item)) => Next::Item(item),
            Ok(Queued::Sentinel) => {
                quit.set();
                Next::Stop
            }
            Err(RecvTimeoutError::Timeout) if quit.is_set() => Next::Stop,
            Err(RecvTimeoutError::Timeout) => Next::Idle,
            Err(RecvTimeoutError::Disconnected) => Next::Stop,
        }
    }
}

/// Create an unbounded bridge queue.
pub fn queue<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel();
    (QueueSender { tx }, QueueReceiver { rx })
}
