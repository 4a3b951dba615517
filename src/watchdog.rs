//! Host liveness watchdog.
//!
//! Polls the process table for the host application's pid and shuts the
//! worker down once the host is gone, so a crashed host never leaves an
//! orphaned worker behind.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::error::BridgeError;
use crate::queue::QueueSender;
use crate::signal::QuitSignal;
use crate::transport::{SharedConnection, Transport};

/// Lookup of a pid in the process table.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessTable;

impl ProcessProbe for OsProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        is_process_running(pid)
    }
}

/// Check if a process with the given PID exists.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // kill(pid, 0) probes existence without delivering a signal.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Everything the watchdog releases when the host disappears.
pub struct LivenessWatchdog {
    pid: u32,
    quit: QuitSignal,
    response_queue: Option<QueueSender<Vec<u8>>>,
    connection: SharedConnection,
    linked: Vec<SharedConnection>,
    inbound_queue: QueueSender<Vec<u8>>,
    probe: Arc<dyn ProcessProbe>,
}

impl LivenessWatchdog {
    pub fn new(
        pid: u32,
        quit: QuitSignal,
        connection: SharedConnection,
        inbound_queue: QueueSender<Vec<u8>>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            pid,
            quit,
            response_queue: None,
            connection,
            linked: Vec::new(),
            inbound_queue,
            probe,
        }
    }

    /// Also close `connection`, the accepted peer of a sibling endpoint.
    pub fn with_linked_connection(mut self, connection: SharedConnection) -> Self {
        self.linked.push(connection);
        self
    }

    /// Also release this response queue on shutdown.
    pub fn with_response_queue(mut self, queue: QueueSender<Vec<u8>>) -> Self {
        self.response_queue = Some(queue);
        self
    }

    /// One liveness check. Returns `true` once the instance is quitting.
    ///
    /// When the host is gone: set quit, release the response queue, close the
    /// accepted connection and any linked ones, then release the inbound queue.
    pub fn check(&self) -> bool {
        if self.quit.is_set() {
            return true;
        }
        if self.probe.is_alive(self.pid) {
            return false;
        }
        error!(error = %BridgeError::ProcessGone(self.pid), "Host process not found, quitting");
        self.quit.set();
        if let Some(queue) = &self.response_queue {
            queue.push_sentinel();
        }
        self.connection.close();
        for connection in &self.linked {
            connection.close();
        }
        self.inbound_queue.push_sentinel();
        true
    }

    /// Poll every `interval` until the host disappears or quit is set.
    pub fn run(self, interval: Duration) {
        debug!(pid = self.pid, "Watching host process");
        loop {
            if self.check() {
                break;
            }
            if self.quit.wait_timeout(interval) {
                break;
            }
        }
        debug!(pid = self.pid, "Watchdog stopped");
    }
}
