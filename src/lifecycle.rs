//! Connection lifecycle: worker thread bookkeeping and the start/stop contract.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::{BridgeError, Result};

/// How often a bounded join re-checks whether a thread finished.
const JOIN_POLL: Duration = Duration::from_millis(5);

struct NamedThread {
    name: String,
    handle: Option<JoinHandle<()>>,
}

/// Ordered list of named worker threads owned by one connection instance.
///
/// Joining takes the handles but keeps the names, so a stopped instance still
/// reports which threads it ran.
pub struct ThreadRegistry {
    owner: String,
    threads: Vec<NamedThread>,
}

impl ThreadRegistry {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            threads: Vec::new(),
        }
    }

    /// Spawn a named thread and register it.
    pub fn spawn<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|source| BridgeError::Spawn {
                name: name.to_string(),
                source,
            })?;
        debug!(endpoint = %self.owner, thread = name, "Thread started");
        self.threads.push(NamedThread {
            name: name.to_string(),
            handle: Some(handle),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.threads.iter().map(|t| t.name.clone()).collect()
    }

    /// Threads registered here that have not finished yet.
    pub fn running(&self) -> usize {
        self.threads
            .iter()
            .filter(|t| t.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .count()
    }

    /// Join every thread in registration order, waiting at most `timeout` each.
    ///
    /// A thread that panicked, overran the bound, or is the caller itself is
    /// logged and skipped. Returns the number of threads that joined cleanly.
    pub fn join_all(&mut self, timeout: Duration) -> usize {
        let total = self.threads.len();
        let current = thread::current().id();
        let mut joined = 0;
        for (index, entry) in self.threads.iter_mut().enumerate() {
            let Some(handle) = entry.handle.take() else {
                continue;
            };
            debug!(
                endpoint = %self.owner,
                "{} of {} stopping thread {}",
                index + 1,
                total,
                entry.name
            );
            if handle.thread().id() == current {
                debug!(endpoint = %self.owner, thread = %entry.name, "Not joining the calling thread");
                continue;
            }
            let deadline = Instant::now() + timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !handle.is_finished() {
                warn!(
                    endpoint = %self.owner,
                    thread = %entry.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Thread did not stop in time, detaching"
                );
                continue;
            }
            match handle.join() {
                Ok(()) => {
                    joined += 1;
                    debug!(endpoint = %self.owner, thread = %entry.name, "Thread stopped");
                }
                Err(_) => error!(endpoint = %self.owner, thread = %entry.name, "Thread panicked"),
            }
        }
        debug!(endpoint = %self.owner, joined, total, "All threads stopped");
        joined
    }
}

/// Start/stop contract shared by every endpoint.
///
/// `start` spawns the connect loop and its workers for a fresh connection
/// instance. `stop` quits that instance, disconnects and joins its threads; a
/// stopped instance is never resumed, `start` builds a new one.
pub trait ConnectionLifecycle {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    /// Drop the current peer. The connect loop notices and re-establishes it.
    fn disconnect(&self);

    /// Ask the connect loop to (re)connect now instead of after its retry delay.
    fn connect(&self);

    fn restart(&mut self) -> Result<()> {
        self.stop();
        self.start()
    }

    /// Disconnect then connect without touching any threads.
    fn reconnect(&self) {
        self.disconnect();
        self.connect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_join_all_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ThreadRegistry::new("test");
        for name in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            registry
                .spawn(name, move || order.lock().unwrap().push(name))
                .unwrap();
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.join_all(Duration::from_secs(5)), 3);
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
        assert_eq!(order.lock().unwrap().len(), 3);
        assert_eq!(registry.running(), 0);
    }

    #[test]
    fn test_join_all_continues_past_panicked_thread() {
        let mut registry = ThreadRegistry::new("test");
        registry.spawn("boom", || panic!("intentional")).unwrap();
        registry.spawn("fine", || {}).unwrap();
        assert_eq!(registry.join_all(Duration::from_secs(5)), 1);
    }

    #[test]
    fn test_join_all_is_bounded() {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let mut registry = ThreadRegistry::new("test");
        registry
            .spawn("stuck", move || {
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();
        let start = Instant::now();
        assert_eq!(registry.join_all(Duration::from_millis(50)), 0);
        assert!(start.elapsed() < Duration::from_secs(2));
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_registry_keeps_names_after_join() {
        let mut registry = ThreadRegistry::new("test");
        registry.spawn("worker", || {}).unwrap();
        registry.join_all(Duration::from_secs(5));
        assert_eq!(registry.names(), vec!["worker"]);
        assert_eq!(registry.join_all(Duration::from_secs(5)), 0);
    }

    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl ConnectionLifecycle for Recorder {
        fn start(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("start");
            Ok(())
        }
        fn stop(&mut self) {
            self.calls.lock().unwrap().push("stop");
        }
        fn disconnect(&self) {
            self.calls.lock().unwrap().push("disconnect");
        }
        fn connect(&self) {
            self.calls.lock().unwrap().push("connect");
        }
    }

    #[test]
    fn test_default_restart_and_reconnect_are_sequential() {
        let mut rec = Recorder {
            calls: Mutex::new(Vec::new()),
        };
        rec.restart().unwrap();
        rec.reconnect();
        assert_eq!(
            *rec.calls.lock().unwrap(),
            vec!["stop", "start", "disconnect", "connect"]
        );
    }
}
