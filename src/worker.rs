//! Worker-side bridge: request server, optional response server, dispatcher
//! and response sender wired to one quit signal.
//!
//! Requests arrive on `request_port` and run one at a time on the backend.
//! Non-empty results are queued and written to the peer of the response
//! server, or back over the request connection when `response_port` is
//! `None`. If `host_pid` is set, the worker shuts itself down once the host
//! process disappears.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::dispatcher::{ComputeBackend, RequestDispatcher};
use crate::error::{BridgeError, Result};
use crate::lifecycle::{ConnectionLifecycle, ThreadRegistry};
use crate::queue::{queue, QueueSender};
use crate::sender::ResponseSender;
use crate::server::ServerEndpoint;
use crate::signal::QuitSignal;
use crate::state::ConnectionState;
use crate::watchdog::{OsProcessTable, ProcessProbe};

struct WorkerSession {
    quit: QuitSignal,
    requests: ServerEndpoint,
    responses: Option<ServerEndpoint>,
    response_tx: QueueSender<Vec<u8>>,
    threads: ThreadRegistry,
}

pub struct WorkerBridge<B: ComputeBackend + 'static> {
    config: BridgeConfig,
    backend: Arc<B>,
    probe: Arc<dyn ProcessProbe>,
    session: Option<WorkerSession>,
}

impl<B: ComputeBackend + 'static> WorkerBridge<B> {
    pub fn new(config: BridgeConfig, backend: B) -> Self {
        Self {
            config,
            backend: Arc::new(backend),
            probe: Arc::new(OsProcessTable),
            session: None,
        }
    }

    /// Replace the process-table probe used to watch the host.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn start_session(&self) -> Result<WorkerSession> {
        let quit = QuitSignal::new();
        let (response_tx, response_rx) = queue();

        // The response server starts first so the request server's watchdog
        // can close its peer too.
        let mut responses = match self.config.response_port {
            Some(port) => {
                let config = BridgeConfig {
                    host_pid: None,
                    ..self.config.clone()
                };
                let mut server = ServerEndpoint::new("responses", config, port, discard);
                server.start_with(quit.clone(), Some(response_tx.clone()))?;
                Some(server)
            }
            None => None,
        };

        let dispatcher = RequestDispatcher::new(Arc::clone(&self.backend), response_tx.clone());
        let mut requests = ServerEndpoint::new(
            "requests",
            self.config.clone(),
            self.config.request_port,
            dispatcher,
        )
        .with_probe(Arc::clone(&self.probe));
        if let Some(connection) = responses.as_ref().and_then(ServerEndpoint::connection) {
            requests.link_connection(connection);
        }
        if let Err(e) = requests.start_with(quit.clone(), Some(response_tx.clone())) {
            if let Some(server) = responses.as_mut() {
                server.stop();
            }
            return Err(e);
        }

        let target = responses.as_ref().unwrap_or(&requests).connection();
        let Some(connection) = target else {
            requests.stop();
            if let Some(server) = responses.as_mut() {
                server.stop();
            }
            return Err(BridgeError::Closed);
        };
        let sender = ResponseSender::new(
            connection,
            response_rx,
            quit.clone(),
            self.config.read_buffer_size,
        );

        let mut threads = ThreadRegistry::new("worker");
        let poll = self.config.poll_interval();
        if let Err(e) = threads.spawn("response sender", move || sender.run(poll)) {
            requests.stop();
            if let Some(server) = responses.as_mut() {
                server.stop();
            }
            return Err(e);
        }

        Ok(WorkerSession {
            quit,
            requests,
            responses,
            response_tx,
            threads,
        })
    }

    fn session(&self) -> Option<&WorkerSession> {
        self.session.as_ref()
    }

    pub fn quit_signal(&self) -> Option<QuitSignal> {
        self.session().map(|s| s.quit.clone())
    }

    pub fn is_quitting(&self) -> bool {
        self.session().map(|s| s.quit.is_set()).unwrap_or(true)
    }

    pub fn request_addr(&self) -> Option<SocketAddr> {
        self.session()?.requests.local_addr()
    }

    /// Address of the response server, or the request server when responses
    /// share the request connection.
    pub fn response_addr(&self) -> Option<SocketAddr> {
        let session = self.session()?;
        session
            .responses
            .as_ref()
            .unwrap_or(&session.requests)
            .local_addr()
    }

    pub fn request_state(&self) -> ConnectionState {
        self.session()
            .map(|s| s.requests.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn response_state(&self) -> ConnectionState {
        self.session()
            .map(|s| s.responses.as_ref().unwrap_or(&s.requests).state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn wait_for_response_peer(&self, timeout: Duration) -> bool {
        self.session()
            .and_then(|s| {
                s.responses
                    .as_ref()
                    .unwrap_or(&s.requests)
                    .wait_for_state(timeout, |st| st == ConnectionState::Connected)
            })
            .is_some()
    }

    /// Queue a raw result for the response sender, bypassing the backend.
    pub fn enqueue_response(&self, result: Vec<u8>) -> Result<()> {
        match self.session() {
            Some(session) if !session.quit.is_set() => session.response_tx.push(result),
            _ => Err(BridgeError::Closed),
        }
    }

    /// Push a request payload onto the request server's inbound queue.
    pub fn enqueue_request(&self, payload: Vec<u8>) -> Result<()> {
        self.session()
            .ok_or(BridgeError::Closed)?
            .requests
            .enqueue_inbound(payload)
    }

    /// Names of every thread started for the running instance.
    pub fn thread_names(&self) -> Vec<String> {
        let Some(session) = self.session() else {
            return Vec::new();
        };
        let mut names = session.requests.thread_names();
        if let Some(server) = &session.responses {
            names.extend(server.thread_names());
        }
        names.extend(session.threads.names());
        names
    }

    pub fn running_threads(&self) -> usize {
        let Some(session) = self.session() else {
            return 0;
        };
        session.requests.running_threads()
            + session.responses.as_ref().map(|s| s.running_threads()).unwrap_or(0)
            + session.threads.running()
    }

    /// Set quit and release every queue without joining.
    pub fn quit(&self) {
        if let Some(session) = self.session() {
            session.requests.quit();
            if let Some(server) = &session.responses {
                server.quit();
            }
        }
    }

    /// Block until quit is set, by the watchdog, a sentinel or [`quit`](Self::quit).
    pub fn wait(&self) {
        let Some(quit) = self.quit_signal() else {
            return;
        };
        let poll = self.config.poll_interval();
        while !quit.wait_timeout(poll) {}
    }

    /// Serve until quit, then join everything.
    pub fn run_until_quit(&mut self) {
        self.wait();
        info!("Worker quitting");
        self.stop();
    }
}

impl<B: ComputeBackend + 'static> ConnectionLifecycle for WorkerBridge<B> {
    fn start(&mut self) -> Result<()> {
        if let Some(session) = &self.session {
            if session.requests.state() != ConnectionState::Closed {
                return Err(BridgeError::AlreadyRunning);
            }
        }
        self.session = Some(self.start_session()?);
        info!(
            request_port = self.config.request_port,
            response_port = ?self.config.response_port,
            host_pid = ?self.config.host_pid,
            "Worker started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        let join_timeout = self.config.join_timeout();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.requests.state() == ConnectionState::Closed {
            return;
        }
        debug!("Stopping worker");
        session.requests.quit();
        if let Some(server) = session.responses.as_mut() {
            server.stop();
        }
        session.requests.stop();
        session.threads.join_all(join_timeout);
        info!("Worker stopped");
    }

    fn disconnect(&self) {
        if let Some(session) = self.session() {
            session.requests.disconnect();
            if let Some(server) = &session.responses {
                server.disconnect();
            }
        }
    }

    fn connect(&self) {
        if let Some(session) = self.session() {
            session.requests.connect();
            if let Some(server) = &session.responses {
                server.connect();
            }
        }
    }
}

impl<B: ComputeBackend + 'static> Drop for WorkerBridge<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The response port carries worker-to-host traffic only.
fn discard(payload: &[u8]) -> Result<()> {
    debug!(bytes = payload.len(), "Ignoring message on response port");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestKind;
    use serde_json::{Map, Value};

    struct Echo;

    impl ComputeBackend for Echo {
        fn sample(&self, kind: RequestKind, _: &Map<String, Value>) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(Some(serde_json::to_vec(&[kind.as_str()])?))
        }
    }

    fn config(response_port: Option<u16>) -> BridgeConfig {
        BridgeConfig {
            request_port: 0,
            response_port,
            poll_interval_ms: 20,
            accept_timeout_ms: 10,
            join_timeout_ms: 2000,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn test_start_and_stop_with_separate_response_port() {
        let mut worker = WorkerBridge::new(config(Some(0)), Echo);
        worker.start().unwrap();
        assert!(worker.request_addr().is_some());
        assert!(worker.response_addr().is_some());
        assert_ne!(worker.request_addr(), worker.response_addr());
        assert_eq!(
            worker.thread_names(),
            vec![
                "requests accept",
                "requests worker",
                "responses accept",
                "responses worker",
                "response sender"
            ]
        );
        assert!(matches!(worker.start(), Err(BridgeError::AlreadyRunning)));
        worker.stop();
        assert_eq!(worker.running_threads(), 0);
        assert_eq!(worker.request_state(), ConnectionState::Closed);
    }

    #[test]
    fn test_single_port_mode_answers_on_request_server() {
        let mut worker = WorkerBridge::new(config(None), Echo);
        worker.start().unwrap();
        assert_eq!(worker.request_addr(), worker.response_addr());
        worker.stop();
    }

    #[test]
    fn test_quit_releases_wait() {
        let mut worker = WorkerBridge::new(config(Some(0)), Echo);
        worker.start().unwrap();
        worker.quit();
        worker.wait();
        assert!(worker.is_quitting());
        worker.run_until_quit();
        assert_eq!(worker.running_threads(), 0);
        assert!(matches!(
            worker.enqueue_response(b"1".to_vec()),
            Err(BridgeError::Closed)
        ));
    }

    #[test]
    fn test_restart_uses_fresh_quit_signal() {
        let mut worker = WorkerBridge::new(config(Some(0)), Echo);
        worker.start().unwrap();
        let first = worker.quit_signal().unwrap();
        worker.restart().unwrap();
        let second = worker.quit_signal().unwrap();
        assert!(first.is_set());
        assert!(!second.is_set());
        worker.stop();
    }
}
