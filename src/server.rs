//! Socket server endpoint.
//!
//! A [`ServerEndpoint`] binds a TCP port, accepts one peer at a time and feeds
//! every received message through an inbound queue to an [`InboundHandler`]
//! running on its own worker thread. When the peer goes away the endpoint
//! drops the stream and goes back to accepting.
//!
//! # Example
//!
//! ```rust,no_run
//! use sd_bridge::{BridgeConfig, ConnectionLifecycle, ServerEndpoint};
//!
//! let handler = |payload: &[u8]| -> sd_bridge::Result<()> {
//!     println!("received {} bytes", payload.len());
//!     Ok(())
//! };
//! let mut server = ServerEndpoint::new("requests", BridgeConfig::default(), 50006, handler);
//! server.start()?;
//! // ...
//! server.stop();
//! # Ok::<(), sd_bridge::BridgeError>(())
//! ```

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lifecycle::{ConnectionLifecycle, ThreadRegistry};
use crate::queue::{queue, Next, QueueReceiver, QueueSender};
use crate::signal::QuitSignal;
use crate::state::{ConnectionState, StateCell};
use crate::transport::{
    bind_listener, connection_slot, is_broken_pipe, is_timeout, read_once, ReadOutcome,
    SharedConnection, SlotOwner, Transport,
};
use crate::watchdog::{LivenessWatchdog, OsProcessTable, ProcessProbe};

/// Consumer of inbound messages, called on the endpoint's inbound worker thread.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, payload: &[u8]) -> Result<()>;
}

impl<F> InboundHandler for F
where
    F: Fn(&[u8]) -> Result<()> + Send + Sync,
{
    fn handle(&self, payload: &[u8]) -> Result<()> {
        self(payload)
    }
}

/// State shared between the threads of one running server instance.
struct ServerShared {
    name: String,
    addr: String,
    quit: QuitSignal,
    state: StateCell,
    connection: SharedConnection,
    inbound: QueueSender<Vec<u8>>,
    response_queue: Option<QueueSender<Vec<u8>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accepted: AtomicUsize,
    read_buffer_size: usize,
    poll_interval: Duration,
    accept_timeout: Duration,
}

impl ServerShared {
    fn enqueue_inbound(&self, payload: Vec<u8>) -> Result<()> {
        if self.quit.is_set() {
            return Err(BridgeError::Closed);
        }
        self.inbound.push(payload)
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release every thread of this instance.
    fn quit(&self) {
        self.quit.set();
        if let Some(queue) = &self.response_queue {
            queue.push_sentinel();
        }
        self.connection.close();
        self.inbound.push_sentinel();
    }
}

struct ServerSession {
    shared: Arc<ServerShared>,
    threads: ThreadRegistry,
}

/// Single-peer TCP server with an inbound message queue.
pub struct ServerEndpoint {
    name: String,
    config: BridgeConfig,
    port: u16,
    handler: Arc<dyn InboundHandler>,
    probe: Arc<dyn ProcessProbe>,
    linked: Vec<SharedConnection>,
    session: Option<ServerSession>,
}

impl ServerEndpoint {
    /// Create a server for `config.host:port`. Nothing is bound until `start`.
    pub fn new(
        name: impl Into<String>,
        config: BridgeConfig,
        port: u16,
        handler: impl InboundHandler + 'static,
    ) -> Self {
        Self::with_handler(name, config, port, Arc::new(handler))
    }

    pub fn with_handler(
        name: impl Into<String>,
        config: BridgeConfig,
        port: u16,
        handler: Arc<dyn InboundHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            port,
            handler,
            probe: Arc::new(OsProcessTable),
            linked: Vec::new(),
            session: None,
        }
    }

    /// Replace the process-table probe used by the watchdog.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Have the watchdog close `connection` too when the host goes away.
    pub fn link_connection(&mut self, connection: SharedConnection) {
        self.linked.push(connection);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a new instance sharing `quit` with other endpoints.
    ///
    /// `response_queue` is released together with this endpoint's own queue
    /// when the instance quits.
    pub fn start_with(
        &mut self,
        quit: QuitSignal,
        response_queue: Option<QueueSender<Vec<u8>>>,
    ) -> Result<()> {
        if let Some(session) = &self.session {
            if session.shared.state.get() != ConnectionState::Closed {
                return Err(BridgeError::AlreadyRunning);
            }
        }

        let addr = self.config.addr(self.port);
        let (inbound_tx, inbound_rx) = queue();
        let (owner, connection) = connection_slot();

        let shared = Arc::new(ServerShared {
            name: self.name.clone(),
            addr: addr.clone(),
            quit,
            state: StateCell::new(),
            connection,
            inbound: inbound_tx,
            response_queue,
            local_addr: Mutex::new(None),
            accepted: AtomicUsize::new(0),
            read_buffer_size: self.config.read_buffer_size,
            poll_interval: self.config.poll_interval(),
            accept_timeout: self.config.accept_timeout(),
        });

        // Bind eagerly so callers can read the port; failures retry in the loop.
        let listener = match bind_listener(&addr) {
            Ok(listener) => {
                shared.set_local_addr(listener.local_addr().ok());
                info!(endpoint = %self.name, addr = %addr, "Socket opened");
                Some(listener)
            }
            Err(e) => {
                warn!(endpoint = %self.name, addr = %addr, error = %e, "Failed to open socket, will retry");
                None
            }
        };

        let mut threads = ThreadRegistry::new(self.name.clone());
        let spawned = self.spawn_threads(&mut threads, &shared, owner, listener, inbound_rx);
        self.session = Some(ServerSession {
            shared: Arc::clone(&shared),
            threads,
        });
        if let Err(e) = spawned {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn spawn_threads(
        &self,
        threads: &mut ThreadRegistry,
        shared: &Arc<ServerShared>,
        owner: SlotOwner,
        listener: Option<TcpListener>,
        inbound_rx: QueueReceiver<Vec<u8>>,
    ) -> Result<()> {
        let accept_shared = Arc::clone(shared);
        threads.spawn(&format!("{} accept", self.name), move || {
            accept_loop(accept_shared, owner, listener)
        })?;

        let worker_shared = Arc::clone(shared);
        let handler = Arc::clone(&self.handler);
        threads.spawn(&format!("{} worker", self.name), move || {
            inbound_worker(worker_shared, inbound_rx, handler)
        })?;

        if let Some(pid) = self.config.host_pid {
            let mut watchdog = LivenessWatchdog::new(
                pid,
                shared.quit.clone(),
                Arc::clone(&shared.connection),
                shared.inbound.clone(),
                Arc::clone(&self.probe),
            );
            if let Some(queue) = &shared.response_queue {
                watchdog = watchdog.with_response_queue(queue.clone());
            }
            for connection in &self.linked {
                watchdog = watchdog.with_linked_connection(Arc::clone(connection));
            }
            let interval = self.config.poll_interval();
            threads.spawn(&format!("{} watchdog", self.name), move || {
                watchdog.run(interval)
            })?;
        }
        Ok(())
    }

    fn shared(&self) -> Option<&Arc<ServerShared>> {
        self.session.as_ref().map(|s| &s.shared)
    }

    /// Push a message onto the inbound queue as if it had been received.
    pub fn enqueue_inbound(&self, payload: Vec<u8>) -> Result<()> {
        self.shared()
            .ok_or(BridgeError::Closed)?
            .enqueue_inbound(payload)
    }

    /// Address the listener is bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared().and_then(|s| s.local_addr())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared()
            .map(|s| s.state.get())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the state satisfies `pred`.
    pub fn wait_for_state<F>(&self, timeout: Duration, pred: F) -> Option<ConnectionState>
    where
        F: FnMut(ConnectionState) -> bool,
    {
        self.shared()?.state.wait_for(timeout, pred)
    }

    /// The accepted-peer connection of the running instance.
    pub fn connection(&self) -> Option<SharedConnection> {
        self.shared().map(|s| Arc::clone(&s.connection))
    }

    pub fn quit_signal(&self) -> Option<QuitSignal> {
        self.shared().map(|s| s.quit.clone())
    }

    /// Number of peers accepted by the running instance.
    pub fn accepted_count(&self) -> usize {
        self.shared()
            .map(|s| s.accepted.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Names of the running instance's threads, in start order.
    pub fn thread_names(&self) -> Vec<String> {
        self.session
            .as_ref()
            .map(|s| s.threads.names())
            .unwrap_or_default()
    }

    /// Threads of the current instance that are still running.
    pub fn running_threads(&self) -> usize {
        self.session.as_ref().map(|s| s.threads.running()).unwrap_or(0)
    }

    /// Set quit and release every queue and the connection, without joining.
    pub fn quit(&self) {
        if let Some(shared) = self.shared() {
            shared.quit();
        }
    }

    /// Quit and join every thread.
    pub fn close(&mut self) {
        self.stop();
    }
}

impl ConnectionLifecycle for ServerEndpoint {
    fn start(&mut self) -> Result<()> {
        self.start_with(QuitSignal::new(), None)
    }

    fn stop(&mut self) {
        let join_timeout = self.config.join_timeout();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.shared.state.get() == ConnectionState::Closed {
            return;
        }
        debug!(endpoint = %self.name, "Stopping server");
        session.shared.state.begin_close();
        session.shared.quit();
        session.threads.join_all(join_timeout);
        session.shared.state.close();
        info!(endpoint = %self.name, "Server stopped");
    }

    fn disconnect(&self) {
        if let Some(shared) = self.shared() {
            shared.state.demote(ConnectionState::Reconnecting);
            shared.connection.close();
        }
    }

    fn connect(&self) {
        if let Some(shared) = self.shared() {
            shared.quit.wake();
        }
    }
}

impl Drop for ServerEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accept one peer at a time and pump its messages into the inbound queue.
///
/// This thread is the only writer of the connection slot.
fn accept_loop(shared: Arc<ServerShared>, owner: SlotOwner, mut listener: Option<TcpListener>) {
    let mut buf = vec![0u8; shared.read_buffer_size];
    let mut reader: Option<TcpStream> = None;

    loop {
        if shared.quit.is_set() {
            break;
        }

        let Some(active) = listener.as_ref() else {
            match bind_listener(&shared.addr) {
                Ok(bound) => {
                    shared.set_local_addr(bound.local_addr().ok());
                    info!(endpoint = %shared.name, addr = %shared.addr, "Socket opened");
                    listener = Some(bound);
                }
                Err(e) => {
                    warn!(endpoint = %shared.name, error = %e, "Failed to open socket");
                    if shared.quit.wait_timeout(shared.poll_interval) {
                        break;
                    }
                }
            }
            continue;
        };

        match reader.as_mut() {
            None => match active.accept() {
                Ok((stream, peer)) => match owner.install(stream, shared.poll_interval) {
                    Ok(stream) => {
                        reader = Some(stream);
                        shared.accepted.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = shared.state.transition(ConnectionState::Connected) {
                            debug!(endpoint = %shared.name, error = %e, "State not updated");
                        }
                        info!(endpoint = %shared.name, peer = %peer, "Connection established");
                    }
                    Err(e) => {
                        warn!(endpoint = %shared.name, peer = %peer, error = %e, "Failed to configure accepted socket");
                        owner.clear();
                    }
                },
                Err(e) if is_timeout(&e) => {
                    if shared.quit.wait_timeout(shared.accept_timeout) {
                        break;
                    }
                }
                Err(e) if is_broken_pipe(&e) => {
                    warn!(endpoint = %shared.name, error = %e, "Connection reset during accept, retrying");
                }
                Err(e) => {
                    error!(endpoint = %shared.name, error = %e, "Accept failed");
                    if shared.quit.wait_timeout(shared.poll_interval) {
                        break;
                    }
                }
            },
            Some(stream) => match read_once(stream, &mut buf) {
                ReadOutcome::Data(payload) => {
                    debug!(endpoint = %shared.name, bytes = payload.len(), "Message received");
                    if let Err(e) = shared.enqueue_inbound(payload) {
                        debug!(endpoint = %shared.name, error = %e, "Inbound queue closed");
                    }
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Closed => {
                    info!(endpoint = %shared.name, "Peer closed connection");
                    reader = None;
                    reset_connection(&shared, &owner);
                }
                ReadOutcome::Failed(e) => {
                    warn!(endpoint = %shared.name, error = %e, "Connection reset");
                    reader = None;
                    reset_connection(&shared, &owner);
                }
            },
        }
    }

    drop(reader);
    owner.clear();
    drop(listener);
    shared.state.begin_close();
    debug!(endpoint = %shared.name, "Server loop stopped");
}

/// Drop the peer and go back to listening.
fn reset_connection(shared: &ServerShared, owner: &SlotOwner) {
    owner.clear();
    shared.state.demote(ConnectionState::Disconnected);
}

fn inbound_worker(
    shared: Arc<ServerShared>,
    inbound: QueueReceiver<Vec<u8>>,
    handler: Arc<dyn InboundHandler>,
) {
    debug!(endpoint = %shared.name, "Inbound worker started");
    loop {
        match inbound.next(&shared.quit, shared.poll_interval) {
            Next::Item(payload) => match handler.handle(&payload) {
                Ok(()) => {}
                Err(e @ BridgeError::Protocol(_)) => {
                    warn!(endpoint = %shared.name, error = %e, "Dropping malformed message");
                }
                Err(e) => {
                    error!(endpoint = %shared.name, error = %e, "Message handler failed");
                }
            },
            Next::Idle => {}
            Next::Stop => break,
        }
    }
    debug!(endpoint = %shared.name, "Inbound worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;

    fn ignore(_: &[u8]) -> Result<()> {
        Ok(())
    }

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            poll_interval_ms: 20,
            accept_timeout_ms: 10,
            join_timeout_ms: 2000,
            response_port: None,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn test_start_binds_and_stop_joins_threads() {
        let mut server = ServerEndpoint::new("test", fast_config(), 0, ignore);
        server.start().unwrap();
        assert!(server.local_addr().is_some());
        assert_eq!(server.thread_names(), vec!["test accept", "test worker"]);
        assert!(matches!(server.start(), Err(BridgeError::AlreadyRunning)));
        server.stop();
        assert_eq!(server.state(), ConnectionState::Closed);
        assert_eq!(server.running_threads(), 0);
        assert!(matches!(
            server.enqueue_inbound(b"x".to_vec()),
            Err(BridgeError::Closed)
        ));
    }

    #[test]
    fn test_received_bytes_reach_handler() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler = move |payload: &[u8]| -> Result<()> {
            tx.lock().unwrap().send(payload.to_vec()).unwrap();
            Ok(())
        };
        let mut server = ServerEndpoint::new("test", fast_config(), 0, handler);
        server.start().unwrap();

        let mut peer = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        peer.write_all(b"{\"type\":\"txt2img\"}").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"{\"type\":\"txt2img\"}".to_vec());
        assert!(server.is_connected());
        server.stop();
    }

    #[test]
    fn test_peer_close_returns_to_listening() {
        let mut server = ServerEndpoint::new("test", fast_config(), 0, ignore);
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let peer = TcpStream::connect(addr).unwrap();
        server
            .wait_for_state(Duration::from_secs(5), |s| s == ConnectionState::Connected)
            .unwrap();
        drop(peer);
        server
            .wait_for_state(Duration::from_secs(5), |s| s == ConnectionState::Disconnected)
            .unwrap();

        let _peer = TcpStream::connect(addr).unwrap();
        server
            .wait_for_state(Duration::from_secs(5), |s| s == ConnectionState::Connected)
            .unwrap();
        assert_eq!(server.accepted_count(), 2);
        server.stop();
    }

    #[test]
    fn test_handler_errors_keep_worker_alive() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler = move |payload: &[u8]| -> Result<()> {
            if payload == b"bad" {
                return Err(BridgeError::Protocol("bad".into()));
            }
            tx.lock().unwrap().send(payload.to_vec()).unwrap();
            Ok(())
        };
        let mut server = ServerEndpoint::new("test", fast_config(), 0, handler);
        server.start().unwrap();
        server.enqueue_inbound(b"bad".to_vec()).unwrap();
        server.enqueue_inbound(b"good".to_vec()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"good".to_vec());
        server.close();
        assert_eq!(server.running_threads(), 0);
    }

    #[test]
    fn test_restart_builds_fresh_instance() {
        let mut server = ServerEndpoint::new("test", fast_config(), 0, ignore);
        server.start().unwrap();
        let first = server.quit_signal().unwrap();
        server.restart().unwrap();
        let second = server.quit_signal().unwrap();
        assert!(first.is_set());
        assert!(!second.is_set());
        assert!(!first.same_as(&second));
        server.stop();
    }
}
