//! Socket client endpoint used by the host application.
//!
//! A [`ClientEndpoint`] keeps one connection to a worker port alive: it
//! retries on a fixed interval until the worker is reachable and reconnects
//! whenever the connection drops. Outbound messages go through a queue; any
//! message that cannot be written while the worker is unreachable is kept in
//! a [`FailedMessageList`] and resent, in order, after the next reconnect.
//!
//! # Example
//!
//! ```rust,no_run
//! use sd_bridge::{BridgeConfig, ClientEndpoint, ConnectionLifecycle, RequestEnvelope, RequestKind};
//! use serde_json::json;
//!
//! let config = BridgeConfig::default();
//! let port = config.request_port;
//! let mut client = ClientEndpoint::new("requests", config, port, |response: serde_json::Value| {
//!     println!("response: {}", response);
//! });
//! client.start()?;
//!
//! let options = json!({"prompt": "a cat", "seed": 42});
//! let options = options.as_object().cloned().unwrap_or_default();
//! client.send_request(&RequestEnvelope::new(RequestKind::Txt2img, options))?;
//! # Ok::<(), sd_bridge::BridgeError>(())
//! ```

use serde_json::Value;
use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::lifecycle::{ConnectionLifecycle, ThreadRegistry};
use crate::protocol::{self, InboundMessage, RequestEnvelope};
use crate::queue::{queue, Next, QueueReceiver, QueueSender};
use crate::signal::QuitSignal;
use crate::state::{ConnectionState, StateCell};
use crate::transport::{
    connect_with_timeout, connection_slot, is_broken_pipe, is_timeout, read_once, ReadOutcome,
    SlotOwner, Transport,
};

/// Receives response payloads on the client's response worker thread.
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, response: Value);
}

impl<F> ResponseHandler for F
where
    F: Fn(Value) + Send + Sync,
{
    fn on_response(&self, response: Value) {
        self(response)
    }
}

/// Outbound messages waiting for a reconnect, oldest first.
#[derive(Debug, Default)]
pub struct FailedMessageList {
    messages: VecDeque<Value>,
}

impl FailedMessageList {
    pub fn push(&mut self, message: Value) {
        self.messages.push_back(message);
    }

    pub fn front(&self) -> Option<&Value> {
        self.messages.front()
    }

    pub fn pop_front(&mut self) -> Option<Value> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.messages.iter().cloned().collect()
    }
}

type SharedFailedList = Arc<Mutex<FailedMessageList>>;

struct ClientShared {
    name: String,
    addr: String,
    quit: QuitSignal,
    state: StateCell,
    /// Send side of the connection. The connect loop owns the stream itself.
    connection: Arc<dyn Transport>,
    outbound: QueueSender<Value>,
    responses: QueueSender<Vec<u8>>,
    failed: SharedFailedList,
    connects: AtomicUsize,
    read_buffer_size: usize,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl ClientShared {
    fn failed(&self) -> MutexGuard<'_, FailedMessageList> {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn quit(&self) {
        self.quit.set();
        self.responses.push_sentinel();
        self.outbound.push_sentinel();
        self.connection.close();
    }

    /// Send one message, or park it in the failed list if the server is unreachable.
    ///
    /// Parked messages always go out before `message`.
    fn deliver(&self, message: Value) {
        if !self.state.is_connected() {
            debug!(endpoint = %self.name, "Not connected, holding message for retry");
            self.failed().push(message);
            return;
        }
        if !self.flush_failed() {
            self.failed().push(message);
            return;
        }
        match self.send(&message) {
            Ok(()) => debug!(endpoint = %self.name, "Message sent"),
            Err(BridgeError::SendFailure(e)) => {
                self.failed().push(message);
                self.connection_lost(&e);
            }
            Err(e) => error!(endpoint = %self.name, error = %e, "Dropping unsendable message"),
        }
    }

    /// Resend parked messages in order. Returns `true` once the list is empty.
    ///
    /// A message leaves the list only after its write succeeded.
    fn flush_failed(&self) -> bool {
        loop {
            let Some(next) = self.failed().front().cloned() else {
                return true;
            };
            match self.send(&next) {
                Ok(()) => {
                    self.failed().pop_front();
                    debug!(endpoint = %self.name, "Resent held message");
                }
                Err(BridgeError::SendFailure(e)) => {
                    self.connection_lost(&e);
                    return false;
                }
                Err(e) => {
                    error!(endpoint = %self.name, error = %e, "Dropping unsendable held message");
                    self.failed().pop_front();
                }
            }
        }
    }

    fn send(&self, message: &Value) -> Result<()> {
        let wire = protocol::encode(message)?;
        if wire.len() > self.read_buffer_size {
            warn!(
                endpoint = %self.name,
                bytes = wire.len(),
                limit = self.read_buffer_size,
                "Message exceeds the peer read size and will arrive truncated"
            );
        }
        self.connection.send(&wire).map_err(|e| {
            if is_broken_pipe(&e) || is_timeout(&e) {
                BridgeError::SendFailure(e)
            } else {
                BridgeError::Io(e)
            }
        })
    }

    /// Demote to disconnected and shut the stream so the connect loop resets it.
    fn connection_lost(&self, err: &std::io::Error) {
        warn!(endpoint = %self.name, error = %err, "Lost connection to server");
        self.state.demote(ConnectionState::Disconnected);
        self.connection.close();
    }
}

struct ClientSession {
    shared: Arc<ClientShared>,
    threads: ThreadRegistry,
}

/// Reconnecting TCP client with outbound retry.
pub struct ClientEndpoint {
    name: String,
    config: BridgeConfig,
    port: u16,
    handler: Arc<dyn ResponseHandler>,
    failed: SharedFailedList,
    session: Option<ClientSession>,
}

impl ClientEndpoint {
    pub fn new(
        name: impl Into<String>,
        config: BridgeConfig,
        port: u16,
        handler: impl ResponseHandler + 'static,
    ) -> Self {
        Self::with_handler(name, config, port, Arc::new(handler))
    }

    pub fn with_handler(
        name: impl Into<String>,
        config: BridgeConfig,
        port: u16,
        handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            port,
            handler,
            failed: Arc::new(Mutex::new(FailedMessageList::default())),
            session: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a new instance sharing `quit` with other endpoints.
    pub fn start_with(&mut self, quit: QuitSignal) -> Result<()> {
        if let Some(session) = &self.session {
            if session.shared.state.get() != ConnectionState::Closed {
                return Err(BridgeError::AlreadyRunning);
            }
        }

        let (owner, connection) = connection_slot();
        let (outbound_tx, outbound_rx) = queue();
        let (responses_tx, responses_rx) = queue();
        let shared = Arc::new(ClientShared {
            name: self.name.clone(),
            addr: self.config.addr(self.port),
            quit,
            state: StateCell::new(),
            connection,
            outbound: outbound_tx,
            responses: responses_tx,
            failed: Arc::clone(&self.failed),
            connects: AtomicUsize::new(0),
            read_buffer_size: self.config.read_buffer_size,
            poll_interval: self.config.poll_interval(),
            connect_timeout: self.config.connect_timeout(),
        });

        let mut threads = ThreadRegistry::new(self.name.clone());
        let spawned = self.spawn_threads(&mut threads, &shared, owner, outbound_rx, responses_rx);
        self.session = Some(ClientSession { shared, threads });
        if let Err(e) = spawned {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn spawn_threads(
        &self,
        threads: &mut ThreadRegistry,
        shared: &Arc<ClientShared>,
        owner: SlotOwner,
        outbound_rx: QueueReceiver<Value>,
        responses_rx: QueueReceiver<Vec<u8>>,
    ) -> Result<()> {
        let connect_shared = Arc::clone(shared);
        threads.spawn(&format!("{} connect", self.name), move || {
            connect_loop(connect_shared, owner)
        })?;

        let outbound_shared = Arc::clone(shared);
        threads.spawn(&format!("{} outbound", self.name), move || {
            outbound_worker(outbound_shared, outbound_rx)
        })?;

        let response_shared = Arc::clone(shared);
        let handler = Arc::clone(&self.handler);
        threads.spawn(&format!("{} responses", self.name), move || {
            response_worker(response_shared, responses_rx, handler)
        })?;
        Ok(())
    }

    fn shared(&self) -> Option<&Arc<ClientShared>> {
        self.session.as_ref().map(|s| &s.shared)
    }

    fn running_shared(&self) -> Result<&Arc<ClientShared>> {
        match self.shared() {
            Some(shared) if !shared.quit.is_set() => Ok(shared),
            _ => Err(BridgeError::Closed),
        }
    }

    /// Queue a message for the server.
    pub fn enqueue_outbound(&self, message: Value) -> Result<()> {
        self.running_shared()?.outbound.push(message)
    }

    /// Queue a generation request for the server.
    pub fn send_request(&self, request: &RequestEnvelope) -> Result<()> {
        self.enqueue_outbound(request.to_value())
    }

    /// Push a payload onto the response queue as if it had been received.
    pub fn enqueue_inbound(&self, payload: Vec<u8>) -> Result<()> {
        self.running_shared()?.responses.push(payload)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared()
            .map(|s| s.state.get())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn wait_for_state<F>(&self, timeout: Duration, pred: F) -> Option<ConnectionState>
    where
        F: FnMut(ConnectionState) -> bool,
    {
        self.shared()?.state.wait_for(timeout, pred)
    }

    /// Messages currently held for resend, oldest first.
    pub fn failed_messages(&self) -> Vec<Value> {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Successful connects made by the running instance.
    pub fn connect_count(&self) -> usize {
        self.shared()
            .map(|s| s.connects.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn quit_signal(&self) -> Option<QuitSignal> {
        self.shared().map(|s| s.quit.clone())
    }

    pub fn thread_names(&self) -> Vec<String> {
        self.session
            .as_ref()
            .map(|s| s.threads.names())
            .unwrap_or_default()
    }

    pub fn running_threads(&self) -> usize {
        self.session.as_ref().map(|s| s.threads.running()).unwrap_or(0)
    }

    /// Set quit and release both queues without joining.
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

impl ConnectionLifecycle for ClientEndpoint {
    fn start(&mut self) -> Result<()> {
        self.start_with(QuitSignal::new())
    }

    fn stop(&mut self) {
        let join_timeout = self.config.join_timeout();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.shared.state.get() == ConnectionState::Closed {
            return;
        }
        debug!(endpoint = %self.name, "Stopping client");
        session.shared.state.begin_close();
        session.shared.quit();
        session.threads.join_all(join_timeout);
        session.shared.state.close();
        info!(endpoint = %self.name, "Client stopped");
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

impl Drop for ClientEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keep the connection up and pump received payloads into the response queue.
///
/// This thread is the only writer of the connection slot.
fn connect_loop(shared: Arc<ClientShared>, owner: SlotOwner) {
    let mut buf = vec![0u8; shared.read_buffer_size];
    let mut reader: Option<TcpStream> = None;

    loop {
        if shared.quit.is_set() {
            break;
        }

        if !shared.state.is_connected() {
            reader = None;
            owner.clear();
            shared.state.demote(ConnectionState::Connecting);
            debug!(endpoint = %shared.name, addr = %shared.addr, "Connecting");
            let connected = connect_with_timeout(&shared.addr, shared.connect_timeout)
                .and_then(|stream| Ok(owner.install(stream, shared.poll_interval)?));
            match connected {
                Ok(stream) => match shared.state.transition(ConnectionState::Connected) {
                    Ok(_) => {
                        reader = Some(stream);
                        shared.connects.fetch_add(1, Ordering::SeqCst);
                        info!(endpoint = %shared.name, addr = %shared.addr, "Connected");
                    }
                    Err(e) => {
                        debug!(endpoint = %shared.name, error = %e, "Connected while closing");
                        owner.clear();
                        break;
                    }
                },
                Err(e) => {
                    debug!(endpoint = %shared.name, error = %e, "Failed to connect");
                    shared.state.demote(ConnectionState::Disconnected);
                }
            }
        }

        if let Some(stream) = reader.as_mut() {
            match read_once(stream, &mut buf) {
                ReadOutcome::Data(payload) => {
                    if shared.quit.is_set() {
                        break;
                    }
                    debug!(endpoint = %shared.name, bytes = payload.len(), "Message received");
                    if let Err(e) = shared.responses.push(payload) {
                        debug!(endpoint = %shared.name, error = %e, "Response queue closed");
                    }
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Closed => {
                    info!(endpoint = %shared.name, "Server closed connection");
                    reader = None;
                    shared.state.demote(ConnectionState::Disconnected);
                }
                ReadOutcome::Failed(e) => {
                    warn!(endpoint = %shared.name, error = %e, "Connection lost");
                    reader = None;
                    shared.state.demote(ConnectionState::Disconnected);
                }
            }
            if shared.quit.is_set() {
                break;
            }
            if reader.is_some() && shared.state.is_connected() {
                continue;
            }
        }

        if shared.quit.wait_timeout(shared.poll_interval) {
            break;
        }
    }

    drop(reader);
    owner.clear();
    shared.state.begin_close();
    debug!(endpoint = %shared.name, "Connect loop stopped");
}

fn outbound_worker(shared: Arc<ClientShared>, outbound: QueueReceiver<Value>) {
    debug!(endpoint = %shared.name, "Outbound worker started");
    loop {
        match outbound.next(&shared.quit, shared.poll_interval) {
            Next::Item(message) => shared.deliver(message),
            Next::Idle => {
                if shared.state.is_connected() {
                    shared.flush_failed();
                }
            }
            Next::Stop => break,
        }
    }
    debug!(endpoint = %shared.name, "Outbound worker stopped");
}

fn response_worker(
    shared: Arc<ClientShared>,
    responses: QueueReceiver<Vec<u8>>,
    handler: Arc<dyn ResponseHandler>,
) {
    debug!(endpoint = %shared.name, "Response worker started");
    loop {
        match responses.next(&shared.quit, shared.poll_interval) {
            Next::Item(payload) => match InboundMessage::classify(&payload) {
                Ok(InboundMessage::Response(envelope)) => handler.on_response(envelope.response),
                Ok(InboundMessage::Other(value)) => {
                    debug!(endpoint = %shared.name, message = %value, "Ignoring non-response message");
                }
                Err(e) => warn!(endpoint = %shared.name, error = %e, "Dropping malformed message"),
            },
            Next::Idle => {}
            Next::Stop => break,
        }
    }
    debug!(endpoint = %shared.name, "Response worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            poll_interval_ms: 20,
            connect_timeout_ms: 200,
            join_timeout_ms: 2000,
            response_port: None,
            ..BridgeConfig::default()
        }
    }

    fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn ignore(_: Value) {}

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        broken: std::sync::atomic::AtomicBool,
        closes: AtomicUsize,
    }

    impl Transport for FakeTransport {
        fn send(&self, payload: &[u8]) -> std::io::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
            }
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn is_open(&self) -> bool {
            true
        }
    }

    fn shared_over(transport: Arc<FakeTransport>) -> ClientShared {
        let (outbound, _) = queue();
        let (responses, _) = queue();
        ClientShared {
            name: "test".into(),
            addr: "127.0.0.1:0".into(),
            quit: QuitSignal::new(),
            state: StateCell::new(),
            connection: transport,
            outbound,
            responses,
            failed: Arc::new(Mutex::new(FailedMessageList::default())),
            connects: AtomicUsize::new(0),
            read_buffer_size: 1024,
            poll_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_broken_pipe_parks_message_and_resends_it_first() {
        let transport = Arc::new(FakeTransport::default());
        let shared = shared_over(Arc::clone(&transport));
        shared.state.transition(ConnectionState::Connected).unwrap();

        transport.broken.store(true, Ordering::SeqCst);
        shared.deliver(json!({"n": 1}));
        assert_eq!(shared.failed().snapshot(), vec![json!({"n": 1})]);
        assert_eq!(shared.state.get(), ConnectionState::Disconnected);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);

        // Still down: later messages queue behind the parked one.
        shared.deliver(json!({"n": 2}));
        assert_eq!(shared.failed().len(), 2);

        transport.broken.store(false, Ordering::SeqCst);
        shared.state.transition(ConnectionState::Connected).unwrap();
        shared.deliver(json!({"n": 3}));
        assert!(shared.failed().is_empty());
        assert_eq!(
            *transport.sent.lock().unwrap(),
            vec![br#"{"n":1}"#.to_vec(), br#"{"n":2}"#.to_vec(), br#"{"n":3}"#.to_vec()]
        );
    }

    #[test]
    fn test_failed_flush_keeps_unsent_tail() {
        let transport = Arc::new(FakeTransport::default());
        let shared = shared_over(Arc::clone(&transport));
        shared.failed().push(json!({"n": 1}));
        shared.failed().push(json!({"n": 2}));
        shared.state.transition(ConnectionState::Connected).unwrap();

        transport.broken.store(true, Ordering::SeqCst);
        assert!(!shared.flush_failed());
        assert_eq!(shared.failed().snapshot(), vec![json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(shared.state.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_failed_list_is_fifo() {
        let mut list = FailedMessageList::default();
        list.push(json!(1));
        list.push(json!(2));
        assert_eq!(list.front(), Some(&json!(1)));
        assert_eq!(list.pop_front(), Some(json!(1)));
        assert_eq!(list.snapshot(), vec![json!(2)]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_messages_held_while_disconnected() {
        let mut client = ClientEndpoint::new("test", fast_config(), unused_port(), ignore);
        client.start().unwrap();
        client.enqueue_outbound(json!({"n": 1})).unwrap();
        client.enqueue_outbound(json!({"n": 2})).unwrap();
        for _ in 0..200 {
            if client.failed_messages().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.failed_messages(), vec![json!({"n": 1}), json!({"n": 2})]);
        assert!(!client.is_connected());
        client.stop();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.running_threads(), 0);
        assert!(matches!(
            client.enqueue_outbound(json!(3)),
            Err(BridgeError::Closed)
        ));
    }

    #[test]
    fn test_connects_and_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = ClientEndpoint::new("test", fast_config(), port, ignore);
        client.start().unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        client
            .wait_for_state(Duration::from_secs(5), |s| s == ConnectionState::Connected)
            .unwrap();
        client.enqueue_outbound(json!({"type": "txt2img"})).unwrap();

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1024];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], br#"{"type":"txt2img"}"#);
        client.stop();
    }

    #[test]
    fn test_responses_reach_handler_and_others_are_ignored() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler = move |value: Value| {
            tx.lock().unwrap().send(value).unwrap();
        };
        let mut client = ClientEndpoint::new("test", fast_config(), unused_port(), handler);
        client.start().unwrap();
        client.enqueue_inbound(b"garbage".to_vec()).unwrap();
        client.enqueue_inbound(br#"{"status":"busy"}"#.to_vec()).unwrap();
        client
            .enqueue_inbound(br#"{"response":["/tmp/a.png"]}"#.to_vec())
            .unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, json!(["/tmp/a.png"]));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        client.stop();
    }

    #[test]
    fn test_quit_releases_threads() {
        let mut client = ClientEndpoint::new("test", fast_config(), unused_port(), ignore);
        client.start().unwrap();
        client.quit();
        let quit = client.quit_signal().unwrap();
        assert!(quit.is_set());
        client.close();
        assert_eq!(client.running_threads(), 0);
        assert_eq!(
            client.thread_names(),
            vec!["test connect", "test outbound", "test responses"]
        );
    }
}
