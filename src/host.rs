//! Host-side bridge: a request client and a response client sharing one quit
//! signal and one response callback.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::client::{ClientEndpoint, ResponseHandler};
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::lifecycle::ConnectionLifecycle;
use crate::protocol::{RequestEnvelope, RequestKind};
use crate::signal::QuitSignal;
use crate::state::ConnectionState;

pub struct HostBridge {
    config: BridgeConfig,
    requests: ClientEndpoint,
    responses: Option<ClientEndpoint>,
}

impl HostBridge {
    /// `handler` receives the `response` field of every response envelope.
    /// Without a `response_port`, responses arrive on the request connection.
    pub fn new(config: BridgeConfig, handler: impl ResponseHandler + 'static) -> Self {
        let handler: Arc<dyn ResponseHandler> = Arc::new(handler);
        let requests = ClientEndpoint::with_handler(
            "requests",
            config.clone(),
            config.request_port,
            Arc::clone(&handler),
        );
        let responses = config
            .response_port
            .map(|port| ClientEndpoint::with_handler("responses", config.clone(), port, handler));
        Self {
            config,
            requests,
            responses,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn requests(&self) -> &ClientEndpoint {
        &self.requests
    }

    pub fn responses(&self) -> Option<&ClientEndpoint> {
        self.responses.as_ref()
    }

    /// Queue a generation request. It is held and resent if the worker is
    /// not reachable yet.
    pub fn submit(&self, kind: RequestKind, options: Map<String, Value>) -> Result<()> {
        self.requests.send_request(&RequestEnvelope::new(kind, options))
    }

    /// Queue an arbitrary message on the request connection.
    pub fn send(&self, message: Value) -> Result<()> {
        self.requests.enqueue_outbound(message)
    }

    pub fn is_connected(&self) -> bool {
        self.requests.is_connected()
            && self
                .responses
                .as_ref()
                .map(ClientEndpoint::is_connected)
                .unwrap_or(true)
    }

    pub fn request_state(&self) -> ConnectionState {
        self.requests.state()
    }

    /// Wait until every client is connected. Returns `false` on timeout.
    pub fn wait_until_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let connected = |client: &ClientEndpoint| {
            let left = deadline.saturating_duration_since(Instant::now());
            client
                .wait_for_state(left, |s| s == ConnectionState::Connected)
                .is_some()
        };
        connected(&self.requests) && self.responses.as_ref().map(connected).unwrap_or(true)
    }

    pub fn failed_messages(&self) -> Vec<Value> {
        self.requests.failed_messages()
    }

    pub fn quit(&self) {
        self.requests.quit();
        if let Some(client) = &self.responses {
            client.quit();
        }
    }

    pub fn close(&mut self) {
        self.stop();
    }
}

impl ConnectionLifecycle for HostBridge {
    fn start(&mut self) -> Result<()> {
        let quit = QuitSignal::new();
        self.requests.start_with(quit.clone())?;
        if let Some(client) = self.responses.as_mut() {
            if let Err(e) = client.start_with(quit) {
                self.requests.stop();
                return Err(e);
            }
        }
        info!(
            request_port = self.config.request_port,
            response_port = ?self.config.response_port,
            "Host bridge started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.requests.quit();
        if let Some(client) = self.responses.as_mut() {
            client.stop();
        }
        self.requests.stop();
    }

    fn disconnect(&self) {
        self.requests.disconnect();
        if let Some(client) = &self.responses {
            client.disconnect();
        }
    }

    fn connect(&self) {
        self.requests.connect();
        if let Some(client) = &self.responses {
            client.connect();
        }
    }
}
