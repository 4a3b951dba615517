//! Connection state shared between an endpoint's threads.

use serde::Serialize;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{BridgeError, Result};

/// Lifecycle state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    /// A connect/accept attempt is in flight.
    Connecting,
    Connected,
    /// The peer was lost and the endpoint is about to reconnect.
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether `self -> to` is a legal change.
    ///
    /// `Connected` is only reachable from a not-connected state, `Closed` only
    /// through `Closing`, and nothing leaves `Closed`.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Connected) => matches!(self, Disconnected | Connecting | Reconnecting),
            (_, Closed) => false,
            _ => true,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// Mutex-guarded [`ConnectionState`] with change notification.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<ConnectionState>,
    changed: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> ConnectionState {
        *self.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState> {
        let mut state = self.lock();
        let from = *state;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(BridgeError::InvalidTransition { from, to });
        }
        *state = to;
        self.changed.notify_all();
        Ok(from)
    }

    /// Demote to `to` unless the endpoint is already shutting down.
    ///
    /// Returns `true` if the state changed.
    pub fn demote(&self, to: ConnectionState) -> bool {
        let mut state = self.lock();
        if state.is_terminal() || *state == to {
            return false;
        }
        *state = to;
        self.changed.notify_all();
        true
    }

    /// Enter `Closing`; no-op once `Closed`.
    pub fn begin_close(&self) {
        let mut state = self.lock();
        if *state != ConnectionState::Closed {
            *state = ConnectionState::Closing;
            self.changed.notify_all();
        }
    }

    pub fn close(&self) {
        let mut state = self.lock();
        *state = ConnectionState::Closed;
        self.changed.notify_all();
    }

    /// Wait until `pred` holds or `timeout` elapses. Returns the final state.
    pub fn wait_for<F>(&self, timeout: Duration, mut pred: F) -> Option<ConnectionState>
    where
        F: FnMut(ConnectionState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if pred(*state) {
                return Some(*state);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
