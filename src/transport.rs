//! Socket plumbing shared by the server and client endpoints.
//!
//! The live peer stream sits in a [`ConnectionSlot`]. Exactly one
//! [`SlotOwner`] exists per slot and it stays on the connect/accept thread:
//! only that thread installs or drops the stream. Every other thread holds a
//! [`SharedConnection`] and may send or shut the stream down, never replace it.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Send side of a connection as seen by worker threads.
pub trait Transport: Send + Sync {
    /// Write one complete message.
    fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Shut the connection down. Closing a closed connection is a no-op.
    fn close(&self);

    fn is_open(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        (**self).send(payload)
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

#[derive(Debug, Default)]
struct SlotInner {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

/// The currently active peer stream of one endpoint, if any.
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    inner: Mutex<SlotInner>,
}

impl ConnectionSlot {
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only handle used by sender, watchdog and outbound threads.
pub type SharedConnection = Arc<ConnectionSlot>;

/// Create a slot and its single writer.
pub fn connection_slot() -> (SlotOwner, SharedConnection) {
    let slot = Arc::new(ConnectionSlot::default());
    (SlotOwner { slot: Arc::clone(&slot) }, slot)
}

impl Transport for ConnectionSlot {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut inner = self.lock();
        match inner.stream.as_mut() {
            Some(stream) => {
                stream.write_all(payload)?;
                stream.flush()
            }
            None => Err(io::Error::new(ErrorKind::NotConnected, "no connected peer")),
        }
    }

    fn close(&self) {
        if let Some(stream) = self.lock().stream.as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.lock().stream.is_some()
    }
}

impl ConnectionSlot {
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer
    }
}

/// Exclusive writer of a [`ConnectionSlot`]. Not `Clone`.
#[derive(Debug)]
pub struct SlotOwner {
    slot: SharedConnection,
}

impl SlotOwner {
    /// Install a freshly connected stream.
    ///
    /// The slot keeps a clone for writers; the returned stream is the reader
    /// used by the owning thread's receive loop.
    pub fn install(&self, stream: TcpStream, read_timeout: Duration) -> io::Result<TcpStream> {
        // Accepted streams inherit O_NONBLOCK from the listener on BSDs.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(read_timeout.max(Duration::from_secs(1))))?;
        let peer = stream.peer_addr().ok();
        let writer = stream.try_clone()?;
        let mut inner = self.slot.lock();
        if let Some(old) = inner.stream.take() {
            let _ = old.shutdown(Shutdown::Both);
        }
        inner.stream = Some(writer);
        inner.peer = peer;
        Ok(stream)
    }

    /// Shut down and drop the current stream. Idempotent.
    pub fn clear(&self) {
        let mut inner = self.slot.lock();
        if let Some(stream) = inner.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        inner.peer = None;
    }

    pub fn shared(&self) -> SharedConnection {
        Arc::clone(&self.slot)
    }
}

impl Drop for SlotOwner {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Outcome of one bounded read.
#[derive(Debug)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// The receive timeout elapsed with nothing to read.
    Idle,
    /// The peer closed its end.
    Closed,
    Failed(io::Error),
}

/// Perform one bounded read of at most `buf.len()` bytes.
pub fn read_once(stream: &mut TcpStream, buf: &mut [u8]) -> ReadOutcome {
    match stream.read(buf) {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => ReadOutcome::Data(buf[..n].to_vec()),
        Err(e) if is_timeout(&e) => ReadOutcome::Idle,
        Err(e) if e.kind() == ErrorKind::Interrupted => ReadOutcome::Idle,
        Err(e) => ReadOutcome::Failed(e),
    }
}

/// Open a client stream with a bounded connect phase.
pub fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let resolved = resolve(addr)?;
    let mut last_err = None;
    for candidate in resolved {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) if is_timeout(&e) => return Err(BridgeError::Timeout(timeout)),
            Err(e) => last_err = Some(e),
        }
    }
    Err(BridgeError::Connection {
        addr: addr.to_string(),
        source: last_err
            .unwrap_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "no address")),
    })
}

/// Bind a non-blocking listener so accept can be polled against the quit signal.
pub fn bind_listener(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).map_err(|source| BridgeError::Connection {
        addr: addr.to_string(),
        source,
    })?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn resolve(addr: &str) -> Result<Vec<SocketAddr>> {
    addr.to_socket_addrs()
        .map(|iter| iter.collect())
        .map_err(|source| BridgeError::Connection {
            addr: addr.to_string(),
            source,
        })
}

/// Broken-pipe class: the peer is gone and the connection must be reset.
pub fn is_broken_pipe(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
