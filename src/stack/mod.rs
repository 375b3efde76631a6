//! # Non-blocking network stack interface
//!
//! The bridge runs on top of a TCP stack that never blocks: every operation
//! returns immediately and its outcome arrives later through an
//! [`EventCallback`]. This mirrors raw-API embedded stacks where callbacks
//! fire from the network interrupt/driver context.
//!
//! Minimum feature set a stack must offer:
//!
//! | Operation | Outcome notification |
//! |---|---|
//! | [`NetworkStack::listen`] | [`StackEvent::Accepted`] per incoming client |
//! | [`NetworkStack::connect`] | [`StackEvent::Connected`] or [`StackEvent::Error`] |
//! | [`NetworkStack::write`] | [`StackEvent::Sent`] with the bytes actually flushed |
//! | (remote data) | [`StackEvent::Received`] in arbitrary-sized chunks, `None` on remote close |
//! | (fault) | [`StackEvent::Error`], distinguishing remote reset from other faults |
//! | [`NetworkStack::close`] / [`NetworkStack::abort`] | none |
//!
//! After an [`StackEvent::Error`] the stack has already released the peer;
//! callers must not close it again.

pub mod loopback;
pub mod tokio_stack;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

pub use loopback::LoopbackStack;
pub use tokio_stack::TokioStack;

/// Opaque handle of an active (accepted or connecting) endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub u32);

/// Opaque handle of a listening endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(pub u32);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Error codes reported by the stack
///
/// The set follows the classic embedded TCP/IP error list.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackError {
    #[error("out of memory")]
    Memory,
    #[error("buffer error")]
    Buffer,
    #[error("timeout")]
    Timeout,
    #[error("routing problem")]
    Routing,
    #[error("operation in progress")]
    InProgress,
    #[error("illegal value")]
    Value,
    #[error("operation would block")]
    WouldBlock,
    #[error("address in use")]
    InUse,
    #[error("already connecting")]
    Already,
    #[error("already connected")]
    IsConnected,
    #[error("not connected")]
    NotConnected,
    #[error("low-level netif error")]
    Interface,
    #[error("connection aborted")]
    Aborted,
    #[error("connection reset")]
    Reset,
    #[error("connection closed")]
    Closed,
    #[error("illegal argument")]
    Argument,
}

impl StackError {
    /// Remote resets and aborts are the expected way a client goes away
    pub fn is_remote_reset(self) -> bool {
        matches!(self, StackError::Reset | StackError::Aborted)
    }

    /// Map an OS socket error onto the stack's error set
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused => StackError::Reset,
            ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => StackError::Aborted,
            ErrorKind::NotConnected => StackError::NotConnected,
            ErrorKind::AddrInUse => StackError::InUse,
            ErrorKind::AddrNotAvailable => StackError::Routing,
            ErrorKind::TimedOut => StackError::Timeout,
            ErrorKind::WouldBlock => StackError::WouldBlock,
            ErrorKind::InvalidInput => StackError::Argument,
            ErrorKind::OutOfMemory => StackError::Memory,
            _ => StackError::Interface,
        }
    }
}

/// Asynchronous completion notifications delivered by the stack
#[derive(Debug, Clone, PartialEq)]
pub enum StackEvent {
    /// A client connected to the listener (or accepting failed)
    Accepted(Result<PeerHandle, StackError>),
    /// An outgoing connection attempt completed
    Connected(PeerHandle),
    /// The remote acknowledged `len` bytes of previously written data
    Sent(PeerHandle, usize),
    /// Data arrived; `None` means the remote closed its side
    Received(PeerHandle, Option<Bytes>),
    /// A fatal error occurred; the stack has already released the peer
    Error(PeerHandle, StackError),
    /// Periodic poll while the connection is idle
    Poll(PeerHandle),
}

impl StackEvent {
    /// Peer the event refers to, if any
    pub fn peer(&self) -> Option<PeerHandle> {
        match self {
            StackEvent::Accepted(result) => result.ok(),
            StackEvent::Connected(peer)
            | StackEvent::Sent(peer, _)
            | StackEvent::Received(peer, _)
            | StackEvent::Error(peer, _)
            | StackEvent::Poll(peer) => Some(*peer),
        }
    }
}

/// Callback the stack invokes for every notification
///
/// May run on any thread, concurrently with the bridge's own operations.
pub type EventCallback = Arc<dyn Fn(StackEvent) + Send + Sync>;

/// Non-blocking TCP stack
///
/// Every method returns immediately. Outcomes are reported through the
/// callback registered on `listen` or `connect`.
pub trait NetworkStack: Send + Sync {
    /// Bind to `port` on all interfaces and start listening
    ///
    /// Port 0 picks an ephemeral port, see [`NetworkStack::local_addr`].
    fn listen(&self, port: u16, backlog: u8, events: EventCallback) -> Result<ListenerHandle, StackError>;

    /// Start connecting to `address`
    fn connect(&self, address: SocketAddr, events: EventCallback) -> Result<PeerHandle, StackError>;

    /// Queue `data` for transmission; acknowledgement arrives as [`StackEvent::Sent`]
    fn write(&self, peer: PeerHandle, data: &[u8]) -> Result<(), StackError>;

    /// Gracefully close an active endpoint and drop its callbacks
    fn close(&self, peer: PeerHandle) -> Result<(), StackError>;

    /// Forcefully abort an active endpoint; never fails
    fn abort(&self, peer: PeerHandle);

    /// Stop listening and drop the listener's callbacks
    fn close_listener(&self, listener: ListenerHandle) -> Result<(), StackError>;

    /// Address a listener is bound to
    fn local_addr(&self, listener: ListenerHandle) -> Option<SocketAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_reset_classification() {
        assert!(StackError::Reset.is_remote_reset());
        assert!(StackError::Aborted.is_remote_reset());
        assert!(!StackError::Memory.is_remote_reset());
        assert!(!StackError::Closed.is_remote_reset());
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(StackError::from_io(&err), StackError::Reset);

        let err = std::io::Error::from(std::io::ErrorKind::AddrInUse);
        assert_eq!(StackError::from_io(&err), StackError::InUse);
    }

    #[test]
    fn test_event_peer() {
        let peer = PeerHandle(3);
        assert_eq!(StackEvent::Sent(peer, 4).peer(), Some(peer));
        assert_eq!(StackEvent::Accepted(Err(StackError::Memory)).peer(), None);
    }
}
