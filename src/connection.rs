//! # Connection state machine
//!
//! One [`Connection`] holds everything the stack's notification handlers and
//! the bridge's blocking operations share: the active peer handle, the
//! inbound FIFO, the `connected` / `awaiting-connect` flags and the
//! acknowledgement counter.
//!
//! ```text
//!            listen                 accepted
//!   Idle ───────────► Listening ─────────────► Connected
//!    │                    ▲                       │
//!    │ connect            │  remote close/reset   │ unexpected error
//!    ▼                    └───────────────────────┤
//! Connecting ──connected──► Connected             ▼
//!                                              Errored ──accept/connect──► …
//! ```
//!
//! Flags are single-word atomics so handlers never block on a lock the
//! foreground code might hold across a suspension point. The peer slot and
//! the inbound buffer each sit behind their own short-lived mutex; neither is
//! ever held while calling into the stack, and neither is the mapping lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::stack::{EventCallback, NetworkStack, PeerHandle, StackError, StackEvent};

/// Re-check interval of every blocking wait
pub const WAIT_QUANTUM: Duration = Duration::from_millis(1);

/// What to do when an inbound segment does not fit the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Abort the connection and fail the next receive with `BufferOverflow`
    #[default]
    Disconnect,
    /// Keep what fits, drop the rest and carry on
    Truncate,
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Listening = 1,
    Connecting = 2,
    Connected = 3,
    Closing = 4,
    Errored = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Listening,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Closing,
            5 => ConnectionState::Errored,
            _ => ConnectionState::Idle,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Fixed-capacity FIFO filled by receive notifications
#[derive(Debug)]
pub struct InboundBuffer {
    data: BytesMut,
    capacity: usize,
    overflow: Option<usize>,
}

impl InboundBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            overflow: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append as much of `chunk` as fits; returns the number of bytes dropped
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        let room = self.capacity - self.data.len();
        let taken = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..taken]);
        chunk.len() - taken
    }

    /// Move the oldest bytes into `out`; returns how many were copied
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        n
    }

    /// Discard everything; returns the number of bytes discarded
    pub fn clear(&mut self) -> usize {
        let n = self.data.len();
        self.data.clear();
        n
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub connections: u64,
    pub bytes_sent: u64,
    pub bytes_acknowledged: u64,
    pub bytes_received: u64,
    pub remote_resets: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub overflows: u64,
    pub rejected_accepts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TransportCounters {
    pub connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_acknowledged: AtomicU64,
    pub bytes_received: AtomicU64,
    pub remote_resets: AtomicU64,
    pub errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub overflows: AtomicU64,
    pub rejected_accepts: AtomicU64,
}

impl TransportCounters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TransportStats {
            connections: get(&self.connections),
            bytes_sent: get(&self.bytes_sent),
            bytes_acknowledged: get(&self.bytes_acknowledged),
            bytes_received: get(&self.bytes_received),
            remote_resets: get(&self.remote_resets),
            errors: get(&self.errors),
            timeouts: get(&self.timeouts),
            overflows: get(&self.overflows),
            rejected_accepts: get(&self.rejected_accepts),
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-connection state shared between notification handlers and the bridge
pub struct Connection {
    stack: Arc<dyn NetworkStack>,
    state: AtomicU8,
    listening: AtomicBool,
    connected: AtomicBool,
    awaiting_connect: AtomicBool,
    acknowledged: AtomicUsize,
    peer: Mutex<Option<PeerHandle>>,
    inbound: Mutex<InboundBuffer>,
    last_error: Mutex<Option<StackError>>,
    signal: Notify,
    overflow_policy: OverflowPolicy,
    pub(crate) counters: TransportCounters,
}

impl Connection {
    pub fn new(stack: Arc<dyn NetworkStack>, capacity: usize, overflow_policy: OverflowPolicy) -> Arc<Self> {
        Arc::new(Self {
            stack,
            state: AtomicU8::new(ConnectionState::Idle as u8),
            listening: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            awaiting_connect: AtomicBool::new(false),
            acknowledged: AtomicUsize::new(0),
            peer: Mutex::new(None),
            inbound: Mutex::new(InboundBuffer::with_capacity(capacity)),
            last_error: Mutex::new(None),
            signal: Notify::new(),
            overflow_policy,
            counters: TransportCounters::default(),
        })
    }

    /// Callback to register with the stack
    ///
    /// Holds only a weak reference so a stack outliving the connection does
    /// not keep it alive.
    pub fn event_callback(self: &Arc<Self>) -> EventCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(connection) = weak.upgrade() {
                connection.handle_event(event);
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_awaiting_connect(&self) -> bool {
        self.awaiting_connect.load(Ordering::SeqCst)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn acknowledged(&self) -> usize {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub fn active_peer(&self) -> Option<PeerHandle> {
        *locked(&self.peer)
    }

    pub fn has_inbound(&self) -> bool {
        !locked(&self.inbound).is_empty()
    }

    pub fn inbound_len(&self) -> usize {
        locked(&self.inbound).len()
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            trace!("Connection state {} -> {}", previous, state);
        }
    }

    /// State to fall back to once the active peer is gone
    fn resting_state(&self) -> ConnectionState {
        if self.is_listening() {
            ConnectionState::Listening
        } else {
            ConnectionState::Idle
        }
    }

    /// Suspend until `cond` holds or `deadline` passes
    ///
    /// Returns whether the condition holds. The condition is re-checked on
    /// every notification and at least once per [`WAIT_QUANTUM`].
    pub async fn wait_until<F>(&self, deadline: Option<Instant>, cond: F) -> bool
    where
        F: Fn(&Connection) -> bool,
    {
        loop {
            let notified = self.signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cond(self) {
                return true;
            }

            let quantum = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(WAIT_QUANTUM)
                }
                None => WAIT_QUANTUM,
            };
            let _ = tokio::time::timeout(quantum, notified).await;
        }
    }

    // ---------------------------------------------------------------
    // Notification handlers
    // ---------------------------------------------------------------

    /// Entry point for every stack notification
    pub fn handle_event(&self, event: StackEvent) {
        match event {
            StackEvent::Accepted(Ok(peer)) => self.on_accepted(peer),
            StackEvent::Accepted(Err(err)) => warn!("Failure in accept: {}", err),
            StackEvent::Connected(peer) => self.on_connected(peer),
            StackEvent::Sent(peer, len) => self.on_sent(peer, len),
            StackEvent::Received(peer, Some(data)) => self.on_received(peer, &data),
            StackEvent::Received(peer, None) => self.on_remote_closed(peer),
            StackEvent::Error(peer, err) => self.on_error(peer, err),
            StackEvent::Poll(peer) => trace!("Poll on {}", peer),
        }
        self.signal.notify_waiters();
    }

    fn on_accepted(&self, peer: PeerHandle) {
        {
            let mut slot = locked(&self.peer);
            if let Some(current) = *slot {
                drop(slot);
                warn!("Rejecting {}: {} is still active", peer, current);
                TransportCounters::bump(&self.counters.rejected_accepts, 1);
                self.stack.abort(peer);
                return;
            }
            *slot = Some(peer);
        }

        locked(&self.inbound).clear();
        *locked(&self.last_error) = None;
        self.acknowledged.store(0, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        TransportCounters::bump(&self.counters.connections, 1);
        info!("Client connected ({})", peer);
    }

    fn on_connected(&self, peer: PeerHandle) {
        let adopted = {
            let mut slot = locked(&self.peer);
            let adopt = self.is_awaiting_connect() && slot.map_or(true, |current| current == peer);
            if adopt {
                *slot = Some(peer);
                self.connected.store(true, Ordering::SeqCst);
                self.awaiting_connect.store(false, Ordering::SeqCst);
            }
            adopt
        };

        if adopted {
            self.set_state(ConnectionState::Connected);
            TransportCounters::bump(&self.counters.connections, 1);
            debug!("Connected ({})", peer);
        } else {
            debug!("Dropping stale connection {}", peer);
            self.stack.abort(peer);
        }
    }

    fn on_sent(&self, peer: PeerHandle, len: usize) {
        if self.active_peer() != Some(peer) {
            return;
        }
        trace!("{} byte(s) acknowledged on {}", len, peer);
        self.acknowledged.fetch_add(len, Ordering::SeqCst);
        TransportCounters::bump(&self.counters.bytes_acknowledged, len as u64);
    }

    fn on_received(&self, peer: PeerHandle, data: &[u8]) {
        if self.active_peer() != Some(peer) {
            debug!("Ignoring {} byte(s) from inactive {}", data.len(), peer);
            return;
        }
        TransportCounters::bump(&self.counters.bytes_received, data.len() as u64);

        let overflowed = {
            let mut inbound = locked(&self.inbound);
            let dropped = inbound.append(data);
            trace!("recv_len: {}, chunk: {}", inbound.len(), data.len());
            if dropped == 0 {
                false
            } else {
                TransportCounters::bump(&self.counters.overflows, 1);
                match self.overflow_policy {
                    OverflowPolicy::Truncate => {
                        warn!("Inbound buffer full, {} byte(s) dropped", dropped);
                        false
                    }
                    OverflowPolicy::Disconnect => {
                        inbound.clear();
                        inbound.overflow = Some(dropped);
                        true
                    }
                }
            }
        };

        if overflowed {
            warn!("Inbound buffer overflow on {}, dropping the connection", peer);
            self.release_peer(true, ConnectionState::Errored);
        }
    }

    fn on_remote_closed(&self, peer: PeerHandle) {
        if self.active_peer() != Some(peer) {
            return;
        }
        debug!("Remote closed {}", peer);
        self.release_peer(false, self.resting_state());
    }

    fn on_error(&self, peer: PeerHandle, err: StackError) {
        let mut slot = locked(&self.peer);
        let was_connecting = self.is_awaiting_connect();
        let was_active = *slot == Some(peer);
        if !was_connecting && !was_active {
            debug!("Ignoring {} on inactive {}", err, peer);
            return;
        }

        // The stack has already released the peer.
        if was_active {
            *slot = None;
        }
        self.connected.store(false, Ordering::SeqCst);

        if err.is_remote_reset() {
            TransportCounters::bump(&self.counters.remote_resets, 1);
            debug!("{} reset by remote: {}", peer, err);
            if was_connecting {
                *locked(&self.last_error) = Some(err);
            }
            self.set_state(self.resting_state());
        } else {
            TransportCounters::bump(&self.counters.errors, 1);
            error!("Transport error on {}: {}", peer, err);
            *locked(&self.last_error) = Some(err);
            self.set_state(ConnectionState::Errored);
        }

        self.awaiting_connect.store(false, Ordering::SeqCst);
    }

    // ---------------------------------------------------------------
    // Transitions requested by the bridge
    // ---------------------------------------------------------------

    pub(crate) fn start_listening(&self) {
        self.listening.store(true, Ordering::SeqCst);
        if !self.is_connected() {
            self.set_state(ConnectionState::Listening);
        }
    }

    pub(crate) fn begin_connect(&self) {
        locked(&self.inbound).clear();
        *locked(&self.last_error) = None;
        self.acknowledged.store(0, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.awaiting_connect.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
    }

    /// Remember the handle of an attempt the stack has not completed yet
    pub(crate) fn register_connecting_peer(&self, peer: PeerHandle) {
        let mut slot = locked(&self.peer);
        if self.is_awaiting_connect() && slot.is_none() {
            *slot = Some(peer);
        }
    }

    pub(crate) fn abandon_connect(&self, err: StackError) {
        *locked(&self.last_error) = Some(err);
        self.awaiting_connect.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Errored);
        self.signal.notify_waiters();
    }

    pub(crate) fn fail_peer(&self, err: StackError) {
        *locked(&self.last_error) = Some(err);
        TransportCounters::bump(&self.counters.errors, 1);
        self.release_peer(true, ConnectionState::Errored);
    }

    pub(crate) fn reset_acknowledged(&self) {
        self.acknowledged.store(0, Ordering::SeqCst);
    }

    /// Tear down the active peer, if any
    pub(crate) fn release_peer(&self, abort: bool, next: ConnectionState) {
        let peer = locked(&self.peer).take();
        self.connected.store(false, Ordering::SeqCst);
        self.awaiting_connect.store(false, Ordering::SeqCst);

        if let Some(peer) = peer {
            if abort {
                self.stack.abort(peer);
            } else if let Err(err) = self.stack.close(peer) {
                debug!("Close of {} failed ({}), aborting", peer, err);
                self.stack.abort(peer);
            }
        }
        self.set_state(next);
        self.signal.notify_waiters();
    }

    pub(crate) fn shutdown(&self) {
        self.set_state(ConnectionState::Closing);
        self.listening.store(false, Ordering::SeqCst);
        self.release_peer(false, ConnectionState::Idle);
    }

    pub(crate) fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    pub(crate) fn drain_inbound(&self, out: &mut [u8]) -> usize {
        locked(&self.inbound).drain_into(out)
    }

    pub(crate) fn clear_inbound(&self) -> usize {
        locked(&self.inbound).clear()
    }

    pub(crate) fn take_overflow(&self) -> Option<usize> {
        locked(&self.inbound).overflow.take()
    }

    pub(crate) fn take_last_error(&self) -> Option<StackError> {
        locked(&self.last_error).take()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .field("awaiting_connect", &self.is_awaiting_connect())
            .field("peer", &self.active_peer())
            .field("inbound", &self.inbound_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::LoopbackStack;

    fn listening_connection(policy: OverflowPolicy) -> (Arc<Connection>, LoopbackStack) {
        let stack = LoopbackStack::new();
        let connection = Connection::new(Arc::new(stack.clone()), 8, policy);
        stack.listen(502, 1, connection.event_callback()).unwrap();
        connection.start_listening();
        (connection, stack)
    }

    #[test]
    fn test_inbound_buffer_fifo() {
        let mut buffer = InboundBuffer::with_capacity(6);
        assert_eq!(buffer.append(&[1, 2, 3, 4]), 0);
        assert_eq!(buffer.append(&[5, 6, 7]), 1);
        assert_eq!(buffer.len(), 6);

        let mut out = [0u8; 4];
        assert_eq!(buffer.drain_into(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);

        let mut out = [0u8; 4];
        assert_eq!(buffer.drain_into(&mut out), 2);
        assert_eq!(&out[..2], &[5, 6]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_accept_sets_connected() {
        let (connection, stack) = listening_connection(OverflowPolicy::Disconnect);
        assert_eq!(connection.state(), ConnectionState::Listening);

        let peer = stack.remote_connect().unwrap();
        assert!(connection.is_connected());
        assert_eq!(connection.active_peer(), Some(peer));
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_second_accept_is_rejected() {
        let (connection, stack) = listening_connection(OverflowPolicy::Disconnect);
        let first = stack.remote_connect().unwrap();
        let second = stack.remote_connect().unwrap();

        assert_eq!(connection.active_peer(), Some(first));
        assert!(stack.is_closed(second));
        assert_eq!(connection.stats().rejected_accepts, 1);
    }

    #[test]
    fn test_remote_reset_cycles_back_to_listening() {
        let (connection, stack) = listening_connection(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();

        stack.remote_error(peer, StackError::Reset);
        assert!(!connection.is_connected());
        assert_eq!(connection.active_peer(), None);
        assert_eq!(connection.state(), ConnectionState::Listening);
        assert_eq!(connection.take_last_error(), None);
        assert_eq!(connection.stats().remote_resets, 1);
    }

    #[test]
    fn test_unexpected_error_is_recorded() {
        let (connection, stack) = listening_connection(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();

        stack.remote_error(peer, StackError::Memory);
        assert_eq!(connection.state(), ConnectionState::Errored);
        assert_eq!(connection.take_last_error(), Some(StackError::Memory));
        assert_eq!(connection.stats().errors, 1);
    }

    #[test]
    fn test_overflow_disconnects_by_default() {
        let (connection, stack) = listening_connection(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();

        stack.remote_send(peer, &[0; 6]);
        stack.remote_send(peer, &[0; 6]);
        assert!(!connection.is_connected());
        assert!(stack.is_closed(peer));
        assert_eq!(connection.inbound_len(), 0);
        assert_eq!(connection.take_overflow(), Some(4));
    }

    #[test]
    fn test_overflow_truncates_when_configured() {
        let (connection, stack) = listening_connection(OverflowPolicy::Truncate);
        let peer = stack.remote_connect().unwrap();

        stack.remote_send(peer, &[1; 6]);
        stack.remote_send(peer, &[2; 6]);
        assert!(connection.is_connected());
        assert_eq!(connection.inbound_len(), 8);
        assert_eq!(connection.take_overflow(), None);
        assert_eq!(connection.stats().overflows, 1);
    }

    #[test]
    fn test_events_for_inactive_peer_are_ignored() {
        let (connection, stack) = listening_connection(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();

        connection.handle_event(StackEvent::Received(PeerHandle(999), Some(bytes::Bytes::from_static(&[1]))));
        connection.handle_event(StackEvent::Error(PeerHandle(999), StackError::Memory));
        assert!(connection.is_connected());
        assert_eq!(connection.active_peer(), Some(peer));
        assert_eq!(connection.inbound_len(), 0);
    }

    #[tokio::test]
    async fn test_wait_until_respects_deadline() {
        let (connection, _stack) = listening_connection(OverflowPolicy::Disconnect);
        let start = Instant::now();
        let ready = connection
            .wait_until(Some(Instant::now() + Duration::from_millis(20)), |c| c.is_connected())
            .await;
        assert!(!ready);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
