//! Scripted in-memory stack
//!
//! [`LoopbackStack`] plays the remote side of every connection: tests call
//! `remote_*` methods to make a client connect, deliver bytes, close, reset or
//! fault, and inspect what the bridge wrote. Notifications are delivered
//! synchronously from the calling thread, the same way an interrupt handler
//! would pre-empt the foreground code.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use super::{EventCallback, ListenerHandle, NetworkStack, PeerHandle, StackError, StackEvent};

/// Outcome of the next outgoing connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Report `Connected` immediately
    Accept,
    /// Report an error notification immediately
    Fail(StackError),
    /// Leave the attempt pending until [`LoopbackStack::remote_complete_connect`]
    Defer,
}

#[derive(Default)]
struct PeerState {
    written: Vec<u8>,
    closed: bool,
}

struct LoopbackState {
    next_handle: u32,
    listener: Option<(ListenerHandle, u16, EventCallback)>,
    peers: HashMap<PeerHandle, (EventCallback, PeerState)>,
    pending_connect: Option<(PeerHandle, EventCallback)>,
    connect_outcome: ConnectOutcome,
    ack_chunk: Option<usize>,
    auto_ack: bool,
    fail_listen: Option<StackError>,
}

/// In-memory [`NetworkStack`] for tests
#[derive(Clone)]
pub struct LoopbackStack {
    state: Arc<Mutex<LoopbackState>>,
}

impl Default for LoopbackStack {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackStack {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                next_handle: 0,
                listener: None,
                peers: HashMap::new(),
                pending_connect: None,
                connect_outcome: ConnectOutcome::Accept,
                ack_chunk: None,
                auto_ack: true,
                fail_listen: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn allocate(state: &mut LoopbackState) -> u32 {
        state.next_handle += 1;
        state.next_handle
    }

    /// Acknowledge writes in chunks of at most `chunk` bytes
    pub fn set_ack_chunk(&self, chunk: Option<usize>) {
        self.state().ack_chunk = chunk;
    }

    /// Disable automatic acknowledgements; use [`LoopbackStack::remote_ack`]
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state().auto_ack = enabled;
    }

    pub fn set_connect_outcome(&self, outcome: ConnectOutcome) {
        self.state().connect_outcome = outcome;
    }

    /// Make the next `listen` fail with `error`
    pub fn fail_next_listen(&self, error: StackError) {
        self.state().fail_listen = Some(error);
    }

    pub fn is_listening(&self) -> bool {
        self.state().listener.is_some()
    }

    /// A client connects to the listener
    pub fn remote_connect(&self) -> Option<PeerHandle> {
        let (peer, callback) = {
            let mut state = self.state();
            let callback = state.listener.as_ref().map(|(_, _, cb)| Arc::clone(cb))?;
            let peer = PeerHandle(Self::allocate(&mut state));
            state.peers.insert(peer, (Arc::clone(&callback), PeerState::default()));
            (peer, callback)
        };
        callback(StackEvent::Accepted(Ok(peer)));
        Some(peer)
    }

    /// Complete a deferred outgoing connection attempt
    pub fn remote_complete_connect(&self, outcome: Result<(), StackError>) -> Option<PeerHandle> {
        let (peer, callback) = self.state().pending_connect.take()?;
        match outcome {
            Ok(()) => {
                self.state()
                    .peers
                    .insert(peer, (Arc::clone(&callback), PeerState::default()));
                callback(StackEvent::Connected(peer));
            }
            Err(err) => callback(StackEvent::Error(peer, err)),
        }
        Some(peer)
    }

    /// Deliver a chunk of bytes from the remote side
    pub fn remote_send(&self, peer: PeerHandle, data: &[u8]) {
        if let Some(callback) = self.callback(peer) {
            callback(StackEvent::Received(peer, Some(Bytes::copy_from_slice(data))));
        }
    }

    /// The remote side closes gracefully
    pub fn remote_close(&self, peer: PeerHandle) {
        if let Some(callback) = self.callback(peer) {
            callback(StackEvent::Received(peer, None));
        }
    }

    /// A fatal error hits the connection; the peer is released first
    pub fn remote_error(&self, peer: PeerHandle, err: StackError) {
        let callback = self.state().peers.remove(&peer).map(|(cb, _)| cb);
        if let Some(callback) = callback {
            callback(StackEvent::Error(peer, err));
        }
    }

    /// Acknowledge `len` bytes manually
    pub fn remote_ack(&self, peer: PeerHandle, len: usize) {
        if let Some(callback) = self.callback(peer) {
            callback(StackEvent::Sent(peer, len));
        }
    }

    /// Deliver a poll notification
    pub fn remote_poll(&self, peer: PeerHandle) {
        if let Some(callback) = self.callback(peer) {
            callback(StackEvent::Poll(peer));
        }
    }

    /// Drain everything the bridge wrote to `peer`
    pub fn take_written(&self, peer: PeerHandle) -> Vec<u8> {
        self.state()
            .peers
            .get_mut(&peer)
            .map(|(_, p)| std::mem::take(&mut p.written))
            .unwrap_or_default()
    }

    /// Whether the bridge closed or aborted `peer`
    pub fn is_closed(&self, peer: PeerHandle) -> bool {
        self.state().peers.get(&peer).map_or(true, |(_, p)| p.closed)
    }

    fn callback(&self, peer: PeerHandle) -> Option<EventCallback> {
        self.state()
            .peers
            .get(&peer)
            .filter(|(_, p)| !p.closed)
            .map(|(cb, _)| Arc::clone(cb))
    }
}

impl NetworkStack for LoopbackStack {
    fn listen(&self, port: u16, _backlog: u8, events: EventCallback) -> Result<ListenerHandle, StackError> {
        let mut state = self.state();
        if let Some(err) = state.fail_listen.take() {
            return Err(err);
        }
        if state.listener.is_some() {
            return Err(StackError::InUse);
        }
        let handle = ListenerHandle(Self::allocate(&mut state));
        state.listener = Some((handle, port, events));
        Ok(handle)
    }

    fn connect(&self, _address: SocketAddr, events: EventCallback) -> Result<PeerHandle, StackError> {
        let (peer, outcome) = {
            let mut state = self.state();
            let peer = PeerHandle(Self::allocate(&mut state));
            match state.connect_outcome {
                ConnectOutcome::Accept => {
                    state.peers.insert(peer, (Arc::clone(&events), PeerState::default()));
                }
                ConnectOutcome::Defer => {
                    state.pending_connect = Some((peer, Arc::clone(&events)));
                }
                ConnectOutcome::Fail(_) => {}
            }
            (peer, state.connect_outcome)
        };

        match outcome {
            ConnectOutcome::Accept => events(StackEvent::Connected(peer)),
            ConnectOutcome::Fail(err) => events(StackEvent::Error(peer, err)),
            ConnectOutcome::Defer => {}
        }
        Ok(peer)
    }

    fn write(&self, peer: PeerHandle, data: &[u8]) -> Result<(), StackError> {
        let (callback, acks) = {
            let mut state = self.state();
            let ack_chunk = state.ack_chunk;
            let auto_ack = state.auto_ack;
            let (callback, peer_state) = state.peers.get_mut(&peer).ok_or(StackError::NotConnected)?;
            if peer_state.closed {
                return Err(StackError::Closed);
            }
            peer_state.written.extend_from_slice(data);

            let acks: Vec<usize> = match (auto_ack, ack_chunk) {
                (false, _) => Vec::new(),
                (true, Some(chunk)) if chunk > 0 => data.chunks(chunk).map(<[u8]>::len).collect(),
                (true, _) => vec![data.len()],
            };
            (Arc::clone(callback), acks)
        };

        for len in acks {
            callback(StackEvent::Sent(peer, len));
        }
        Ok(())
    }

    fn close(&self, peer: PeerHandle) -> Result<(), StackError> {
        let mut state = self.state();
        if matches!(&state.pending_connect, Some((pending, _)) if *pending == peer) {
            state.pending_connect = None;
            return Ok(());
        }
        match state.peers.get_mut(&peer) {
            Some((_, p)) if !p.closed => {
                p.closed = true;
                Ok(())
            }
            _ => Err(StackError::NotConnected),
        }
    }

    fn abort(&self, peer: PeerHandle) {
        let _ = self.close(peer);
    }

    fn close_listener(&self, listener: ListenerHandle) -> Result<(), StackError> {
        let mut state = self.state();
        match state.listener.take() {
            Some((handle, _, _)) if handle == listener => Ok(()),
            other => {
                state.listener = other;
                Err(StackError::Argument)
            }
        }
    }

    fn local_addr(&self, listener: ListenerHandle) -> Option<SocketAddr> {
        match &self.state().listener {
            Some((handle, port, _)) if *handle == listener => Some(SocketAddr::from(([127, 0, 0, 1], *port))),
            _ => None,
        }
    }
}
