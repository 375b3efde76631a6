//! Non-blocking TCP stack backed by tokio sockets
//!
//! Each socket is driven by background tasks that report every outcome
//! through the registered [`EventCallback`], so upper layers see the same
//! callback-only contract an embedded raw-API stack offers. A write counts as
//! acknowledged once tokio has handed all of it to the kernel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{EventCallback, ListenerHandle, NetworkStack, PeerHandle, StackError, StackEvent};
use crate::error::{ModbusError, ModbusResult};

/// Largest chunk handed to a single receive notification
const READ_CHUNK_SIZE: usize = 1460;

struct PeerEntry {
    writer: mpsc::UnboundedSender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerEntry {
    fn abort_tasks(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct ListenerEntry {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct StackInner {
    next_handle: AtomicU32,
    peers: Mutex<HashMap<PeerHandle, PeerEntry>>,
    connecting: Mutex<HashMap<PeerHandle, JoinHandle<()>>>,
    listeners: Mutex<HashMap<ListenerHandle, ListenerEntry>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StackInner {
    fn allocate(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register the write side of a fresh connection
    ///
    /// The read half is handed back so the caller can start reading only
    /// after the peer has been announced.
    fn attach(self: &Arc<Self>, peer: PeerHandle, stream: TcpStream, events: EventCallback) -> OwnedReadHalf {
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let inner = Arc::clone(self);
        let write_task = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                match writer.write_all(&data).await {
                    Ok(()) => events(StackEvent::Sent(peer, data.len())),
                    Err(e) => {
                        inner.fail(peer, StackError::from_io(&e), &events);
                        break;
                    }
                }
            }
        });

        locked(&self.peers).insert(peer, PeerEntry { writer: tx, tasks: vec![write_task] });
        reader
    }

    fn start_reading(self: &Arc<Self>, peer: PeerHandle, mut reader: OwnedReadHalf, events: EventCallback) {
        let inner = Arc::clone(self);
        let read_task = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        events(StackEvent::Received(peer, None));
                        break;
                    }
                    Ok(n) => events(StackEvent::Received(peer, Some(Bytes::copy_from_slice(&buf[..n])))),
                    Err(e) => {
                        inner.fail(peer, StackError::from_io(&e), &events);
                        break;
                    }
                }
            }
        });

        match locked(&self.peers).get_mut(&peer) {
            Some(entry) => entry.tasks.push(read_task),
            // closed before it was announced
            None => read_task.abort(),
        }
    }

    /// Release `peer`, then report `err`
    ///
    /// Callers of an error notification rely on the peer being gone.
    fn fail(&self, peer: PeerHandle, err: StackError, events: &EventCallback) {
        self.release(peer);
        events(StackEvent::Error(peer, err));
    }

    fn release(&self, peer: PeerHandle) -> bool {
        if let Some(entry) = locked(&self.peers).remove(&peer) {
            entry.abort_tasks();
            return true;
        }
        if let Some(task) = locked(&self.connecting).remove(&peer) {
            task.abort();
            return true;
        }
        false
    }
}

/// Tokio-backed [`NetworkStack`]
#[derive(Clone)]
pub struct TokioStack {
    runtime: Handle,
    inner: Arc<StackInner>,
}

impl TokioStack {
    /// Create a stack that spawns its socket tasks on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            inner: Arc::new(StackInner::default()),
        }
    }

    /// Create a stack on the runtime the caller is running in
    pub fn current() -> ModbusResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ModbusError::configuration(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::new(runtime))
    }

    /// Number of active (accepted or connected) endpoints
    pub fn active_peers(&self) -> usize {
        locked(&self.inner.peers).len()
    }
}

impl NetworkStack for TokioStack {
    fn listen(&self, port: u16, backlog: u8, events: EventCallback) -> Result<ListenerHandle, StackError> {
        let _guard = self.runtime.enter();
        let io_err = |e: std::io::Error| StackError::from_io(&e);

        let socket = TcpSocket::new_v4().map_err(io_err)?;
        socket.set_reuseaddr(true).map_err(io_err)?;
        socket.bind(SocketAddr::from(([0, 0, 0, 0], port))).map_err(io_err)?;
        let listener = socket.listen(u32::from(backlog.max(1))).map_err(io_err)?;
        let local_addr = listener.local_addr().map_err(io_err)?;

        let handle = ListenerHandle(self.inner.allocate());
        let inner = Arc::clone(&self.inner);
        let task = self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let peer = PeerHandle(inner.allocate());
                        debug!("Accepted {} from {}", peer, remote);
                        let reader = inner.attach(peer, stream, Arc::clone(&events));
                        events(StackEvent::Accepted(Ok(peer)));
                        inner.start_reading(peer, reader, Arc::clone(&events));
                    }
                    Err(e) => {
                        warn!("Accept failed on {}: {}", local_addr, e);
                        events(StackEvent::Accepted(Err(StackError::from_io(&e))));
                    }
                }
            }
        });

        locked(&self.inner.listeners).insert(handle, ListenerEntry { local_addr, task });
        Ok(handle)
    }

    fn connect(&self, address: SocketAddr, events: EventCallback) -> Result<PeerHandle, StackError> {
        let peer = PeerHandle(self.inner.allocate());
        let inner = Arc::clone(&self.inner);

        // Hold the table while spawning so the task cannot finish before it is registered.
        let mut connecting = locked(&self.inner.connecting);
        let task = self.runtime.spawn(async move {
            let result = TcpStream::connect(address).await;
            if locked(&inner.connecting).remove(&peer).is_none() {
                // aborted while connecting
                return;
            }
            match result {
                Ok(stream) => {
                    let reader = inner.attach(peer, stream, Arc::clone(&events));
                    events(StackEvent::Connected(peer));
                    inner.start_reading(peer, reader, events);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", address, e);
                    events(StackEvent::Error(peer, StackError::from_io(&e)));
                }
            }
        });
        connecting.insert(peer, task);

        Ok(peer)
    }

    fn write(&self, peer: PeerHandle, data: &[u8]) -> Result<(), StackError> {
        let peers = locked(&self.inner.peers);
        let entry = peers.get(&peer).ok_or(StackError::NotConnected)?;
        entry
            .writer
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| StackError::Closed)
    }

    fn close(&self, peer: PeerHandle) -> Result<(), StackError> {
        let entry = locked(&self.inner.peers).remove(&peer);
        match entry {
            Some(entry) => {
                // Dropping the writer lets the write task flush and shut the socket down.
                for task in entry.tasks.iter().skip(1) {
                    task.abort();
                }
                drop(entry.writer);
                Ok(())
            }
            None if self.inner.release(peer) => Ok(()),
            None => Err(StackError::NotConnected),
        }
    }

    fn abort(&self, peer: PeerHandle) {
        self.inner.release(peer);
    }

    fn close_listener(&self, listener: ListenerHandle) -> Result<(), StackError> {
        let entry = locked(&self.inner.listeners)
            .remove(&listener)
            .ok_or(StackError::Argument)?;
        entry.task.abort();
        Ok(())
    }

    fn local_addr(&self, listener: ListenerHandle) -> Option<SocketAddr> {
        locked(&self.inner.listeners).get(&listener).map(|entry| entry.local_addr)
    }
}
