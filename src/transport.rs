//! # Async Transport Adapter
//!
//! [`TcpBridge`] turns a callback-only [`NetworkStack`] into the
//! straight-line contract a Modbus engine expects:
//!
//! | Operation | Blocks until |
//! |---|---|
//! | [`TcpBridge::listen`] | never |
//! | [`TcpBridge::accept`] | a client connected (no timeout) |
//! | [`TcpBridge::connect`] | connected or failed |
//! | [`TcpBridge::send`] | some bytes acknowledged or the connection dropped |
//! | [`TcpBridge::receive`] | data buffered, connection dropped or deadline passed |
//! | [`TcpBridge::close`] | never |
//!
//! "Blocking" means the calling task suspends on the connection's
//! completion signal; other tasks keep running.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use voltage_modbus_bridge::{TcpBridge, TokioStack, OverflowPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stack = Arc::new(TokioStack::current()?);
//!     let bridge = TcpBridge::new(stack, "0.0.0.0:502".parse()?, OverflowPolicy::Disconnect);
//!
//!     bridge.listen(2)?;
//!     bridge.accept().await?;
//!
//!     let mut buf = [0u8; 260];
//!     let n = bridge.receive(&mut buf, Some(Duration::from_secs(1))).await?;
//!     bridge.send(&buf[..n]).await?;
//!     bridge.close();
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::connection::{Connection, ConnectionState, OverflowPolicy, TransportCounters, TransportStats};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::PacketLogger;
use crate::mbap::{MbapHeader, MBAP_HEADER_LENGTH};
use crate::stack::{ListenerHandle, NetworkStack};
use crate::MAX_TCP_FRAME_SIZE;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Blocking-contract adapter over a non-blocking TCP stack
///
/// One bridge owns at most one listener and one active peer.
pub struct TcpBridge {
    endpoint: SocketAddr,
    stack: Arc<dyn NetworkStack>,
    connection: Arc<Connection>,
    listener: Mutex<Option<ListenerHandle>>,
    logger: Arc<PacketLogger>,
}

impl TcpBridge {
    /// Create a bridge for `endpoint`
    ///
    /// For a server only the port of `endpoint` is used; a client connects
    /// to the full address.
    pub fn new(stack: Arc<dyn NetworkStack>, endpoint: SocketAddr, overflow_policy: OverflowPolicy) -> Self {
        let connection = Connection::new(Arc::clone(&stack), MAX_TCP_FRAME_SIZE, overflow_policy);
        Self {
            endpoint,
            stack,
            connection,
            listener: Mutex::new(None),
            logger: Arc::new(PacketLogger::default()),
        }
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<ListenerHandle>> {
        self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Bind and start listening; returns at once
    pub fn listen(&self, backlog: u8) -> ModbusResult<()> {
        let mut slot = self.listener_slot();
        if slot.is_some() {
            return Err(ModbusError::connection("Already listening"));
        }

        let port = self.endpoint.port();
        let handle = self
            .stack
            .listen(port, backlog, self.connection.event_callback())
            .map_err(|err| ModbusError::transport(err, format!("Failed to listen on port {}", port)))?;
        *slot = Some(handle);
        drop(slot);

        self.connection.start_listening();
        info!("Listening on {}", self.local_addr().unwrap_or(self.endpoint));
        Ok(())
    }

    /// Wait for a client; returns at once if one is already connected
    pub async fn accept(&self) -> ModbusResult<()> {
        if self.listener_slot().is_none() {
            return Err(ModbusError::connection("Accept called without a listener"));
        }
        self.connection.wait_until(None, |c| c.is_connected() || !c.is_listening()).await;
        if self.connection.is_connected() {
            Ok(())
        } else {
            Err(ModbusError::connection("Listener closed while accepting"))
        }
    }

    /// Connect to the endpoint address
    pub async fn connect(&self) -> ModbusResult<()> {
        if self.connection.is_connected() {
            return Ok(());
        }

        self.connection.begin_connect();
        match self.stack.connect(self.endpoint, self.connection.event_callback()) {
            Ok(peer) => self.connection.register_connecting_peer(peer),
            Err(err) => {
                self.connection.abandon_connect(err);
                return Err(ModbusError::transport(err, format!("Failed to connect to {}", self.endpoint)));
            }
        }

        self.connection.wait_until(None, |c| !c.is_awaiting_connect()).await;
        if self.connection.is_connected() {
            info!("Connected to {}", self.endpoint);
            return Ok(());
        }

        let detail = self
            .connection
            .take_last_error()
            .map_or_else(|| "connection dropped".to_string(), |err| err.to_string());
        Err(ModbusError::connection(format!("Connection to {} failed: {}", self.endpoint, detail)))
    }

    /// Write `data` and wait for the first acknowledgement
    ///
    /// Returns the number of bytes acknowledged so far, which may be less
    /// than `data.len()`; see [`TcpBridge::send_frame`] for a full write.
    pub async fn send(&self, data: &[u8]) -> ModbusResult<usize> {
        let peer = match self.connection.active_peer() {
            Some(peer) if self.connection.is_connected() => peer,
            _ => {
                return Err(ModbusError::connection(format!(
                    "Not sending {} byte(s), connection is down",
                    data.len()
                )))
            }
        };
        if data.is_empty() {
            return Ok(0);
        }

        self.connection.reset_acknowledged();
        self.logger.log_packet("send", data);
        if let Err(err) = self.stack.write(peer, data) {
            warn!("Write of {} byte(s) to {} failed: {}", data.len(), peer, err);
            self.connection.fail_peer(err);
            return Err(ModbusError::transport(err, "Failed to write data"));
        }
        TransportCounters::bump(&self.connection.counters.bytes_sent, data.len() as u64);

        self.connection
            .wait_until(None, |c| c.acknowledged() > 0 || !c.is_connected())
            .await;
        match self.connection.acknowledged() {
            0 => Err(ModbusError::short_write(data.len(), 0)),
            acknowledged => Ok(acknowledged),
        }
    }

    /// Wait until `total` bytes of the last send are acknowledged
    pub async fn wait_acknowledged(&self, total: usize) -> ModbusResult<usize> {
        self.connection
            .wait_until(None, |c| c.acknowledged() >= total || !c.is_connected())
            .await;
        let acknowledged = self.connection.acknowledged();
        if acknowledged >= total {
            Ok(acknowledged)
        } else {
            Err(ModbusError::short_write(total, acknowledged))
        }
    }

    /// Send a whole frame, waiting for every byte to be acknowledged
    pub async fn send_frame(&self, frame: &[u8]) -> ModbusResult<()> {
        let acknowledged = self.send(frame).await?;
        if acknowledged < frame.len() {
            debug!("Partial acknowledgement: {} of {} bytes", acknowledged, frame.len());
            self.wait_acknowledged(frame.len()).await?;
        }
        Ok(())
    }

    /// Copy buffered bytes into `buf`, waiting up to `deadline`
    ///
    /// With `deadline = None` waits until data arrives or the connection
    /// drops. Bytes come out in arrival order; whatever does not fit stays
    /// buffered for the next call.
    pub async fn receive(&self, buf: &mut [u8], deadline: Option<Duration>) -> ModbusResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let until = deadline.map(|d| Instant::now() + d);
        let ready = self
            .connection
            .wait_until(until, |c| c.has_inbound() || !c.is_connected())
            .await;
        if !ready {
            TransportCounters::bump(&self.connection.counters.timeouts, 1);
            return Err(ModbusError::timeout("receive", deadline.map_or(0, millis)));
        }

        if let Some(dropped) = self.connection.take_overflow() {
            return Err(ModbusError::buffer_overflow(MAX_TCP_FRAME_SIZE, dropped));
        }

        let n = self.connection.drain_inbound(buf);
        if n == 0 {
            return match self.connection.take_last_error() {
                Some(err) => Err(ModbusError::transport(err, "Connection failed")),
                None => Err(ModbusError::RemoteClosed),
            };
        }
        self.logger.log_packet("recv", &buf[..n]);
        Ok(n)
    }

    /// Fill `buf` completely
    ///
    /// The first chunk may wait up to `first_deadline`, every following one
    /// up to `byte_timeout`.
    async fn receive_exact(
        &self,
        buf: &mut [u8],
        first_deadline: Option<Duration>,
        byte_timeout: Duration,
    ) -> ModbusResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let deadline = if filled == 0 { first_deadline } else { Some(byte_timeout) };
            filled += self.receive(&mut buf[filled..], deadline).await?;
        }
        Ok(())
    }

    /// Receive one complete ADU
    ///
    /// Reads and validates the MBAP header, then exactly the number of bytes
    /// its length field announces. A header that fails validation flushes
    /// the inbound buffer.
    pub async fn receive_frame(&self, first_deadline: Option<Duration>, byte_timeout: Duration) -> ModbusResult<Vec<u8>> {
        let mut frame = vec![0u8; MBAP_HEADER_LENGTH];
        self.receive_exact(&mut frame, first_deadline, byte_timeout).await?;

        let header = MbapHeader::parse(&frame)?;
        if let Err(err) = header.validate() {
            let dropped = self.flush();
            debug!("Discarding invalid header ({}), flushed {} byte(s)", err, dropped);
            return Err(err);
        }

        frame.resize(header.frame_length(), 0);
        self.receive_exact(&mut frame[MBAP_HEADER_LENGTH..], Some(byte_timeout), byte_timeout)
            .await?;
        Ok(frame)
    }

    /// Discard buffered inbound bytes; returns how many were dropped
    pub fn flush(&self) -> usize {
        self.connection.reset_acknowledged();
        let dropped = self.connection.clear_inbound();
        if dropped > 0 {
            debug!("{} byte(s) flushed", dropped);
        }
        dropped
    }

    /// Drop the active peer but keep listening
    pub fn drop_peer(&self) {
        let next = if self.connection.is_listening() {
            ConnectionState::Listening
        } else {
            ConnectionState::Idle
        };
        self.connection.release_peer(false, next);
        self.connection.clear_inbound();
    }

    /// Release the listener and the active peer; safe to call repeatedly
    pub fn close(&self) {
        self.connection.shutdown();
        if let Some(listener) = self.listener_slot().take() {
            if let Err(err) = self.stack.close_listener(listener) {
                warn!("Closing listener failed: {}", err);
            }
        }
        self.connection.stop_listening();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let listener = (*self.listener_slot())?;
        self.stack.local_addr(listener)
    }

    pub fn stats(&self) -> TransportStats {
        self.connection.stats()
    }

    pub fn set_debug(&self, enabled: bool) {
        self.logger.set_enabled(enabled);
    }

    pub fn debug(&self) -> bool {
        self.logger.is_enabled()
    }

    pub fn logger(&self) -> Arc<PacketLogger> {
        Arc::clone(&self.logger)
    }

    /// Inbound bytes currently buffered
    pub fn pending(&self) -> usize {
        self.connection.inbound_len()
    }
}

impl Drop for TcpBridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpBridge")
            .field("endpoint", &self.endpoint)
            .field("connection", &self.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::loopback::ConnectOutcome;
    use crate::stack::{LoopbackStack, StackError};

    fn server_bridge(policy: OverflowPolicy) -> (TcpBridge, LoopbackStack) {
        let stack = LoopbackStack::new();
        let bridge = TcpBridge::new(Arc::new(stack.clone()), "0.0.0.0:502".parse().unwrap(), policy);
        bridge.listen(1).unwrap();
        (bridge, stack)
    }

    #[tokio::test]
    async fn test_accept_and_receive_fifo() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();
        bridge.accept().await.unwrap();

        stack.remote_send(peer, &[1, 2, 3]);
        stack.remote_send(peer, &[4, 5]);

        let mut buf = [0u8; 4];
        assert_eq!(bridge.receive(&mut buf, Some(Duration::ZERO)).await.unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(bridge.receive(&mut buf, Some(Duration::ZERO)).await.unwrap(), 1);
        assert_eq!(buf[0], 5);
    }

    #[tokio::test]
    async fn test_receive_deadline_zero_times_out() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        stack.remote_connect().unwrap();

        let mut buf = [0u8; 8];
        let err = bridge.receive(&mut buf, Some(Duration::ZERO)).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert_eq!(bridge.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_receive_after_remote_close() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();

        stack.remote_send(peer, &[9]);
        stack.remote_close(peer);
        assert!(!bridge.is_connected());
        assert_eq!(bridge.state(), ConnectionState::Listening);

        let mut buf = [0u8; 8];
        assert_eq!(bridge.receive(&mut buf, None).await.unwrap(), 1);
        assert_eq!(bridge.receive(&mut buf, None).await, Err(ModbusError::RemoteClosed));
    }

    #[tokio::test]
    async fn test_unexpected_error_propagates() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();
        stack.remote_error(peer, StackError::Memory);

        let mut buf = [0u8; 8];
        match bridge.receive(&mut buf, None).await {
            Err(ModbusError::Transport { kind, .. }) => assert_eq!(kind, StackError::Memory),
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_fails_next_receive() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();
        stack.remote_send(peer, &[0u8; MAX_TCP_FRAME_SIZE + 10]);

        let mut buf = [0u8; 16];
        assert_eq!(
            bridge.receive(&mut buf, None).await,
            Err(ModbusError::buffer_overflow(MAX_TCP_FRAME_SIZE, 10))
        );
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn test_send_reports_acknowledged_bytes() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();

        assert_eq!(bridge.send(&[1, 2, 3, 4]).await.unwrap(), 4);
        assert_eq!(stack.take_written(peer), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_partial_acknowledgement() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();
        stack.set_auto_ack(false);

        let remote = stack.clone();
        let acker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            remote.remote_ack(peer, 3);
        });
        assert_eq!(bridge.send(&[0u8; 10]).await.unwrap(), 3);
        acker.await.unwrap();

        let remote = stack.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            remote.remote_error(peer, StackError::Reset);
        });
        assert_eq!(bridge.wait_acknowledged(10).await, Err(ModbusError::short_write(10, 3)));
    }

    #[tokio::test]
    async fn test_send_frame_waits_for_all_chunks() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();
        stack.set_ack_chunk(Some(4));

        bridge.send_frame(&[7u8; 12]).await.unwrap();
        assert_eq!(stack.take_written(peer).len(), 12);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (bridge, _stack) = server_bridge(OverflowPolicy::Disconnect);
        assert!(matches!(bridge.send(&[1]).await, Err(ModbusError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_connect_success_and_failure() {
        let stack = LoopbackStack::new();
        let bridge = TcpBridge::new(
            Arc::new(stack.clone()),
            "127.0.0.1:502".parse().unwrap(),
            OverflowPolicy::Disconnect,
        );
        bridge.connect().await.unwrap();
        assert_eq!(bridge.state(), ConnectionState::Connected);
        bridge.close();
        assert!(!bridge.is_connected());

        stack.set_connect_outcome(ConnectOutcome::Fail(StackError::Reset));
        let err = bridge.connect().await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { ref message } if message.contains("reset")));
    }

    #[tokio::test]
    async fn test_deferred_connect() {
        let stack = LoopbackStack::new();
        stack.set_connect_outcome(ConnectOutcome::Defer);
        let bridge = Arc::new(TcpBridge::new(
            Arc::new(stack.clone()),
            "127.0.0.1:502".parse().unwrap(),
            OverflowPolicy::Disconnect,
        ));

        let connecting = Arc::clone(&bridge);
        let task = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bridge.state(), ConnectionState::Connecting);

        stack.remote_complete_connect(Ok(())).unwrap();
        task.await.unwrap().unwrap();
        assert!(bridge.is_connected());
    }

    #[tokio::test]
    async fn test_receive_frame_and_flush() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();

        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        stack.remote_send(peer, &request[..5]);
        stack.remote_send(peer, &request[5..]);
        let frame = bridge
            .receive_frame(Some(Duration::from_millis(50)), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(frame, request.to_vec());

        stack.remote_send(peer, &[0x00, 0x01, 0x00, 0x07, 0x00, 0x06, 0x01, 0xAA, 0xBB]);
        let err = bridge
            .receive_frame(Some(Duration::from_millis(50)), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Frame { .. }));
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (bridge, stack) = server_bridge(OverflowPolicy::Disconnect);
        let peer = stack.remote_connect().unwrap();

        bridge.close();
        bridge.close();
        assert!(stack.is_closed(peer));
        assert!(!stack.is_listening());
        assert_eq!(bridge.state(), ConnectionState::Idle);
        assert!(bridge.accept().await.is_err());
    }
}
