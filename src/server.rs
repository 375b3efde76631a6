/// Modbus TCP server
///
/// Serves one client at a time over a [`TcpBridge`]: listen, accept, then
/// receive indications and reply until the client goes away, then accept
/// again. Each write request is committed to the mapping under its lock,
/// answered, and finally announced on the write-notification channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection::TransportStats;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::PacketLogger;
use crate::mapping::{MappingStats, ModbusMapping};
use crate::mbap::{
    build_exception_response, build_response_basis, classify_write, patch_length, MbapHeader, RequestBody,
    RequestFrame, MBAP_HEADER_LENGTH,
};
use crate::notify::{write_channel, WriteListener, WriteNotification, WriteNotifier};
use crate::protocol::{data_utils, ModbusException};
use crate::stack::NetworkStack;
use crate::transport::TcpBridge;
use crate::TCP_SLAVE;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;

    /// Get the shared register mapping
    fn get_mapping(&self) -> Arc<ModbusMapping>;
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub exception_responses: u64,
    pub frame_errors: u64,
    pub ignored_requests: u64,
    pub notifications_published: u64,
    pub uptime_seconds: u64,
    pub transport: TransportStats,
    pub mapping_stats: Option<MappingStats>,
}

#[derive(Debug, Default)]
struct ServerCounters {
    connections: AtomicU64,
    requests: AtomicU64,
    successful: AtomicU64,
    exceptions: AtomicU64,
    frame_errors: AtomicU64,
    ignored: AtomicU64,
    notifications: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared between the server handle and its serving task
struct ServerShared {
    config: ServerConfig,
    bridge: TcpBridge,
    mapping: Arc<ModbusMapping>,
    notifier: WriteNotifier,
    logger: Arc<PacketLogger>,
    counters: ServerCounters,
    running: AtomicBool,
}

impl ServerShared {
    async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
                result = self.serve_connection() => {
                    if let Err(e) = result {
                        error!("Server loop stopped: {}", e);
                        break;
                    }
                }
            }
        }

        self.bridge.close();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Accept one client and serve it until it goes away
    ///
    /// Only a failure to accept is returned; every connection-level problem
    /// drops the peer and returns `Ok` so the caller accepts again.
    async fn serve_connection(&self) -> ModbusResult<()> {
        self.bridge.accept().await?;
        bump(&self.counters.connections);

        loop {
            let frame = match self
                .bridge
                .receive_frame(self.config.indication_timeout(), self.config.byte_timeout())
                .await
            {
                Ok(frame) => frame,
                Err(ModbusError::Frame { message }) => {
                    bump(&self.counters.frame_errors);
                    warn!("Invalid frame discarded: {}", message);
                    continue;
                }
                Err(ModbusError::RemoteClosed) => {
                    info!("Client disconnected");
                    break;
                }
                Err(e) => {
                    if e.is_recoverable() {
                        debug!("Connection ended: {}", e);
                    } else {
                        error!("Connection failed: {}", e);
                    }
                    break;
                }
            };

            if let Err(e) = self.handle_indication(&frame).await {
                warn!("Failed to answer request: {}", e);
                break;
            }
        }

        self.bridge.drop_peer();
        Ok(())
    }

    /// Reply to one indication, then publish its write notification
    ///
    /// A committed write is announced even when the reply could not be
    /// sent; the send error is returned afterwards.
    async fn handle_indication(&self, frame: &[u8]) -> ModbusResult<()> {
        bump(&self.counters.requests);
        self.logger.log_request(frame);

        let header = MbapHeader::parse(frame)?;
        if let Some(unit_id) = self.config.unit_id {
            if header.unit_id != unit_id && header.unit_id != TCP_SLAVE {
                debug!("Request for unit {} ignored", header.unit_id);
                bump(&self.counters.ignored);
                return Ok(());
            }
        }

        let (response, notification) = self.process(&header, frame);
        let sent = self.bridge.send_frame(&response).await;
        if sent.is_ok() {
            self.logger.log_response(&response);
        }

        if let Some(notification) = notification {
            match self.notifier.publish(notification).await {
                Ok(()) => bump(&self.counters.notifications),
                Err(e) => debug!("Write notification not delivered: {}", e),
            }
        }

        sent?;
        bump(&self.counters.successful);
        Ok(())
    }

    /// Build the response to `frame`, applying it to the mapping
    ///
    /// Yields the notification to publish when a write was committed. Every
    /// failure becomes an exception response.
    fn process(&self, header: &MbapHeader, frame: &[u8]) -> (Vec<u8>, Option<WriteNotification>) {
        let outcome = RequestFrame::decode(frame).and_then(|request| {
            let notification = classify_write(frame)?;
            let response = self.execute(header, &request)?;
            Ok((response, notification))
        });

        match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let exception = e.exception_code().unwrap_or(ModbusException::IllegalDataValue);
                bump(&self.counters.exceptions);
                debug!("Answering TID {} with {}: {}", header.transaction_id, exception, e);
                let function_code = frame[MBAP_HEADER_LENGTH];
                (build_exception_response(header, function_code, exception.to_u8()), None)
            }
        }
    }

    /// Apply `request` to the mapping and build the response
    ///
    /// Runs entirely inside one critical section. A range fault leaves the
    /// mapping untouched.
    fn execute(&self, header: &MbapHeader, request: &RequestFrame) -> ModbusResult<Vec<u8>> {
        let mut guard = self.mapping.lock()?;
        let mut response = build_response_basis(header, request.function().to_u8());

        match &request.body {
            RequestBody::ReadCoils { address, quantity } => {
                let packed = data_utils::pack_bits(&guard.get_coils(*address, *quantity)?);
                response.push(packed.len() as u8);
                response.extend_from_slice(&packed);
            }
            RequestBody::ReadDiscreteInputs { address, quantity } => {
                let packed = data_utils::pack_bits(&guard.get_discrete_inputs(*address, *quantity)?);
                response.push(packed.len() as u8);
                response.extend_from_slice(&packed);
            }
            RequestBody::ReadHoldingRegisters { address, quantity } => {
                let values = guard.get_holding_registers(*address, *quantity)?;
                response.push((values.len() * 2) as u8);
                response.extend_from_slice(&data_utils::registers_to_bytes(&values));
            }
            RequestBody::ReadInputRegisters { address, quantity } => {
                let values = guard.get_input_registers(*address, *quantity)?;
                response.push((values.len() * 2) as u8);
                response.extend_from_slice(&data_utils::registers_to_bytes(&values));
            }
            RequestBody::WriteSingleCoil { address, value } => {
                guard.set_coil(*address, *value)?;
                let raw = if *value { 0xFF00 } else { 0x0000 };
                response.extend_from_slice(&data_utils::registers_to_bytes(&[*address, raw]));
            }
            RequestBody::WriteSingleRegister { address, value } => {
                guard.set_holding_register(*address, *value)?;
                response.extend_from_slice(&data_utils::registers_to_bytes(&[*address, *value]));
            }
            RequestBody::WriteMultipleCoils { address, values } => {
                guard.set_coils(*address, values)?;
                response.extend_from_slice(&data_utils::registers_to_bytes(&[*address, values.len() as u16]));
            }
            RequestBody::WriteMultipleRegisters { address, values } => {
                guard.set_holding_registers(*address, values)?;
                response.extend_from_slice(&data_utils::registers_to_bytes(&[*address, values.len() as u16]));
            }
            RequestBody::WriteAndReadRegisters {
                read_address,
                read_quantity,
                write_address,
                values,
            } => {
                // Check the read range before writing anything.
                guard.get_holding_registers(*read_address, *read_quantity)?;
                guard.set_holding_registers(*write_address, values)?;
                let read = guard.get_holding_registers(*read_address, *read_quantity)?;
                response.push((read.len() * 2) as u8);
                response.extend_from_slice(&data_utils::registers_to_bytes(&read));
            }
        }
        drop(guard);

        patch_length(&mut response)?;
        Ok(response)
    }
}

/// Modbus TCP server over a non-blocking stack
pub struct ModbusTcpServer {
    shared: Arc<ServerShared>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
    start_time: Option<std::time::Instant>,
}

impl ModbusTcpServer {
    /// Create a server with a fresh mapping laid out per `config`
    ///
    /// Returns the listener half of the write-notification channel for the
    /// application context.
    pub fn new(stack: Arc<dyn NetworkStack>, config: ServerConfig) -> ModbusResult<(Self, WriteListener)> {
        let mapping = Arc::new(ModbusMapping::new(config.mapping)?);
        Self::with_mapping(stack, config, mapping)
    }

    /// Create a server around an existing mapping
    pub fn with_mapping(
        stack: Arc<dyn NetworkStack>,
        config: ServerConfig,
        mapping: Arc<ModbusMapping>,
    ) -> ModbusResult<(Self, WriteListener)> {
        config.validate()?;

        let endpoint = SocketAddr::from(([0, 0, 0, 0], config.port));
        let bridge = TcpBridge::new(stack, endpoint, config.overflow_policy);
        let logger = bridge.logger();
        logger.set_enabled(config.debug);
        logger.set_mode(config.log_mode);

        let (notifier, listener) = write_channel();
        let shared = Arc::new(ServerShared {
            config,
            bridge,
            mapping,
            notifier,
            logger,
            counters: ServerCounters::default(),
            running: AtomicBool::new(false),
        });

        Ok((
            Self {
                shared,
                shutdown_tx: None,
                task: None,
                start_time: None,
            },
            listener,
        ))
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.bridge.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Toggle packet logging while running
    pub fn set_debug(&self, enabled: bool) {
        self.shared.bridge.set_debug(enabled);
    }

    pub fn debug(&self) -> bool {
        self.shared.bridge.debug()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.bridge.is_connected()
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.is_running() {
            return Err(ModbusError::protocol("Server is already running"));
        }

        self.shared.bridge.listen(self.shared.config.backlog)?;
        info!("Modbus TCP server started");
        info!("   - Port: {}", self.shared.config.port);
        info!("   - Backlog: {}", self.shared.config.backlog);
        info!("   - Indication timeout: {:?}", self.shared.config.indication_timeout());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shared.running.store(true, Ordering::SeqCst);
        self.task = Some(tokio::spawn(Arc::clone(&self.shared).run(shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        self.start_time = Some(std::time::Instant::now());
        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ModbusError::internal(format!("Server task failed: {}", e)))?;
        }
        self.shared.bridge.close();
        self.shared.running.store(false, Ordering::SeqCst);

        info!("Modbus TCP server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let counters = &self.shared.counters;
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);

        ServerStats {
            connections_count: get(&counters.connections),
            total_requests: get(&counters.requests),
            successful_requests: get(&counters.successful),
            exception_responses: get(&counters.exceptions),
            frame_errors: get(&counters.frame_errors),
            ignored_requests: get(&counters.ignored),
            notifications_published: get(&counters.notifications),
            uptime_seconds: self.start_time.map_or(0, |t| t.elapsed().as_secs()),
            transport: self.shared.bridge.stats(),
            mapping_stats: Some(self.shared.mapping.get_stats()),
        }
    }

    fn get_mapping(&self) -> Arc<ModbusMapping> {
        Arc::clone(&self.shared.mapping)
    }
}

impl Drop for ModbusTcpServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}
