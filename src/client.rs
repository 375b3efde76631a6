/// Modbus TCP client
///
/// Straight-line request/confirmation over a [`TcpBridge`]: encode the
/// request with the next transaction ID, send it, receive one ADU and check
/// it belongs to the request before interpreting it. A response that fails
/// the transaction or protocol ID check is rejected as bad data; the
/// inbound buffer is flushed and the connection stays up.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::config::ClientConfig;
use crate::connection::TransportStats;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::PacketLogger;
use crate::mbap::{check_confirmation, RequestBody, RequestFrame, ResponseFrame, TransactionCounter};
use crate::protocol::{validate_unit_id, SlaveId};
use crate::stack::NetworkStack;
use crate::transport::TcpBridge;

/// Trait defining the interface for Modbus client operations
///
/// Methods are named after their function codes.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01)
    async fn read_01(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>>;

    /// Read discrete inputs (function code 0x02)
    async fn read_02(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>>;

    /// Read holding registers (function code 0x03)
    async fn read_03(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Read input registers (function code 0x04)
    async fn read_04(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>>;

    /// Write single coil (function code 0x05)
    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()>;

    /// Write single register (function code 0x06)
    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()>;

    /// Write multiple coils (function code 0x0F)
    async fn write_0f(&mut self, slave_id: SlaveId, address: u16, values: &[bool]) -> ModbusResult<()>;

    /// Write multiple registers (function code 0x10)
    async fn write_10(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()>;

    /// Write then read holding registers in one transaction (function code 0x17)
    async fn write_read_17(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>>;

    /// Check if client is connected
    fn is_connected(&self) -> bool;

    /// Close the client connection
    async fn close(&mut self) -> ModbusResult<()>;

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;
}

/// Modbus TCP client over a non-blocking stack
pub struct ModbusTcpClient {
    config: ClientConfig,
    bridge: TcpBridge,
    transactions: TransactionCounter,
    logger: Arc<PacketLogger>,
}

impl ModbusTcpClient {
    /// Create a client without connecting
    pub fn new(stack: Arc<dyn NetworkStack>, config: ClientConfig) -> ModbusResult<Self> {
        config.validate()?;

        let bridge = TcpBridge::new(stack, config.address, config.overflow_policy);
        let logger = bridge.logger();
        logger.set_enabled(config.debug);
        logger.set_mode(config.log_mode);

        Ok(Self {
            config,
            bridge,
            transactions: TransactionCounter::new(),
            logger,
        })
    }

    /// Create a client and connect it
    pub async fn connect_with(stack: Arc<dyn NetworkStack>, config: ClientConfig) -> ModbusResult<Self> {
        let client = Self::new(stack, config)?;
        client.connect().await?;
        Ok(client)
    }

    pub async fn connect(&self) -> ModbusResult<()> {
        self.bridge.connect().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn set_debug(&self, enabled: bool) {
        self.bridge.set_debug(enabled);
    }

    pub fn debug(&self) -> bool {
        self.bridge.debug()
    }

    /// Transaction ID of the most recent request
    pub fn last_transaction_id(&self) -> u16 {
        self.transactions.current()
    }

    /// Unit ID used by [`ModbusTcpClient::request`]
    pub fn unit_id(&self) -> SlaveId {
        self.config.unit_id
    }

    /// Send one request to the configured unit
    pub async fn request(&mut self, body: RequestBody) -> ModbusResult<ResponseFrame> {
        let unit_id = self.config.unit_id;
        self.execute(unit_id, body).await
    }

    /// Send one request and return its validated response
    pub async fn execute(&mut self, slave_id: SlaveId, body: RequestBody) -> ModbusResult<ResponseFrame> {
        validate_unit_id(slave_id)?;
        if !self.bridge.is_connected() {
            debug!("Not connected, reconnecting to {}", self.config.address);
            self.bridge.connect().await?;
        }

        let function = body.function();
        let request = RequestFrame::new(self.transactions.next(), slave_id, body).encode()?;
        self.logger.log_request(&request);
        self.bridge.send_frame(&request).await?;

        let response = self
            .bridge
            .receive_frame(Some(self.config.response_timeout()), self.config.byte_timeout())
            .await?;
        self.logger.log_response(&response);

        if let Err(e) = check_confirmation(&request, &response) {
            let dropped = self.bridge.flush();
            warn!("Response rejected ({}), {} byte(s) flushed", e, dropped);
            return Err(e);
        }

        let frame = ResponseFrame::decode(&response)?;
        if frame.function != function {
            return Err(ModbusError::protocol(format!(
                "Function code mismatch: expected {}, got {}",
                function, frame.function
            )));
        }
        Ok(frame)
    }

    async fn write_checked(&mut self, slave_id: SlaveId, body: RequestBody, expected: (u16, u16)) -> ModbusResult<()> {
        let echo = self.execute(slave_id, body).await?.write_echo()?;
        if echo != expected {
            return Err(ModbusError::protocol(format!(
                "Write echo mismatch: expected {:?}, got {:?}",
                expected, echo
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ModbusClient for ModbusTcpClient {
    async fn read_01(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.execute(slave_id, RequestBody::ReadCoils { address, quantity })
            .await?
            .bits(quantity)
    }

    async fn read_02(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.execute(slave_id, RequestBody::ReadDiscreteInputs { address, quantity })
            .await?
            .bits(quantity)
    }

    async fn read_03(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.execute(slave_id, RequestBody::ReadHoldingRegisters { address, quantity })
            .await?
            .registers(quantity)
    }

    async fn read_04(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.execute(slave_id, RequestBody::ReadInputRegisters { address, quantity })
            .await?
            .registers(quantity)
    }

    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        let raw = if value { 0xFF00 } else { 0x0000 };
        self.write_checked(slave_id, RequestBody::WriteSingleCoil { address, value }, (address, raw))
            .await
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        self.write_checked(slave_id, RequestBody::WriteSingleRegister { address, value }, (address, value))
            .await
    }

    async fn write_0f(&mut self, slave_id: SlaveId, address: u16, values: &[bool]) -> ModbusResult<()> {
        let body = RequestBody::WriteMultipleCoils {
            address,
            values: values.to_vec(),
        };
        self.write_checked(slave_id, body, (address, values.len() as u16)).await
    }

    async fn write_10(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()> {
        let body = RequestBody::WriteMultipleRegisters {
            address,
            values: values.to_vec(),
        };
        self.write_checked(slave_id, body, (address, values.len() as u16)).await
    }

    async fn write_read_17(
        &mut self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        let body = RequestBody::WriteAndReadRegisters {
            read_address,
            read_quantity,
            write_address,
            values: values.to_vec(),
        };
        self.execute(slave_id, body).await?.registers(read_quantity)
    }

    fn is_connected(&self) -> bool {
        self.bridge.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.bridge.close();
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.bridge.stats()
    }
}
