//! # Voltage Modbus Bridge - Modbus TCP over a callback-driven TCP stack
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! A Modbus TCP server and client engine for stacks that never block: the
//! stack reports connects, received bytes, acknowledgements and faults
//! through callbacks, while the Modbus engine expects straight-line
//! `accept`/`send`/`receive` calls with timeouts. [`TcpBridge`] sits in
//! between.
//!
//! ## Features
//!
//! - **Transport bridge**: connection state machine, bounded inbound FIFO, acknowledgement tracking
//! - **MBAP codec**: header validation, transaction IDs, exception responses
//! - **Shared mapping**: coils, discrete inputs and registers behind one lock
//! - **Write notifications**: one in-flight notification per applied write
//! - **Pluggable stacks**: [`TokioStack`] for real sockets, [`LoopbackStack`] for tests
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x17 | Write/Read Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ### Server Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_bridge::{ModbusServer, ModbusTcpServer, ServerConfig, TokioStack};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stack = Arc::new(TokioStack::current()?);
//!     let (mut server, mut writes) = ModbusTcpServer::new(stack, ServerConfig::default())?;
//!     server.start().await?;
//!
//!     while let Some(write) = writes.consume().await {
//!         let mapping = server.get_mapping();
//!         let guard = mapping.lock()?;
//!         println!("{:?} -> {:?}", write, guard.get_holding_registers(write.address, write.count));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Client Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_bridge::{ClientConfig, ModbusClient, ModbusTcpClient, TokioStack};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stack = Arc::new(TokioStack::current()?);
//!     let config = ClientConfig::new("127.0.0.1:502".parse()?);
//!     let mut client = ModbusTcpClient::connect_with(stack, config).await?;
//!
//!     client.write_06(1, 4, 1234).await?;
//!     println!("{:?}", client.read_03(1, 0, 8).await?);
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐         ┌─────────────────┐
//! │   Application   │◄────────│  WriteListener  │
//! └─────────────────┘         └─────────────────┘
//!          │ lock                      ▲ publish
//! ┌─────────────────┐         ┌─────────────────┐
//! │  ModbusMapping  │◄────────│  Modbus Server  │
//! └─────────────────┘         └─────────────────┘
//!                                      │ MBAP
//!                             ┌─────────────────┐
//!                             │    TcpBridge    │
//!                             └─────────────────┘
//!                                      │ callbacks
//!                             ┌─────────────────┐
//!                             │  NetworkStack   │
//!                             └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus function codes, exception codes and data helpers
pub mod protocol;

/// MBAP framing and PDU encoding
pub mod mbap;

/// Non-blocking TCP stack abstraction
pub mod stack;

/// Per-connection state shared with stack callbacks
pub mod connection;

/// Blocking-contract adapter over a [`stack::NetworkStack`]
pub mod transport;

/// Shared register mapping
pub mod mapping;

/// Write-notification channel
pub mod notify;

/// Modbus TCP server
pub mod server;

/// Modbus TCP client
pub mod client;

/// Server and client configuration
pub mod config;

/// Packet logging
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusException, ModbusFunction};
pub use stack::{LoopbackStack, NetworkStack, StackError, StackEvent, TokioStack};
pub use connection::{ConnectionState, OverflowPolicy, TransportStats};
pub use transport::TcpBridge;
pub use mapping::{MappingGuard, MappingLayout, ModbusMapping, TableLayout};
pub use notify::{write_channel, WriteListener, WriteNotification, WriteNotifier};
pub use server::{ModbusServer, ModbusTcpServer, ServerStats};
pub use client::{ModbusClient, ModbusTcpClient};
pub use config::{ClientConfig, ServerConfig};
pub use logging::{LoggingMode, PacketLogger};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Unit ID addressing the server itself rather than a gateway target
pub const TCP_SLAVE: u8 = 0xFF;

/// Default timeout between bytes of one frame
pub const DEFAULT_BYTE_TIMEOUT_MS: u64 = 500;

/// Default timeout for the first byte of a response
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 500;

/// Maximum number of coils or discrete inputs read in a single request
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum number of coils written in a single request
pub const MAX_WRITE_BITS: u16 = 1968;

/// Maximum number of registers read in a single request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers written in a single request
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum number of registers written by a write-and-read request
pub const MAX_WRITE_AND_READ_REGISTERS: u16 = 121;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Bridge v{} - Modbus TCP over non-blocking stacks by Evan Liu", VERSION)
}
