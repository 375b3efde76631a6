//! # Bridge Error Handling
//!
//! Every fallible operation of the bridge returns [`ModbusResult`]. The error
//! enum follows the four fault classes of the transport bridge:
//!
//! ### Transport faults
//! - **Connection**: connect failures, sending on a dropped connection
//! - **Transport**: unexpected stack errors reported by an error notification
//! - **RemoteClosed**: the peer closed the connection and no bytes are buffered
//! - **Timeout**: a receive deadline elapsed
//! - **ShortWrite**: the connection dropped before the whole frame was acknowledged
//!
//! ### Protocol faults
//! - **Frame**: frame too short, bad length field
//! - **BadData**: transaction ID or protocol ID mismatch on a response
//! - **Exception**: the remote answered with a Modbus exception
//!
//! ### Range faults
//! - **InvalidAddress** / **InvalidData**: request outside a table, bad quantity
//!
//! ### Resource faults
//! - **BufferOverflow**: an inbound segment did not fit the receive buffer
//!
//! ```rust
//! use voltage_modbus_bridge::{ModbusError, ModbusResult};
//!
//! fn handle(result: ModbusResult<Vec<u16>>) {
//!     match result {
//!         Ok(values) => println!("{:?}", values),
//!         Err(e) if e.is_recoverable() => println!("retry: {}", e),
//!         Err(e) => println!("fatal: {}", e),
//!     }
//! }
//! ```

use thiserror::Error;

use crate::protocol::ModbusException;
use crate::stack::StackError;

/// Result type alias for bridge operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Bridge error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (sockets, files)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment and maintenance problems
    ///
    /// # Examples
    /// - connect refused by the remote host
    /// - send attempted while the connection is down
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Unexpected error reported by the network stack
    ///
    /// Remote resets are not reported this way; they silently cycle the
    /// connection back to idle.
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: StackError, message: String },

    /// The remote side closed the connection and nothing is left to read
    #[error("Remote closed the connection")]
    RemoteClosed,

    /// Operation exceeded its deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The connection dropped before every byte of a frame was acknowledged
    #[error("Short write: {acknowledged} of {expected} bytes acknowledged")]
    ShortWrite { expected: usize, acknowledged: usize },

    /// General protocol violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Malformed frame
    ///
    /// # Examples
    /// - fewer than 7 MBAP bytes
    /// - length field outside 2..=254
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Response does not belong to the request
    ///
    /// Raised for transaction ID or protocol ID mismatches. The connection is
    /// still usable; the caller may retry.
    #[error("Bad data: {message}")]
    BadData { message: String },

    /// Unsupported function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Address range outside a configured table
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value or quantity
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Modbus exception response
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Inbound segment exceeded the receive buffer capacity
    #[error("Inbound buffer overflow: {dropped} byte(s) dropped (capacity {capacity})")]
    BufferOverflow { capacity: usize, dropped: usize },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (lock poisoning, closed channels)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a transport error carrying the stack's error kind
    pub fn transport<S: Into<String>>(kind: StackError, message: S) -> Self {
        Self::Transport { kind, message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a short write error
    pub fn short_write(expected: usize, acknowledged: usize) -> Self {
        Self::ShortWrite { expected, acknowledged }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a bad data error
    pub fn bad_data<S: Into<String>>(message: S) -> Self {
        Self::BadData { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to their names.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match ModbusException::from_u8(code) {
            Some(exception) => exception.name(),
            None => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a buffer overflow error
    pub fn buffer_overflow(capacity: usize, dropped: usize) -> Self {
        Self::BufferOverflow { capacity, dropped }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// ```rust
    /// use voltage_modbus_bridge::ModbusError;
    ///
    /// assert!(ModbusError::timeout("receive", 500).is_recoverable());
    /// assert!(ModbusError::bad_data("transaction ID mismatch").is_recoverable());
    /// assert!(!ModbusError::invalid_function(0x99).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::RemoteClosed => true,
            Self::Timeout { .. } => true,
            Self::BadData { .. } => true,
            Self::BufferOverflow { .. } => true,
            Self::Transport { kind, .. } => kind.is_remote_reset(),
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Transport { .. }
                | Self::RemoteClosed
                | Self::Timeout { .. }
                | Self::ShortWrite { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::Frame { .. }
                | Self::BadData { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
        )
    }

    /// Check if the error is a range fault
    ///
    /// Range faults are answered with a Modbus exception response and never
    /// tear down the connection.
    pub fn is_range_error(&self) -> bool {
        matches!(self, Self::InvalidAddress { .. } | Self::InvalidData { .. })
    }

    /// Exception code a server answers this error with, if any
    pub fn exception_code(&self) -> Option<ModbusException> {
        match self {
            Self::InvalidFunction { .. } => Some(ModbusException::IllegalFunction),
            Self::InvalidAddress { .. } => Some(ModbusException::IllegalDataAddress),
            Self::InvalidData { .. } => Some(ModbusException::IllegalDataValue),
            Self::Exception { code, .. } => ModbusException::from_u8(*code),
            Self::Internal { .. } => Some(ModbusException::ServerDeviceFailure),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::timeout("receive", 500);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());

        let err = ModbusError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());
        assert_eq!(err.exception_code(), Some(ModbusException::IllegalDataAddress));

        let err = ModbusError::invalid_address(10, 2);
        assert!(err.is_range_error());
        assert!(!err.is_transport_error());
    }

    #[test]
    fn test_transport_error_recoverability() {
        let reset = ModbusError::transport(StackError::Reset, "peer reset");
        assert!(reset.is_recoverable());

        let memory = ModbusError::transport(StackError::Memory, "out of pbufs");
        assert!(!memory.is_recoverable());
        assert!(memory.is_transport_error());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::short_write(12, 8);
        let msg = format!("{}", err);
        assert!(msg.contains("8 of 12"));

        let err = ModbusError::exception(0x06, 0x02);
        assert!(format!("{}", err).contains("Illegal Data Address"));
    }
}
