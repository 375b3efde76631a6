//! Packet logging and logger initialisation
//!
//! Diagnostic output goes through the `log` facade; packet dumps go through
//! `tracing` under the `voltage_modbus_bridge::packet` target so they can be
//! filtered separately. Packet logging is off unless the debug flag is set,
//! and the flag can be flipped at runtime.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::mbap::MBAP_HEADER_LENGTH;
use crate::protocol::ModbusFunction;

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LoggingMode {
    /// Show raw packet data only
    #[default]
    Raw = 0,
    /// Show interpreted packet data with field descriptions
    Interpreted = 1,
    /// Show both raw and interpreted data
    Both = 2,
}

impl LoggingMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoggingMode::Interpreted,
            2 => LoggingMode::Both,
            _ => LoggingMode::Raw,
        }
    }

    fn shows_raw(self) -> bool {
        matches!(self, LoggingMode::Raw | LoggingMode::Both)
    }

    fn shows_interpreted(self) -> bool {
        matches!(self, LoggingMode::Interpreted | LoggingMode::Both)
    }
}

/// Format packet bytes as space separated upper-case hex
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Debug-flag gated packet logger shared by a bridge and its server/client
#[derive(Debug)]
pub struct PacketLogger {
    enabled: AtomicBool,
    mode: AtomicU8,
}

impl Default for PacketLogger {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PacketLogger {
    pub fn new(enabled: bool) -> Self {
        Self::with_mode(enabled, LoggingMode::Raw)
    }

    pub fn with_mode(enabled: bool, mode: LoggingMode) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            mode: AtomicU8::new(mode as u8),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_mode(&self, mode: LoggingMode) {
        self.mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn mode(&self) -> LoggingMode {
        LoggingMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Raw dump of bytes crossing the transport
    pub fn log_packet(&self, direction: &str, data: &[u8]) {
        if self.is_enabled() && self.mode().shows_raw() {
            info!(
                target: "voltage_modbus_bridge::packet",
                "[MODBUS-TCP] {} ({} bytes): {}",
                direction,
                data.len(),
                format_hex_packet(data)
            );
        }
    }

    /// Interpreted dump of a request ADU
    pub fn log_request(&self, adu: &[u8]) {
        if self.is_enabled() && self.mode().shows_interpreted() {
            info!(target: "voltage_modbus_bridge::packet", "Modbus Request -> {}", describe_adu(adu, false));
        }
    }

    /// Interpreted dump of a response ADU
    pub fn log_response(&self, adu: &[u8]) {
        if self.is_enabled() && self.mode().shows_interpreted() {
            info!(target: "voltage_modbus_bridge::packet", "Modbus Response <- {}", describe_adu(adu, true));
        }
    }
}

/// Human-readable summary of an ADU
pub fn describe_adu(adu: &[u8], is_response: bool) -> String {
    if adu.len() <= MBAP_HEADER_LENGTH {
        return format!("Truncated frame: {}", hex::encode(adu));
    }

    let transaction_id = u16::from_be_bytes([adu[0], adu[1]]);
    let unit_id = adu[6];
    let code = adu[7];
    let data = &adu[MBAP_HEADER_LENGTH + 1..];

    if code & 0x80 != 0 {
        return format!(
            "TID: {}, Unit: {}, Exception for function 0x{:02X}, Code: {}",
            transaction_id,
            unit_id,
            code & 0x7F,
            data.first().copied().unwrap_or(0)
        );
    }

    let function_name = match ModbusFunction::from_u8(code) {
        Ok(function) => function.to_string(),
        Err(_) => format!("Unknown Function (0x{:02X})", code),
    };
    let fields = if is_response {
        interpret_response_data(code, data)
    } else {
        interpret_request_data(code, data)
    };
    format!("TID: {}, Unit: {}, Function: {}, {}", transaction_id, unit_id, function_name, fields)
}

fn word(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2).map(|w| u16::from_be_bytes([w[0], w[1]]))
}

fn interpret_request_data(function_code: u8, data: &[u8]) -> String {
    match (function_code, word(data, 0), word(data, 2)) {
        (0x01..=0x04 | 0x0F | 0x10, Some(address), Some(quantity)) => {
            format!("Address: {}, Quantity: {}", address, quantity)
        }
        (0x05, Some(address), Some(value)) => {
            format!("Address: {}, Value: {}", address, if value == 0xFF00 { "ON" } else { "OFF" })
        }
        (0x06, Some(address), Some(value)) => {
            format!("Address: {}, Value: {} (0x{:04X})", address, value, value)
        }
        (0x17, Some(read_address), Some(read_quantity)) => match (word(data, 4), word(data, 6)) {
            (Some(write_address), Some(write_quantity)) => format!(
                "Read: {}+{}, Write: {}+{}",
                read_address, read_quantity, write_address, write_quantity
            ),
            _ => format!("Data: {}", hex::encode(data)),
        },
        _ => format!("Data: {}", hex::encode(data)),
    }
}

fn interpret_response_data(function_code: u8, data: &[u8]) -> String {
    if data.is_empty() {
        return "No data".to_string();
    }

    match function_code {
        0x01 | 0x02 => {
            let byte_count = data[0];
            let bits: Vec<u8> = data[1..]
                .iter()
                .flat_map(|byte| (0..8).map(move |bit| (byte >> bit) & 1))
                .take(16)
                .collect();
            format!("Byte count: {}, Bits: {:?}", byte_count, bits)
        }
        0x03 | 0x04 | 0x17 => {
            let byte_count = data[0];
            let registers: Vec<u16> = data[1..]
                .chunks_exact(2)
                .take(8)
                .map(|w| u16::from_be_bytes([w[0], w[1]]))
                .collect();
            format!("Byte count: {}, Registers: {:?}", byte_count, registers)
        }
        _ => interpret_request_data(function_code, data),
    }
}

/// Initialise `env_logger` for applications
///
/// `RUST_LOG` takes precedence; otherwise `debug` selects between the debug
/// and info levels.
pub fn init_logger(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init();
}

/// Initialise a capture-friendly logger for tests
pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x00, 0x01, 0xAB]), "00 01 AB");
        assert_eq!(format_hex_packet(&[]), "");
    }

    #[test]
    fn test_runtime_toggle() {
        let logger = PacketLogger::new(false);
        assert!(!logger.is_enabled());
        logger.set_enabled(true);
        assert!(logger.is_enabled());
        logger.set_mode(LoggingMode::Both);
        assert_eq!(logger.mode(), LoggingMode::Both);
    }

    #[test]
    fn test_describe_request_and_response() {
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x0A, 0x12, 0x34];
        let text = describe_adu(&request, false);
        assert!(text.contains("TID: 1"));
        assert!(text.contains("Write Single Register"));
        assert!(text.contains("Value: 4660"));

        let response = [0x00, 0x02, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x05, 0x00, 0x06];
        assert!(describe_adu(&response, true).contains("Registers: [5, 6]"));

        let exception = [0x00, 0x03, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        assert!(describe_adu(&exception, true).contains("Code: 2"));

        assert!(describe_adu(&[0x00, 0x01], false).starts_with("Truncated"));
    }
}
