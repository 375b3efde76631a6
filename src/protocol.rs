/// Modbus protocol definitions
///
/// Function codes, exception codes and the bit/register packing helpers
/// shared by the framing codec, the server reply engine and the client.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Write and Read Multiple Registers (0x17)
    WriteAndReadRegisters = 0x17,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x17 => Ok(ModbusFunction::WriteAndReadRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read-only function
    pub fn is_read_function(self) -> bool {
        matches!(self,
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::ReadHoldingRegisters |
            ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this function alters the mapping
    ///
    /// Write-and-read counts as a write: its write half modifies holding
    /// registers.
    pub fn is_write_function(self) -> bool {
        matches!(self,
            ModbusFunction::WriteSingleCoil |
            ModbusFunction::WriteSingleRegister |
            ModbusFunction::WriteMultipleCoils |
            ModbusFunction::WriteMultipleRegisters |
            ModbusFunction::WriteAndReadRegisters
        )
    }

    /// Check if this function addresses bit tables
    pub fn is_bit_function(self) -> bool {
        matches!(self,
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::WriteSingleCoil |
            ModbusFunction::WriteMultipleCoils
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
            ModbusFunction::WriteAndReadRegisters => "Write and Read Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Short name
    pub fn name(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::ServerDeviceFailure => "Slave Device Failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::ServerDeviceBusy => "Slave Device Busy",
            ModbusException::MemoryParityError => "Memory Parity Error",
            ModbusException::GatewayPathUnavailable => "Gateway Path Unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => "Gateway Target Device Failed to Respond",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.name())
    }
}

/// Check a unit identifier
///
/// 0 is the broadcast address, 1..=247 are regular slaves and 0xFF is the
/// TCP default that gateways ignore.
pub fn validate_unit_id(unit_id: SlaveId) -> ModbusResult<()> {
    if unit_id <= 247 || unit_id == crate::TCP_SLAVE {
        Ok(())
    } else {
        Err(ModbusError::invalid_data(format!("Invalid unit ID: {}", unit_id)))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes, LSB first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map_or(false, |byte| byte & (1 << (i % 8)) != 0)
            })
            .collect()
    }

    /// Convert f32 to two u16 registers (IEEE 754, ABCD order)
    pub fn f32_to_registers(value: f32) -> [u16; 2] {
        let bits = value.to_bits();
        [(bits >> 16) as u16, bits as u16]
    }

    /// Convert two u16 registers to f32 (IEEE 754, ABCD order)
    pub fn registers_to_f32(registers: &[u16]) -> ModbusResult<f32> {
        if registers.len() < 2 {
            return Err(ModbusError::invalid_data("Need at least 2 registers for f32"));
        }
        Ok(f32::from_bits(((registers[0] as u32) << 16) | registers[1] as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::from_u8(0x17).unwrap(), ModbusFunction::WriteAndReadRegisters);
        assert_eq!(ModbusFunction::WriteMultipleCoils.to_u8(), 0x0F);

        assert!(ModbusFunction::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_write_classification() {
        assert!(ModbusFunction::WriteAndReadRegisters.is_write_function());
        assert!(ModbusFunction::WriteSingleCoil.is_write_function());
        assert!(!ModbusFunction::ReadInputRegisters.is_write_function());
        assert!(ModbusFunction::ReadInputRegisters.is_read_function());
    }

    #[test]
    fn test_unit_id_validation() {
        assert!(validate_unit_id(0).is_ok());
        assert!(validate_unit_id(247).is_ok());
        assert!(validate_unit_id(0xFF).is_ok());
        assert!(validate_unit_id(248).is_err());
    }

    #[test]
    fn test_data_utils() {
        let registers = vec![0x1234, 0x5678];
        let bytes = data_utils::registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(data_utils::bytes_to_registers(&bytes).unwrap(), registers);
        assert!(data_utils::bytes_to_registers(&[0x01]).is_err());

        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(data_utils::unpack_bits(&packed, bits.len()), bits);
    }

    #[test]
    fn test_float_registers() {
        let regs = data_utils::f32_to_registers(21.5);
        let value = data_utils::registers_to_f32(&regs).unwrap();
        assert!((value - 21.5).abs() < f32::EPSILON);
    }
}
