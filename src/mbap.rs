//! # MBAP framing codec
//!
//! Frame-level Modbus TCP handling, independent of what the function code
//! means to the register mapping.
//!
//! ```text
//!  0      2      4      6    7    8
//! ┌──────┬──────┬──────┬────┬────┬──────────────────────┐
//! │ TID  │ PID  │ LEN  │UNIT│ FC │ function payload ... │
//! └──────┴──────┴──────┴────┴────┴──────────────────────┘
//!  LEN = bytes following the length field (unit + PDU)
//! ```
//!
//! Headers are built with a placeholder length that [`patch_length`] fills in
//! once the whole ADU is assembled.

use std::sync::atomic::{AtomicU16, Ordering};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{ModbusError, ModbusResult};
use crate::notify::WriteNotification;
use crate::protocol::{data_utils, ModbusFunction, SlaveId};
use crate::{
    MAX_READ_BITS, MAX_READ_REGISTERS, MAX_TCP_FRAME_SIZE, MAX_WRITE_AND_READ_REGISTERS, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS,
};

/// Transaction ID + protocol ID + length + unit ID
pub const MBAP_HEADER_LENGTH: usize = 7;

/// Request basis: MBAP header, function code, address and quantity
pub const REQUEST_BASIS_LENGTH: usize = 12;

/// Response basis: MBAP header and function code
pub const RESPONSE_BASIS_LENGTH: usize = 8;

/// Smallest legal length field (unit ID + function code)
pub const MIN_LENGTH_FIELD: u16 = 2;

/// Largest legal length field (unit ID + 253-byte PDU)
pub const MAX_LENGTH_FIELD: u16 = (MAX_TCP_FRAME_SIZE - 6) as u16;

const PROTOCOL_ID: u16 = 0;

/// Per-connection transaction ID allocator
///
/// IDs increase by one per request and wrap from 65535 to 0; the first ID
/// handed out is 1.
#[derive(Debug, Default)]
pub struct TransactionCounter {
    last: AtomicU16,
}

impl TransactionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start so that the next ID is `last + 1`
    pub fn starting_after(last: u16) -> Self {
        Self { last: AtomicU16::new(last) }
    }

    pub fn next(&self) -> u16 {
        self.last.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    pub fn current(&self) -> u16 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: SlaveId,
}

impl MbapHeader {
    pub fn parse(buf: &[u8]) -> ModbusResult<Self> {
        if buf.len() < MBAP_HEADER_LENGTH {
            return Err(ModbusError::frame(format!(
                "MBAP header too short: {} of {} bytes",
                buf.len(),
                MBAP_HEADER_LENGTH
            )));
        }

        Ok(Self {
            transaction_id: BigEndian::read_u16(&buf[0..2]),
            protocol_id: BigEndian::read_u16(&buf[2..4]),
            length: BigEndian::read_u16(&buf[4..6]),
            unit_id: buf[6],
        })
    }

    /// Check protocol ID and length field of an inbound header
    pub fn validate(&self) -> ModbusResult<()> {
        if self.protocol_id != PROTOCOL_ID {
            return Err(ModbusError::frame(format!("Invalid protocol ID: {}", self.protocol_id)));
        }
        if !(MIN_LENGTH_FIELD..=MAX_LENGTH_FIELD).contains(&self.length) {
            return Err(ModbusError::frame(format!("Invalid length field: {}", self.length)));
        }
        Ok(())
    }

    /// Bytes still to read after the 7-byte header
    pub fn remaining_length(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }

    /// Total ADU length announced by this header
    pub fn frame_length(&self) -> usize {
        MBAP_HEADER_LENGTH + self.remaining_length()
    }
}

/// Build the 12-byte basis of a request
///
/// The length field is left at zero for [`patch_length`].
pub fn build_request_basis(
    transaction_id: u16,
    unit_id: SlaveId,
    function: ModbusFunction,
    address: u16,
    quantity: u16,
) -> Vec<u8> {
    let mut frame = vec![0u8; REQUEST_BASIS_LENGTH];
    BigEndian::write_u16(&mut frame[0..2], transaction_id);
    BigEndian::write_u16(&mut frame[2..4], PROTOCOL_ID);
    frame[6] = unit_id;
    frame[7] = function.to_u8();
    BigEndian::write_u16(&mut frame[8..10], address);
    BigEndian::write_u16(&mut frame[10..12], quantity);
    frame
}

/// Build the 8-byte basis of a response to `request`
///
/// Transaction and unit IDs are copied from the request.
pub fn build_response_basis(request: &MbapHeader, function_code: u8) -> Vec<u8> {
    let mut frame = vec![0u8; RESPONSE_BASIS_LENGTH];
    BigEndian::write_u16(&mut frame[0..2], request.transaction_id);
    BigEndian::write_u16(&mut frame[2..4], PROTOCOL_ID);
    frame[6] = request.unit_id;
    frame[7] = function_code;
    frame
}

/// Build a complete exception response
pub fn build_exception_response(request: &MbapHeader, function_code: u8, exception_code: u8) -> Vec<u8> {
    let mut frame = build_response_basis(request, function_code | 0x80);
    frame.push(exception_code);
    // 9 bytes always fit
    let length = (frame.len() - 6) as u16;
    BigEndian::write_u16(&mut frame[4..6], length);
    frame
}

/// Write `total_length - 6` into bytes 4..6
pub fn patch_length(frame: &mut [u8]) -> ModbusResult<()> {
    if frame.len() < RESPONSE_BASIS_LENGTH || frame.len() > MAX_TCP_FRAME_SIZE {
        return Err(ModbusError::frame(format!("Cannot patch length of a {}-byte frame", frame.len())));
    }
    let length = (frame.len() - 6) as u16;
    BigEndian::write_u16(&mut frame[4..6], length);
    Ok(())
}

/// Validate a response against the request it answers
///
/// A transaction or protocol ID mismatch is reported as bad data; the
/// connection stays usable.
pub fn check_confirmation(request: &[u8], response: &[u8]) -> ModbusResult<()> {
    let request = MbapHeader::parse(request)?;
    let response = MbapHeader::parse(response)?;

    if response.transaction_id != request.transaction_id {
        return Err(ModbusError::bad_data(format!(
            "Invalid transaction ID: received 0x{:04X}, expected 0x{:04X}",
            response.transaction_id, request.transaction_id
        )));
    }
    if response.protocol_id != PROTOCOL_ID {
        return Err(ModbusError::bad_data(format!("Invalid protocol ID: 0x{:04X}", response.protocol_id)));
    }
    Ok(())
}

/// Classify a request ADU as a write and extract its address and count
///
/// Simple writes carry the address at +1 and the quantity at +3 from the
/// function code byte; write-and-read carries its write half at +5/+7.
/// Read-only functions yield `None`.
pub fn classify_write(adu: &[u8]) -> ModbusResult<Option<WriteNotification>> {
    let offset = MBAP_HEADER_LENGTH;
    let code = *adu
        .get(offset)
        .ok_or_else(|| ModbusError::frame("Frame has no function code"))?;
    let function = match ModbusFunction::from_u8(code) {
        Ok(function) if function.is_write_function() => function,
        _ => return Ok(None),
    };

    let field = |at: usize| -> ModbusResult<u16> {
        adu.get(offset + at..offset + at + 2)
            .map(BigEndian::read_u16)
            .ok_or_else(|| ModbusError::frame(format!("{} request truncated", function)))
    };

    let (address, count) = match function {
        ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => (field(1)?, 1),
        ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => (field(1)?, field(3)?),
        ModbusFunction::WriteAndReadRegisters => (field(5)?, field(7)?),
        _ => return Ok(None),
    };

    Ok(Some(WriteNotification { function, address, count }))
}

/// Function-specific part of a decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    WriteAndReadRegisters {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: Vec<u16>,
    },
}

impl RequestBody {
    pub fn function(&self) -> ModbusFunction {
        match self {
            RequestBody::ReadCoils { .. } => ModbusFunction::ReadCoils,
            RequestBody::ReadDiscreteInputs { .. } => ModbusFunction::ReadDiscreteInputs,
            RequestBody::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters,
            RequestBody::ReadInputRegisters { .. } => ModbusFunction::ReadInputRegisters,
            RequestBody::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            RequestBody::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            RequestBody::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            RequestBody::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
            RequestBody::WriteAndReadRegisters { .. } => ModbusFunction::WriteAndReadRegisters,
        }
    }

    /// Address and quantity fields of the request basis
    fn basis_fields(&self) -> (u16, u16) {
        match self {
            RequestBody::ReadCoils { address, quantity }
            | RequestBody::ReadDiscreteInputs { address, quantity }
            | RequestBody::ReadHoldingRegisters { address, quantity }
            | RequestBody::ReadInputRegisters { address, quantity } => (*address, *quantity),
            RequestBody::WriteSingleCoil { address, value } => (*address, if *value { 0xFF00 } else { 0x0000 }),
            RequestBody::WriteSingleRegister { address, value } => (*address, *value),
            RequestBody::WriteMultipleCoils { address, values } => (*address, values.len() as u16),
            RequestBody::WriteMultipleRegisters { address, values } => (*address, values.len() as u16),
            RequestBody::WriteAndReadRegisters {
                read_address,
                read_quantity,
                ..
            } => (*read_address, *read_quantity),
        }
    }

    /// Quantity limits every request must satisfy
    pub fn validate(&self) -> ModbusResult<()> {
        let check = |quantity: usize, max: u16, what: &str| {
            if quantity == 0 || quantity > usize::from(max) {
                Err(ModbusError::invalid_data(format!(
                    "Too many {} requested ({} > {}) or zero",
                    what, quantity, max
                )))
            } else {
                Ok(())
            }
        };

        match self {
            RequestBody::ReadCoils { quantity, .. } | RequestBody::ReadDiscreteInputs { quantity, .. } => {
                check(usize::from(*quantity), MAX_READ_BITS, "bits")
            }
            RequestBody::ReadHoldingRegisters { quantity, .. } | RequestBody::ReadInputRegisters { quantity, .. } => {
                check(usize::from(*quantity), MAX_READ_REGISTERS, "registers")
            }
            RequestBody::WriteSingleCoil { .. } | RequestBody::WriteSingleRegister { .. } => Ok(()),
            RequestBody::WriteMultipleCoils { values, .. } => check(values.len(), MAX_WRITE_BITS, "bits"),
            RequestBody::WriteMultipleRegisters { values, .. } => {
                check(values.len(), MAX_WRITE_REGISTERS, "registers")
            }
            RequestBody::WriteAndReadRegisters {
                read_quantity, values, ..
            } => {
                check(usize::from(*read_quantity), MAX_READ_REGISTERS, "registers")?;
                check(values.len(), MAX_WRITE_AND_READ_REGISTERS, "registers")
            }
        }
    }
}

/// A decoded request ADU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub transaction_id: u16,
    pub unit_id: SlaveId,
    pub body: RequestBody,
}

impl RequestFrame {
    pub fn new(transaction_id: u16, unit_id: SlaveId, body: RequestBody) -> Self {
        Self {
            transaction_id,
            unit_id,
            body,
        }
    }

    pub fn function(&self) -> ModbusFunction {
        self.body.function()
    }

    /// Encode into a complete ADU with the length field patched
    pub fn encode(&self) -> ModbusResult<Vec<u8>> {
        self.body.validate()?;
        let (address, quantity) = self.body.basis_fields();
        let mut frame = build_request_basis(self.transaction_id, self.unit_id, self.function(), address, quantity);

        match &self.body {
            RequestBody::WriteMultipleCoils { values, .. } => {
                let packed = data_utils::pack_bits(values);
                frame.push(packed.len() as u8);
                frame.extend_from_slice(&packed);
            }
            RequestBody::WriteMultipleRegisters { values, .. } => {
                frame.push((values.len() * 2) as u8);
                frame.extend_from_slice(&data_utils::registers_to_bytes(values));
            }
            RequestBody::WriteAndReadRegisters {
                write_address, values, ..
            } => {
                let mut fields = [0u8; 4];
                BigEndian::write_u16(&mut fields[0..2], *write_address);
                BigEndian::write_u16(&mut fields[2..4], values.len() as u16);
                frame.extend_from_slice(&fields);
                frame.push((values.len() * 2) as u8);
                frame.extend_from_slice(&data_utils::registers_to_bytes(values));
            }
            _ => {}
        }

        patch_length(&mut frame)?;
        Ok(frame)
    }

    /// Decode a complete request ADU
    ///
    /// Framing problems yield `Frame` errors; a well-framed request with an
    /// unknown function yields `InvalidFunction`, and bad quantities or byte
    /// counts yield `InvalidData`.
    pub fn decode(adu: &[u8]) -> ModbusResult<Self> {
        let header = MbapHeader::parse(adu)?;
        header.validate()?;
        if adu.len() != header.frame_length() {
            return Err(ModbusError::frame(format!(
                "Frame length {} does not match header ({} bytes)",
                adu.len(),
                header.frame_length()
            )));
        }

        let function = ModbusFunction::from_u8(adu[MBAP_HEADER_LENGTH])?;
        let pdu = &adu[RESPONSE_BASIS_LENGTH..];
        let word = |at: usize| -> ModbusResult<u16> {
            pdu.get(at..at + 2)
                .map(BigEndian::read_u16)
                .ok_or_else(|| ModbusError::invalid_data(format!("{} request truncated", function)))
        };
        let payload = |at: usize, byte_count: usize| {
            pdu.get(at..at + byte_count)
                .ok_or_else(|| ModbusError::invalid_data(format!("{} payload truncated", function)))
        };

        let body = match function {
            ModbusFunction::ReadCoils => RequestBody::ReadCoils {
                address: word(0)?,
                quantity: word(2)?,
            },
            ModbusFunction::ReadDiscreteInputs => RequestBody::ReadDiscreteInputs {
                address: word(0)?,
                quantity: word(2)?,
            },
            ModbusFunction::ReadHoldingRegisters => RequestBody::ReadHoldingRegisters {
                address: word(0)?,
                quantity: word(2)?,
            },
            ModbusFunction::ReadInputRegisters => RequestBody::ReadInputRegisters {
                address: word(0)?,
                quantity: word(2)?,
            },
            ModbusFunction::WriteSingleCoil => {
                let value = match word(2)? {
                    0xFF00 => true,
                    0x0000 => false,
                    other => {
                        return Err(ModbusError::invalid_data(format!(
                            "Illegal coil value 0x{:04X}, expected 0xFF00 or 0x0000",
                            other
                        )))
                    }
                };
                RequestBody::WriteSingleCoil {
                    address: word(0)?,
                    value,
                }
            }
            ModbusFunction::WriteSingleRegister => RequestBody::WriteSingleRegister {
                address: word(0)?,
                value: word(2)?,
            },
            ModbusFunction::WriteMultipleCoils => {
                let quantity = word(2)?;
                let byte_count = usize::from(*pdu.get(4).unwrap_or(&0));
                if quantity == 0 || quantity > MAX_WRITE_BITS || byte_count != (usize::from(quantity) + 7) / 8 {
                    return Err(ModbusError::invalid_data(format!(
                        "Write multiple coils: quantity {} with byte count {}",
                        quantity, byte_count
                    )));
                }
                RequestBody::WriteMultipleCoils {
                    address: word(0)?,
                    values: data_utils::unpack_bits(payload(5, byte_count)?, usize::from(quantity)),
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                let quantity = word(2)?;
                let byte_count = usize::from(*pdu.get(4).unwrap_or(&0));
                if quantity == 0 || quantity > MAX_WRITE_REGISTERS || byte_count != usize::from(quantity) * 2 {
                    return Err(ModbusError::invalid_data(format!(
                        "Write multiple registers: quantity {} with byte count {}",
                        quantity, byte_count
                    )));
                }
                RequestBody::WriteMultipleRegisters {
                    address: word(0)?,
                    values: data_utils::bytes_to_registers(payload(5, byte_count)?)?,
                }
            }
            ModbusFunction::WriteAndReadRegisters => {
                let write_quantity = word(6)?;
                let byte_count = usize::from(*pdu.get(8).unwrap_or(&0));
                if write_quantity == 0
                    || write_quantity > MAX_WRITE_AND_READ_REGISTERS
                    || byte_count != usize::from(write_quantity) * 2
                {
                    return Err(ModbusError::invalid_data(format!(
                        "Write and read registers: write quantity {} with byte count {}",
                        write_quantity, byte_count
                    )));
                }
                RequestBody::WriteAndReadRegisters {
                    read_address: word(0)?,
                    read_quantity: word(2)?,
                    write_address: word(4)?,
                    values: data_utils::bytes_to_registers(payload(9, byte_count)?)?,
                }
            }
        };
        body.validate()?;

        Ok(Self {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            body,
        })
    }
}

/// A decoded response ADU
///
/// `data` holds the PDU bytes after the function code; interpreting them
/// needs the request they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub transaction_id: u16,
    pub unit_id: SlaveId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
}

impl ResponseFrame {
    /// Decode a response ADU; exception responses become `Exception` errors
    pub fn decode(adu: &[u8]) -> ModbusResult<Self> {
        let header = MbapHeader::parse(adu)?;
        header.validate()?;
        if adu.len() < RESPONSE_BASIS_LENGTH || adu.len() != header.frame_length() {
            return Err(ModbusError::frame(format!(
                "Response length {} does not match header ({} bytes)",
                adu.len(),
                header.frame_length()
            )));
        }

        let code = adu[MBAP_HEADER_LENGTH];
        if code & 0x80 != 0 {
            let exception = adu.get(RESPONSE_BASIS_LENGTH).copied().unwrap_or(0);
            return Err(ModbusError::exception(code & 0x7F, exception));
        }

        Ok(Self {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            function: ModbusFunction::from_u8(code)?,
            data: adu[RESPONSE_BASIS_LENGTH..].to_vec(),
        })
    }

    /// Register values of a read (or write-and-read) response
    pub fn registers(&self, expected: u16) -> ModbusResult<Vec<u16>> {
        let (byte_count, payload) = self.counted_payload()?;
        if byte_count != usize::from(expected) * 2 {
            return Err(ModbusError::protocol(format!(
                "Register count mismatch: expected {}, got {} bytes",
                expected, byte_count
            )));
        }
        data_utils::bytes_to_registers(payload)
    }

    /// Bit values of a read coils/discrete inputs response
    pub fn bits(&self, expected: u16) -> ModbusResult<Vec<bool>> {
        let (byte_count, payload) = self.counted_payload()?;
        if byte_count != (usize::from(expected) + 7) / 8 {
            return Err(ModbusError::protocol(format!(
                "Bit count mismatch: expected {} bits, got {} bytes",
                expected, byte_count
            )));
        }
        Ok(data_utils::unpack_bits(payload, usize::from(expected)))
    }

    /// Address and value/quantity echoed by a write response
    pub fn write_echo(&self) -> ModbusResult<(u16, u16)> {
        if self.data.len() < 4 {
            return Err(ModbusError::protocol("Write response too short"));
        }
        Ok((BigEndian::read_u16(&self.data[0..2]), BigEndian::read_u16(&self.data[2..4])))
    }

    fn counted_payload(&self) -> ModbusResult<(usize, &[u8])> {
        let byte_count = usize::from(
            *self
                .data
                .first()
                .ok_or_else(|| ModbusError::protocol("Response has no byte count"))?,
        );
        let payload = self
            .data
            .get(1..1 + byte_count)
            .ok_or_else(|| ModbusError::protocol("Response payload truncated"))?;
        Ok((byte_count, payload))
    }
}
