//! Bit-level protocol codec for the FPGA bridge.
//!
//! Every command is a fixed two-byte frame: a 4-bit opcode in the high
//! nibble of byte 0, followed by the payload. Responses to read commands
//! are also two bytes. The codec is stateless; the driver owns all state.

use thiserror::Error;

/// Number of addressable cells in the SRAM array.
pub const ADDR_COUNT: u16 = 512;

const OP_SET_ADDR: u8 = 0b0001;
const OP_WRITE_VAL: u8 = 0b0010;
const OP_READ_ADDR: u8 = 0b0011;
const OP_READ_VAL: u8 = 0b0100;
const OP_SET_CLK: u8 = 0b0101;
const OP_READ_CLK: u8 = 0b0110;
const OP_SET_DELAY: u8 = 0b0111;

/// Errors raised while encoding commands or decoding responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Address outside the 9-bit range [0, 512).
    #[error("address {0} outside [0, {ADDR_COUNT})")]
    AddressOutOfRange(u16),
    /// Response was shorter than the fixed two-byte frame.
    #[error("response held {0} bytes, expected 2")]
    MalformedResponse(usize),
}

/// The five command types understood by the FPGA bridge.
///
/// Set commands carry a payload; read commands are payload-free requests
/// that the bridge answers with a two-byte response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Select the cell targeted by subsequent value reads/writes.
    SetAddress(u16),
    /// Write a byte to the currently addressed cell.
    WriteValue(u8),
    /// Request the bridge's current address register.
    ReadAddress,
    /// Request the value of the currently addressed cell.
    ReadValue,
    /// Set the clock divisor (100 MHz / (4 * factor)).
    SetClock(u8),
    /// Request the current clock divisor.
    ReadClock,
    /// Set the read sampling delay in base-clock ticks.
    SetDelay(u8),
}

/// Encodes a command into its two-byte wire frame.
///
/// Fails only for addresses outside [0, 512); byte-sized payloads are
/// bounded by their type.
pub fn encode(command: Command) -> Result<[u8; 2], CodecError> {
    let frame = match command {
        Command::SetAddress(addr) => {
            if addr >= ADDR_COUNT {
                return Err(CodecError::AddressOutOfRange(addr));
            }
            // Bit 0 of the header carries the 9-bit address MSB.
            [(OP_SET_ADDR << 4) | ((addr >> 8) as u8 & 0x01), (addr & 0xFF) as u8]
        }
        Command::WriteValue(value) => [OP_WRITE_VAL << 4, value],
        Command::ReadAddress => [OP_READ_ADDR << 4, 0x00],
        Command::ReadValue => [OP_READ_VAL << 4, 0x00],
        Command::SetClock(factor) => [OP_SET_CLK << 4, factor],
        Command::ReadClock => [OP_READ_CLK << 4, 0x00],
        Command::SetDelay(ticks) => [OP_SET_DELAY << 4, ticks],
    };
    Ok(frame)
}

/// Decodes an address response: the low 10 bits of the header+word pair.
pub fn decode_address(response: &[u8]) -> Result<u16, CodecError> {
    if response.len() < 2 {
        return Err(CodecError::MalformedResponse(response.len()));
    }
    let field = ((response[0] as u16) << 8) | response[1] as u16;
    Ok(field & 0x03FF)
}

/// Decodes a value/clock/delay response: the full second byte.
pub fn decode_word(response: &[u8]) -> Result<u8, CodecError> {
    if response.len() < 2 {
        return Err(CodecError::MalformedResponse(response.len()));
    }
    Ok(response[1])
}
