//! Command and status frames.
//!
//! A command is a 31-byte block that looks like a mass-storage CBW but
//! carries a RockChip opcode at byte 12. The device answers every command
//! with a 13-byte status frame whose contents are not interpreted: a
//! complete transfer means success.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Short status frame: expected {expected} bytes, got {actual}")]
    BadStatus { expected: usize, actual: usize },
    #[error("Short data transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("Short command write: {written} of {expected} bytes")]
    ShortCommand { expected: usize, written: usize },
}

pub type CommandFrame = [u8; CMD_FRAME_SIZE];

fn frame_with_tag(tag: u32) -> CommandFrame {
    let mut frame = [0u8; CMD_FRAME_SIZE];
    frame[..4].copy_from_slice(CMD_SIGNATURE);
    BigEndian::write_u32(&mut frame[CMD_TAG_OFFSET..], tag);
    frame
}

/// Build a command frame with an explicit tag.
///
/// Zero `offset` and zero `count` stay zero bytes.
pub fn encode_with_tag(tag: u32, opcode: u32, offset: u32, count: u16) -> CommandFrame {
    let mut frame = frame_with_tag(tag);
    if offset != 0 {
        BigEndian::write_u32(&mut frame[CMD_LBA_OFFSET..], offset);
    }
    if count != 0 {
        BigEndian::write_u16(&mut frame[CMD_COUNT_OFFSET..], count);
    }
    BigEndian::write_u32(&mut frame[CMD_OPCODE_OFFSET..], opcode);
    frame
}

/// Build a command frame with a fresh random tag.
pub fn encode(opcode: u32, offset: u32, count: u16) -> CommandFrame {
    encode_with_tag(rand::random(), opcode, offset, count)
}

/// Reset frame: the flag byte at 16 selects the reboot target.
pub fn encode_reset(flag: u8) -> CommandFrame {
    let mut frame = frame_with_tag(rand::random());
    BigEndian::write_u32(&mut frame[CMD_OPCODE_OFFSET..], CMD_RESET_DEVICE);
    frame[CMD_FLAG_OFFSET] = flag;
    frame
}

/// Execute-from-SDRAM frame. Both addresses are relative to the SDRAM base;
/// the parameter address overlaps the count field.
pub fn encode_exec(kernel: u32, params: u32) -> CommandFrame {
    let mut frame = frame_with_tag(rand::random());
    if kernel != 0 {
        BigEndian::write_u32(&mut frame[CMD_LBA_OFFSET..], kernel);
    }
    if params != 0 {
        BigEndian::write_u32(&mut frame[CMD_COUNT_OFFSET..], params);
    }
    BigEndian::write_u32(&mut frame[CMD_OPCODE_OFFSET..], CMD_EXECUTE_SDRAM);
    frame
}

/// Fields of a command frame as the device sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCommand {
    pub tag: u32,
    pub opcode: u32,
    pub flag: u8,
    pub offset: u32,
    pub count: u16,
}

/// Parse a command frame. Returns `None` unless it is 31 bytes with the
/// `USBC` signature.
pub fn decode(frame: &[u8]) -> Option<DecodedCommand> {
    if frame.len() != CMD_FRAME_SIZE || &frame[..4] != CMD_SIGNATURE {
        return None;
    }
    Some(DecodedCommand {
        tag: BigEndian::read_u32(&frame[CMD_TAG_OFFSET..]),
        opcode: BigEndian::read_u32(&frame[CMD_OPCODE_OFFSET..]),
        flag: frame[CMD_FLAG_OFFSET],
        offset: BigEndian::read_u32(&frame[CMD_LBA_OFFSET..]),
        count: BigEndian::read_u16(&frame[CMD_COUNT_OFFSET..]),
    })
}

/// Validate an inbound status frame.
pub fn decode_status(frame: &[u8]) -> Result<(), ProtocolError> {
    if frame.len() != STATUS_FRAME_SIZE {
        return Err(ProtocolError::BadStatus {
            expected: STATUS_FRAME_SIZE,
            actual: frame.len(),
        });
    }
    Ok(())
}
