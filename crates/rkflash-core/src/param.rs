//! Redundant parameter block.
//!
//! Layout: `"PARM"`, LE32 payload length, payload, LE32 RockChip CRC32 of
//! the payload. The same block is stored at eight offsets so that every
//! boot-loader generation finds a copy.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{info, instrument, warn};

use crate::checksum;
use crate::error::{FormatError, Result};
use crate::events::{FlashEvent, FlashObserver, Operation};
use crate::protocol::constants::*;
use crate::session::DeviceSession;
use crate::transport::UsbTransport;

pub const PARAM_MAGIC: &[u8; 4] = b"PARM";
pub const PARAM_HEADER_SIZE: usize = 8;
pub const PARAM_CRC_SIZE: usize = 4;

/// Sector offsets of the redundant copies.
pub const PARAM_OFFSETS: [u32; 8] = [
    0x0000, 0x0400, 0x0800, 0x0c00, 0x1000, 0x1400, 0x1800, 0x1c00,
];

/// Declared payload length of a raw block, bounded by the protocol maximum.
pub fn check_length(block: &[u8]) -> std::result::Result<usize, FormatError> {
    if block.len() < PARAM_HEADER_SIZE {
        return Err(FormatError::Truncated {
            what: "parameter block",
            needed: PARAM_HEADER_SIZE,
            actual: block.len(),
        });
    }
    let length = LittleEndian::read_u32(&block[4..8]) as usize;
    if length > MAX_PARAM_LENGTH {
        return Err(FormatError::BadLength {
            what: "parameter",
            length,
            max: MAX_PARAM_LENGTH,
        });
    }
    Ok(length)
}

/// Largest payload that fits one block together with header and CRC.
pub fn max_payload(block_size: usize) -> usize {
    block_size
        .saturating_sub(PARAM_HEADER_SIZE + PARAM_CRC_SIZE)
        .min(MAX_PARAM_LENGTH)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBlock {
    payload: Vec<u8>,
}

impl ParameterBlock {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn crc(&self) -> u32 {
        checksum::crc32(&self.payload)
    }

    /// Encode into one zero-filled block of `block_size` bytes.
    pub fn encode(&self, block_size: usize) -> std::result::Result<Vec<u8>, FormatError> {
        let max = max_payload(block_size);
        if self.payload.len() > max {
            return Err(FormatError::Oversize {
                what: "parameter payload",
                size: self.payload.len(),
                max,
            });
        }
        let len = self.payload.len();
        let mut block = vec![0u8; block_size];
        block[..4].copy_from_slice(PARAM_MAGIC);
        LittleEndian::write_u32(&mut block[4..8], len as u32);
        block[PARAM_HEADER_SIZE..PARAM_HEADER_SIZE + len].copy_from_slice(&self.payload);
        LittleEndian::write_u32(&mut block[PARAM_HEADER_SIZE + len..], self.crc());
        Ok(block)
    }

    /// Decode and CRC-check a raw block.
    pub fn decode(block: &[u8]) -> std::result::Result<Self, FormatError> {
        let length = check_length(block)?;
        let end = PARAM_HEADER_SIZE + length;
        if end + PARAM_CRC_SIZE > block.len() {
            return Err(FormatError::BadLength {
                what: "parameter",
                length,
                max: max_payload(block.len()),
            });
        }
        if &block[..4] != PARAM_MAGIC {
            warn!(tag = ?&block[..4], "Parameter block without PARM tag");
        }

        let payload = block[PARAM_HEADER_SIZE..end].to_vec();
        let stored = LittleEndian::read_u32(&block[end..]);
        let computed = checksum::crc32(&payload);
        if stored != computed {
            return Err(FormatError::BadCrc { stored, computed });
        }
        Ok(Self { payload })
    }
}

impl<T: UsbTransport, O: FlashObserver> DeviceSession<T, O> {
    /// Fetch and verify the parameter payload from offset 0.
    #[instrument(skip(self))]
    pub fn read_parameters(&mut self) -> Result<Vec<u8>> {
        info!("reading parameters at offset 0x00000000");
        let block = self.block_size();
        self.send_command(CMD_READ_LBA, 0, self.block_sectors() as u16)?;
        self.recv_data(block)?;
        self.recv_status()?;

        let param = ParameterBlock::decode(&self.buf[..block])?;
        info!(size = %format!("0x{:08x}", param.payload().len()), "Parameters read");
        Ok(param.into_payload())
    }

    /// Write `payload` as the parameter block at every redundant offset.
    ///
    /// Payloads longer than one block allows are cut; the returned length
    /// is what was stored.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub fn write_parameters(&mut self, payload: &[u8]) -> Result<usize> {
        let block_size = self.block_size();
        let max = max_payload(block_size);
        let payload = if payload.len() > max {
            let reason = format!("parameter payload cut from {} to {} bytes", payload.len(), max);
            warn!("{}", reason);
            self.emit(FlashEvent::Truncated {
                operation: Operation::WriteParameters,
                reason,
            });
            &payload[..max]
        } else {
            payload
        };

        let block = ParameterBlock::new(payload.to_vec()).encode(block_size)?;
        self.buf[..block_size].copy_from_slice(&block);

        let total = PARAM_OFFSETS.len() as u64;
        for (i, &offset) in PARAM_OFFSETS.iter().enumerate() {
            self.send_command(CMD_WRITE_LBA, offset, self.block_sectors() as u16)?;
            self.send_data(block_size)?;
            self.recv_status()?;
            self.progress(Operation::WriteParameters, offset as u64, i as u64 + 1, total);
        }
        self.emit(FlashEvent::Complete {
            operation: Operation::WriteParameters,
        });
        Ok(payload.len())
    }
}
