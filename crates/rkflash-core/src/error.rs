//! Error taxonomy shared by the device-facing modules.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Malformed or inconsistent on-device / on-disk data.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid {what} magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("Bad CRC: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    BadCrc { stored: u32, computed: u32 },
    #[error("Bad {what} length: {length} (max {max})")]
    BadLength {
        what: &'static str,
        length: usize,
        max: usize,
    },
    #[error("{what} truncated: need {needed} bytes, have {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("{what} too large: {size} bytes (max {max})")]
    Oversize {
        what: &'static str,
        size: usize,
        max: usize,
    },
    #[error("Invalid {what}: {value}")]
    InvalidField { what: &'static str, value: u64 },
    #[error("Boot package has no {0} entry")]
    MissingEntry(&'static str),
    #[error("'mtdparts' not found in command line")]
    MissingMtdparts,
    #[error("Partition '{0}' not found")]
    PartitionNotFound(String),
    #[error("Bad syntax in mtdparts: {0}")]
    BadPartitionSyntax(String),
}

/// Any failure of a device-targeted operation.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Format(#[from] FormatError),
    /// Local input could not be read.
    #[error("Input error: {0}")]
    Input(#[source] std::io::Error),
    /// Local output could not be written.
    #[error("Output error: {0}")]
    Output(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
