//! Protocol module - RockChip USB service mode definitions.

pub mod command;
pub mod constants;
pub mod info;

pub use command::{CommandFrame, DecodedCommand, ProtocolError};
pub use constants::*;
pub use info::{ChipVersion, FlashId, NandInfo, UsbMode};
