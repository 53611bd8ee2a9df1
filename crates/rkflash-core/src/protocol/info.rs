//! Device information replies and identification.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::command::ProtocolError;
use super::constants::*;

/// NAND manufacturers, indexed by `manufacturer_id`.
pub const NAND_MANUFACTURERS: &[&str] = &[
    "Samsung", "Toshiba", "Hynix", "Infineon", "Micron", "Renesas", "Intel", "UNKNOWN", "SanDisk",
];

/// Protocol mode, derived from the bcdUSB field of the device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMode {
    Maskrom,
    Loader,
    Unknown(u16),
}

impl UsbMode {
    pub fn from_bcd(bcd: u16) -> Self {
        match bcd {
            USB_MODE_MASKROM => UsbMode::Maskrom,
            USB_MODE_LOADER => UsbMode::Loader,
            other => UsbMode::Unknown(other),
        }
    }
}

impl fmt::Display for UsbMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbMode::Maskrom => write!(f, "MASK ROM MODE"),
            UsbMode::Loader => write!(f, "LOADER MODE"),
            UsbMode::Unknown(bcd) => write!(f, "unknown mode (bcdUSB {:04x})", bcd),
        }
    }
}

/// Reply to READ_FLASH_INFO (512 bytes, little-endian fields).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NandInfo {
    /// Total size in sectors.
    pub flash_size: u32,
    /// Erase block size in sectors.
    pub block_size: u16,
    /// Page size in sectors.
    pub page_size: u8,
    pub ecc_bits: u8,
    pub access_time: u8,
    pub manufacturer_id: u8,
    /// Bitmask of populated chip selects.
    pub chip_select: u8,
}

impl NandInfo {
    pub const MIN_SIZE: usize = 11;

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::ShortTransfer {
                expected: Self::MIN_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            flash_size: LittleEndian::read_u32(&data[0..4]),
            block_size: LittleEndian::read_u16(&data[4..6]),
            page_size: data[6],
            ecc_bits: data[7],
            access_time: data[8],
            manufacturer_id: data[9],
            chip_select: data[10],
        })
    }

    pub fn to_bytes(&self) -> [u8; FLASH_INFO_SIZE] {
        let mut out = [0u8; FLASH_INFO_SIZE];
        LittleEndian::write_u32(&mut out[0..4], self.flash_size);
        LittleEndian::write_u16(&mut out[4..6], self.block_size);
        out[6] = self.page_size;
        out[7] = self.ecc_bits;
        out[8] = self.access_time;
        out[9] = self.manufacturer_id;
        out[10] = self.chip_select;
        out
    }

    pub fn manufacturer(&self) -> &'static str {
        NAND_MANUFACTURERS
            .get(self.manufacturer_id as usize)
            .copied()
            .unwrap_or("Unknown")
    }

    /// Populated chip selects, in order.
    pub fn chip_selects(&self) -> Vec<u8> {
        (0..4).filter(|cs| self.chip_select & (1 << cs) != 0).collect()
    }
}

impl fmt::Display for NandInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Flash Info:")?;
        writeln!(
            f,
            "  Manufacturer: {} ({})",
            self.manufacturer(),
            self.manufacturer_id
        )?;
        writeln!(f, "  Flash Size:   {}MB", self.flash_size >> 11)?;
        writeln!(f, "  Block Size:   {}KB", self.block_size >> 1)?;
        writeln!(f, "  Page Size:    {}KB", self.page_size >> 1)?;
        writeln!(f, "  ECC Bits:     {}", self.ecc_bits)?;
        writeln!(f, "  Access Time:  {}", self.access_time)?;
        write!(f, "  Flash CS:    ")?;
        for cs in self.chip_selects() {
            write!(f, " <{}>", cs)?;
        }
        Ok(())
    }
}

/// Reply to READ_FLASH_ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashId(pub [u8; FLASH_ID_SIZE]);

impl fmt::Display for FlashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e] = self.0;
        write!(f, "{:02x} {:02x} {:02x} {:02x} {:02x}", a, b, c, d, e)
    }
}

/// Reply to READ_CHIP_INFO: four little-endian ASCII words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipVersion(pub [u8; CHIP_INFO_SIZE]);

impl fmt::Display for ChipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chars: Vec<char> = self
            .0
            .chunks(4)
            .flat_map(|word| word.iter().rev().map(|&b| b as char))
            .collect();
        let group = |r: std::ops::Range<usize>| chars[r].iter().collect::<String>();
        write!(
            f,
            "{}-{}.{}.{}-{}",
            group(0..4),
            group(4..8),
            group(8..10),
            group(10..12),
            group(12..16)
        )
    }
}
