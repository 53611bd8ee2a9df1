//! Packed bootloader (`BOOT` tag) parser.
//!
//! A package is a 102-byte header followed by three entry directories:
//! DDR-init code (0x471), USB-plug code (0x472) and loader images. Each
//! 57-byte entry points at its payload inside the same file.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::error::FormatError;
use crate::rc4;

/// `"BOOT"` read as a little-endian u32.
pub const BOOT_TAG: u32 = 0x544f_4f42;
pub const BOOT_HEADER_SIZE: usize = 102;
pub const BOOT_ENTRY_SIZE: usize = 57;
/// UTF-16 code units in an entry name.
pub const BOOT_NAME_LEN: usize = 20;

pub const FLASH_DATA: &str = "FlashData";
pub const FLASH_BOOT: &str = "FlashBoot";

/// Which directory an entry was listed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Code471,
    Code472,
    Loader,
}

impl EntryKind {
    /// Value of the entry's type field for this directory.
    pub fn type_code(self) -> u32 {
        match self {
            EntryKind::Code471 => 1,
            EntryKind::Code472 => 2,
            EntryKind::Loader => 4,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryKind::Code471 => write!(f, "471"),
            EntryKind::Code472 => write!(f, "472"),
            EntryKind::Loader => write!(f, "loader"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReleaseTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl fmt::Display for ReleaseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// One entry directory: count, file offset of the first entry, entry stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Directory {
    pub count: u8,
    pub offset: u32,
    pub entry_size: u8,
}

impl Directory {
    fn read(buf: &[u8]) -> Self {
        Self {
            count: buf[0],
            offset: LittleEndian::read_u32(&buf[1..5]),
            entry_size: buf[5],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootHeader {
    pub size: u16,
    pub version: u32,
    pub merger_version: u32,
    pub release_time: ReleaseTime,
    pub chip_type: u32,
    pub code471: Directory,
    pub code472: Directory,
    pub loader: Directory,
    pub sign_flag: u8,
    pub rc4_flag: u8,
}

impl BootHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < BOOT_HEADER_SIZE {
            return Err(FormatError::Truncated {
                what: "boot header",
                needed: BOOT_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let tag = LittleEndian::read_u32(&buf[0..4]);
        if tag != BOOT_TAG {
            return Err(FormatError::InvalidMagic {
                what: "boot package",
                expected: format!("0x{:08x}", BOOT_TAG),
                actual: format!("0x{:08x}", tag),
            });
        }

        Ok(Self {
            size: LittleEndian::read_u16(&buf[4..6]),
            version: LittleEndian::read_u32(&buf[6..10]),
            merger_version: LittleEndian::read_u32(&buf[10..14]),
            release_time: ReleaseTime {
                year: LittleEndian::read_u16(&buf[14..16]),
                month: buf[16],
                day: buf[17],
                hour: buf[18],
                minute: buf[19],
                second: buf[20],
            },
            chip_type: LittleEndian::read_u32(&buf[21..25]),
            code471: Directory::read(&buf[25..31]),
            code472: Directory::read(&buf[31..37]),
            loader: Directory::read(&buf[37..43]),
            sign_flag: buf[43],
            rc4_flag: buf[44],
        })
    }
}

/// A directory entry together with its decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub kind: EntryKind,
    /// Type field as stored; normally matches `kind`.
    pub entry_type: u32,
    pub name: String,
    pub data_offset: u32,
    pub data_size: u32,
    /// Milliseconds to wait after uploading this entry.
    pub data_delay: u32,
    pub data: Vec<u8>,
}

fn decode_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

impl BootEntry {
    fn parse(file: &[u8], at: usize, kind: EntryKind) -> Result<Self, FormatError> {
        let raw = file.get(at..at + BOOT_ENTRY_SIZE).ok_or(FormatError::Truncated {
            what: "boot entry",
            needed: at + BOOT_ENTRY_SIZE,
            actual: file.len(),
        })?;

        let entry_type = LittleEndian::read_u32(&raw[1..5]);
        let name = decode_name(&raw[5..5 + BOOT_NAME_LEN * 2]);
        let data_offset = LittleEndian::read_u32(&raw[45..49]);
        let data_size = LittleEndian::read_u32(&raw[49..53]);
        let data_delay = LittleEndian::read_u32(&raw[53..57]);

        if entry_type != kind.type_code() {
            warn!(name = %name, entry_type, directory = %kind, "Entry type does not match its directory");
        }

        let start = data_offset as usize;
        let end = start + data_size as usize;
        let mut data = file
            .get(start..end)
            .ok_or(FormatError::Truncated {
                what: "boot entry payload",
                needed: end,
                actual: file.len(),
            })?
            .to_vec();

        match kind {
            EntryKind::Code471 | EntryKind::Code472 => rc4::rc4_apply(&mut data),
            EntryKind::Loader if name == FLASH_DATA || name == FLASH_BOOT => {
                rc4::rc4_apply_chunked(&mut data)
            }
            EntryKind::Loader => {}
        }

        debug!(kind = %kind, name = %name, size = data_size, "Boot entry");
        Ok(Self {
            kind,
            entry_type,
            name,
            data_offset,
            data_size,
            data_delay,
            data,
        })
    }
}

/// A parsed boot package with every payload decoded.
#[derive(Debug, Clone)]
pub struct BootPackage {
    pub header: BootHeader,
    pub entries: Vec<BootEntry>,
}

impl BootPackage {
    pub fn parse(file: &[u8]) -> Result<Self, FormatError> {
        let header = BootHeader::parse(file)?;
        let mut entries = Vec::new();

        for (kind, dir) in [
            (EntryKind::Code471, header.code471),
            (EntryKind::Code472, header.code472),
            (EntryKind::Loader, header.loader),
        ] {
            let stride = if dir.entry_size == 0 {
                BOOT_ENTRY_SIZE
            } else {
                dir.entry_size as usize
            };
            for i in 0..dir.count as usize {
                let at = dir.offset as usize + i * stride;
                entries.push(BootEntry::parse(file, at, kind)?);
            }
        }

        Ok(Self { header, entries })
    }

    /// First entry of `kind`, in directory order.
    pub fn first(&self, kind: EntryKind) -> Option<&BootEntry> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    /// First loader entry named `name`.
    pub fn loader(&self, name: &str) -> Option<&BootEntry> {
        self.entries
            .iter()
            .find(|e| e.kind == EntryKind::Loader && e.name == name)
    }

    pub fn flash_data(&self) -> Option<&BootEntry> {
        self.loader(FLASH_DATA)
    }

    pub fn flash_boot(&self) -> Option<&BootEntry> {
        self.loader(FLASH_BOOT)
    }
}

/// Builds synthetic packages for tests in this crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Lay out a package from `(kind, name, plain payload)` triples, in
    /// directory order. Payloads are encoded the way the packer does it.
    pub fn build(entries: &[(EntryKind, &str, &[u8])]) -> Vec<u8> {
        let count = |k: EntryKind| entries.iter().filter(|e| e.0 == k).count();
        let dir_start = BOOT_HEADER_SIZE;
        let mut data_at = dir_start + entries.len() * BOOT_ENTRY_SIZE;

        let mut file = vec![0u8; data_at];
        LittleEndian::write_u32(&mut file[0..4], BOOT_TAG);
        LittleEndian::write_u16(&mut file[4..6], BOOT_HEADER_SIZE as u16);
        LittleEndian::write_u16(&mut file[14..16], 2014);
        file[16] = 3;
        file[17] = 21;

        let mut at = dir_start;
        for (slot, kind) in [(25, EntryKind::Code471), (31, EntryKind::Code472), (37, EntryKind::Loader)] {
            file[slot] = count(kind) as u8;
            LittleEndian::write_u32(&mut file[slot + 1..slot + 5], at as u32);
            file[slot + 5] = BOOT_ENTRY_SIZE as u8;
            at += count(kind) * BOOT_ENTRY_SIZE;
        }

        let mut at = dir_start;
        for kind in [EntryKind::Code471, EntryKind::Code472, EntryKind::Loader] {
            for (_, name, plain) in entries.iter().filter(|e| e.0 == kind) {
                let entry = &mut file[at..at + BOOT_ENTRY_SIZE];
                entry[0] = BOOT_ENTRY_SIZE as u8;
                LittleEndian::write_u32(&mut entry[1..5], kind.type_code());
                for (i, c) in name.encode_utf16().take(BOOT_NAME_LEN).enumerate() {
                    LittleEndian::write_u16(&mut entry[5 + i * 2..7 + i * 2], c);
                }
                LittleEndian::write_u32(&mut entry[45..49], data_at as u32);
                LittleEndian::write_u32(&mut entry[49..53], plain.len() as u32);
                at += BOOT_ENTRY_SIZE;

                let mut payload = plain.to_vec();
                match kind {
                    EntryKind::Loader if *name == FLASH_DATA || *name == FLASH_BOOT => {
                        rc4::rc4_apply_chunked(&mut payload)
                    }
                    EntryKind::Loader => {}
                    _ => rc4::rc4_apply(&mut payload),
                }
                file.extend_from_slice(&payload);
                data_at += payload.len();
            }
        }
        file
    }
}

#[cfg(test)]
mod tests {
    use super::testing::build;
    use super::*;

    #[test]
    fn test_parse_decodes_payloads() {
        let ddr = vec![0x11u8; 700];
        let plug = vec![0x22u8; 1500];
        let data = vec![0x33u8; 1000];
        let boot = vec![0x44u8; 1300];
        let file = build(&[
            (EntryKind::Code471, "ddr", &ddr[..]),
            (EntryKind::Code472, "usbplug", &plug[..]),
            (EntryKind::Loader, FLASH_DATA, &data[..]),
            (EntryKind::Loader, FLASH_BOOT, &boot[..]),
        ]);

        let pkg = BootPackage::parse(&file).unwrap();
        assert_eq!(pkg.entries.len(), 4);
        assert_eq!(pkg.header.release_time.year, 2014);
        assert_eq!(pkg.first(EntryKind::Code471).unwrap().data, ddr);
        assert_eq!(pkg.first(EntryKind::Code472).unwrap().data, plug);
        assert_eq!(pkg.flash_data().unwrap().data, data);
        assert_eq!(pkg.flash_boot().unwrap().data, boot);
    }

    #[test]
    fn test_other_loader_entries_stay_raw() {
        let raw = vec![0x55u8; 64];
        let file = build(&[(EntryKind::Loader, "Extra", &raw[..])]);
        let pkg = BootPackage::parse(&file).unwrap();
        assert_eq!(pkg.loader("Extra").unwrap().data, raw);
    }

    #[test]
    fn test_first_match_wins() {
        let first = vec![1u8; 10];
        let second = vec![2u8; 10];
        let file = build(&[
            (EntryKind::Loader, FLASH_DATA, &first[..]),
            (EntryKind::Loader, FLASH_DATA, &second[..]),
        ]);
        let pkg = BootPackage::parse(&file).unwrap();
        assert_eq!(pkg.flash_data().unwrap().data, first);
    }

    #[test]
    fn test_rejects_bad_tag_and_truncation() {
        let mut file = build(&[(EntryKind::Code471, "ddr", &[0u8; 16][..])]);
        let truncated = &file[..file.len() - 1];
        assert!(matches!(
            BootPackage::parse(truncated),
            Err(FormatError::Truncated { .. })
        ));

        file[0] = b'X';
        assert!(matches!(
            BootPackage::parse(&file),
            Err(FormatError::InvalidMagic { .. })
        ));
    }
}
