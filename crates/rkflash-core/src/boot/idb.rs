//! Initial Disk Block image builder and loader installation.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{info, instrument, warn};

use super::package::{BootPackage, EntryKind, FLASH_BOOT, FLASH_DATA};
use crate::error::{FormatError, Result};
use crate::events::FlashObserver;
use crate::protocol::constants::*;
use crate::rc4;
use crate::session::DeviceSession;
use crate::transport::UsbTransport;

pub const IDB_TAG: u32 = 0x0ff0_aa55;
/// The boot ROM always reads 1024 sectors of IDB. Not known to vary
/// between chip families.
pub const IDB_SECTORS: usize = 1024;
pub const IDB_SIZE: usize = IDB_SECTORS * SECTOR_SIZE;
/// LBA the IDB image is written to.
pub const IDB_LBA: u32 = 0x40;
/// Boot code starts at sector 4 of the image.
pub const IDB_BOOT_SECTOR: u16 = 4;
pub const IDB_PAYLOAD_OFFSET: usize = IDB_BOOT_SECTOR as usize * SECTOR_SIZE;
/// Payload is stored decoded, so the ROM must not RC4 it again.
const IDB_RC4_DISABLED: u32 = 1;

const OFF_RC4_FLAG: usize = 8;
const OFF_BOOTCODE1: usize = 12;
const OFF_BOOTCODE2: usize = 14;
const OFF_BOOTDATA_SIZE: usize = 506;
const OFF_BOOTCODE_SIZE: usize = 508;

fn sectors(bytes: usize) -> u16 {
    bytes.div_ceil(SECTOR_SIZE) as u16
}

/// Lay out a 1024-sector IDB image from decoded `FlashData` and `FlashBoot`.
pub fn build_idb(flash_data: &[u8], flash_boot: &[u8]) -> std::result::Result<Vec<u8>, FormatError> {
    let payload = flash_data.len() + flash_boot.len();
    let max = IDB_SIZE - IDB_PAYLOAD_OFFSET;
    if payload > max {
        return Err(FormatError::Oversize {
            what: "IDB payload",
            size: payload,
            max,
        });
    }

    let mut image = vec![0u8; IDB_SIZE];
    {
        let sector0 = &mut image[..SECTOR_SIZE];
        LittleEndian::write_u32(&mut sector0[0..4], IDB_TAG);
        LittleEndian::write_u32(&mut sector0[OFF_RC4_FLAG..], IDB_RC4_DISABLED);
        LittleEndian::write_u16(&mut sector0[OFF_BOOTCODE1..], IDB_BOOT_SECTOR);
        LittleEndian::write_u16(&mut sector0[OFF_BOOTCODE2..], IDB_BOOT_SECTOR);
        LittleEndian::write_u16(&mut sector0[OFF_BOOTDATA_SIZE..], sectors(flash_data.len()));
        LittleEndian::write_u16(&mut sector0[OFF_BOOTCODE_SIZE..], sectors(payload));
        rc4::rc4_apply(sector0);
    }

    let boot_at = IDB_PAYLOAD_OFFSET + flash_data.len();
    image[IDB_PAYLOAD_OFFSET..boot_at].copy_from_slice(flash_data);
    image[boot_at..boot_at + flash_boot.len()].copy_from_slice(flash_boot);
    Ok(image)
}

/// Build the IDB image for a parsed package. A missing sub-image becomes an
/// empty segment.
pub fn build_idb_from_package(package: &BootPackage) -> std::result::Result<Vec<u8>, FormatError> {
    let segment = |name: &str| match package.loader(name) {
        Some(entry) => entry.data.as_slice(),
        None => {
            warn!("Boot package has no {} entry, using an empty segment", name);
            &[]
        }
    };
    build_idb(segment(FLASH_DATA), segment(FLASH_BOOT))
}

impl<T: UsbTransport, O: FlashObserver> DeviceSession<T, O> {
    /// Write the package's loader to the IDB area at LBA 0x40.
    ///
    /// The image is built completely before anything is written.
    #[instrument(skip(self, package))]
    pub fn install_loader(&mut self, package: &BootPackage) -> Result<()> {
        let image = build_idb_from_package(package)?;
        info!(lba = %format!("0x{:x}", IDB_LBA), sectors = IDB_SECTORS, "Installing loader");
        self.write_flash(IDB_LBA, IDB_SECTORS as u32, &mut image.as_slice())?;
        Ok(())
    }

    /// Bring a maskrom device up: upload the first 0x471 entry, then the
    /// first 0x472 entry, waiting each entry's delay in between.
    #[instrument(skip(self, package))]
    pub fn download_boot(&mut self, package: &BootPackage) -> Result<()> {
        for (kind, code, label) in [
            (EntryKind::Code471, LOAD_CODE_471, "471"),
            (EntryKind::Code472, LOAD_CODE_472, "472"),
        ] {
            let entry = package
                .first(kind)
                .ok_or(FormatError::MissingEntry(label))?;
            info!(name = %entry.name, size = entry.data.len(), "Downloading {}", label);
            self.load_vendor_code(code, &entry.data)?;
            if entry.data_delay > 0 {
                std::thread::sleep(std::time::Duration::from_millis(entry.data_delay as u64));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::package::testing::build;
    use super::*;
    use crate::session::ToolConfig;
    use crate::transport::MockTransport;

    #[test]
    fn test_idb_layout() {
        let data = vec![0xdau8; 512];
        let boot = vec![0xb0u8; 1024];
        let image = build_idb(&data, &boot).unwrap();

        assert_eq!(image.len(), 1024 * 512);
        assert_eq!(&image[2048..2560], &data[..]);
        assert_eq!(&image[2560..3584], &boot[..]);
        assert!(image[3584..].iter().all(|&b| b == 0));

        let mut sector0 = image[..512].to_vec();
        rc4::rc4_apply(&mut sector0);
        assert_eq!(LittleEndian::read_u32(&sector0[0..4]), IDB_TAG);
        assert_eq!(LittleEndian::read_u32(&sector0[8..12]), 1);
        assert_eq!(LittleEndian::read_u16(&sector0[12..14]), 4);
        assert_eq!(LittleEndian::read_u16(&sector0[14..16]), 4);
        assert_eq!(LittleEndian::read_u16(&sector0[506..508]), 1);
        assert_eq!(LittleEndian::read_u16(&sector0[508..510]), 3);
    }

    #[test]
    fn test_idb_sizes_round_up() {
        let image = build_idb(&[1u8; 513], &[2u8; 10]).unwrap();
        let mut sector0 = image[..512].to_vec();
        rc4::rc4_apply(&mut sector0);
        assert_eq!(LittleEndian::read_u16(&sector0[506..508]), 2);
        assert_eq!(LittleEndian::read_u16(&sector0[508..510]), 2);
    }

    #[test]
    fn test_idb_oversize_rejected() {
        let big = vec![0u8; IDB_SIZE];
        assert!(matches!(
            build_idb(&big, &[]),
            Err(FormatError::Oversize { .. })
        ));
    }

    #[test]
    fn test_missing_segment_is_empty() {
        let data = vec![7u8; 600];
        let file = build(&[(EntryKind::Loader, FLASH_DATA, &data[..])]);
        let pkg = BootPackage::parse(&file).unwrap();
        let image = build_idb_from_package(&pkg).unwrap();
        assert_eq!(image.len(), IDB_SIZE);
        assert_eq!(&image[2048..2648], &data[..]);
    }

    #[test]
    fn test_install_loader_writes_at_0x40() {
        let data = vec![0x10u8; 512];
        let boot = vec![0x20u8; 1024];
        let file = build(&[
            (EntryKind::Loader, FLASH_DATA, &data[..]),
            (EntryKind::Loader, FLASH_BOOT, &boot[..]),
        ]);
        let pkg = BootPackage::parse(&file).unwrap();

        let mock = MockTransport::new();
        let config = ToolConfig {
            block_size: 0x4000,
            unit_ready_delay_ms: 0,
            ..Default::default()
        };
        let mut session = DeviceSession::new(mock.clone(), config);
        session.install_loader(&pkg).unwrap();

        assert_eq!(mock.flash(IDB_LBA + 4, 1), data);
        assert_eq!(mock.flash(IDB_LBA + 5, 2), boot);
    }

    #[test]
    fn test_download_boot_order() {
        let ddr = vec![1u8; 100];
        let plug = vec![2u8; 5000];
        let file = build(&[
            (EntryKind::Code471, "ddr", &ddr[..]),
            (EntryKind::Code472, "usbplug", &plug[..]),
        ]);
        let pkg = BootPackage::parse(&file).unwrap();

        let mock = MockTransport::new().with_ids(0x330c, USB_MODE_MASKROM);
        let mut session = DeviceSession::new(mock.clone(), ToolConfig::default());
        session.download_boot(&pkg).unwrap();

        let indices: Vec<u16> = mock.vendor_uploads().iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0x471, 0x472, 0x472]);
    }

    #[test]
    fn test_download_boot_requires_471() {
        let file = build(&[(EntryKind::Code472, "usbplug", &[0u8; 8][..])]);
        let pkg = BootPackage::parse(&file).unwrap();
        let mut session = DeviceSession::new(MockTransport::new(), ToolConfig::default());
        assert!(session.download_boot(&pkg).is_err());
    }
}
