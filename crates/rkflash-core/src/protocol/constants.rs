//! Protocol constants for the RockChip maskrom/loader USB service mode.

// ============================================================================
// Device Identification
// ============================================================================

/// Fuzhou Rockchip Electronics Vendor ID
pub const ROCKCHIP_VENDOR_ID: u16 = 0x2207;

/// Known Product IDs and the SoC family each one identifies.
pub const SOC_TABLE: &[(u16, &str)] = &[
    (0x281a, "RK2818"),
    (0x290a, "RK2918"),
    (0x292a, "RK2928"),
    (0x292c, "RK3026"),
    (0x300a, "RK3066"),
    (0x300b, "RK3168"),
    (0x301a, "RK3036"),
    (0x310a, "RK3066B"),
    (0x310b, "RK3188"),
    (0x310c, "RK312X"), // RK3126 and RK3128
    (0x310d, "RK3126"),
    (0x320a, "RK3288"),
    (0x320b, "RK322X"), // RK3228 and RK3229
    (0x320c, "RK3228H/RK3318/RK3328"),
    (0x330a, "RK3368"),
    (0x330c, "RK3399"),
];

/// Look up the SoC family name for a Product ID.
pub fn soc_name(pid: u16) -> Option<&'static str> {
    SOC_TABLE
        .iter()
        .find(|(p, _)| *p == pid)
        .map(|(_, name)| *name)
}

/// bcdUSB reported while the boot ROM runs (maskrom).
pub const USB_MODE_MASKROM: u16 = 0x0200;
/// bcdUSB reported once a USB loader is running.
pub const USB_MODE_LOADER: u16 = 0x0201;

// ============================================================================
// Endpoints and control requests
// ============================================================================

/// Bulk OUT endpoint (commands and outbound data).
pub const EP_OUT: u8 = 0x02;
/// Bulk IN endpoint (inbound data and status).
pub const EP_IN: u8 = 0x81;

/// Vendor control request used to upload DDR init / USB plug code.
pub const VENDOR_REQUEST_LOAD: u8 = 12;
/// Maximum payload of one vendor control transfer.
pub const VENDOR_CHUNK_SIZE: usize = 4096;
/// Vendor code is zero-padded to a multiple of this.
pub const VENDOR_CODE_ALIGN: usize = 2048;

/// Load code for the DDR init blob.
pub const LOAD_CODE_471: u16 = 0x471;
/// Load code for the USB plug (loader) blob.
pub const LOAD_CODE_472: u16 = 0x472;

// ============================================================================
// Frame layout
// ============================================================================

pub const CMD_FRAME_SIZE: usize = 31;
pub const STATUS_FRAME_SIZE: usize = 13;
pub const CMD_SIGNATURE: &[u8; 4] = b"USBC";

pub const CMD_TAG_OFFSET: usize = 4;
pub const CMD_OPCODE_OFFSET: usize = 12;
pub const CMD_FLAG_OFFSET: usize = 16;
pub const CMD_LBA_OFFSET: usize = 17;
pub const CMD_COUNT_OFFSET: usize = 22;

// ============================================================================
// Sizes
// ============================================================================

pub const SECTOR_SIZE: usize = 512;

/// Default transfer unit. Must be a multiple of [`SECTOR_SIZE`].
pub const DEFAULT_BLOCK_SIZE: usize = 0x200;

/// Raw IDB sector: 512 data bytes + 16 spare bytes.
pub const IDB_SECTOR_SIZE: usize = 0x210;
/// Raw IDB sectors read per command.
pub const IDB_READ_INCR: u32 = 0x20;

/// Largest payload a loader accepts in a parameter block
/// (`MAX_LOADER_PARAM` in the RockChip loader).
pub const MAX_PARAM_LENGTH: usize = 128 * 512 - 12;

/// Physical address the loader maps to offset zero for SDRAM commands.
pub const SDRAM_BASE_ADDRESS: u32 = 0x6000_0000;

/// Replies to READ_CHIP_INFO / READ_FLASH_ID / READ_FLASH_INFO.
pub const CHIP_INFO_SIZE: usize = 16;
pub const FLASH_ID_SIZE: usize = 5;
pub const FLASH_INFO_SIZE: usize = 512;

// ============================================================================
// Opcodes
// ============================================================================

pub const CMD_TEST_UNIT_READY: u32 = 0x8000_0600;
pub const CMD_READ_FLASH_ID: u32 = 0x8000_0601;
pub const CMD_READ_FLASH_INFO: u32 = 0x8000_061a;
pub const CMD_READ_CHIP_INFO: u32 = 0x8000_061b;

pub const CMD_RESET_DEVICE: u32 = 0x0000_06ff;

pub const CMD_READ_SECTOR: u32 = 0x8000_0a04;
pub const CMD_READ_LBA: u32 = 0x8000_0a14;
pub const CMD_READ_SDRAM: u32 = 0x8000_0a17;

pub const CMD_WRITE_SECTOR: u32 = 0x0000_0a05;
pub const CMD_WRITE_LBA: u32 = 0x0000_0a15;
pub const CMD_WRITE_SDRAM: u32 = 0x0000_0a18;
pub const CMD_EXECUTE_SDRAM: u32 = 0x0000_0a19;
pub const CMD_ERASE_SECTORS: u32 = 0x0000_0a25;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soc_lookup() {
        assert_eq!(soc_name(0x330c), Some("RK3399"));
        assert_eq!(soc_name(0x310c), Some("RK312X"));
        assert_eq!(soc_name(0x0000), None);
    }

    #[test]
    fn test_default_block_size_is_sector_multiple() {
        assert_eq!(DEFAULT_BLOCK_SIZE % SECTOR_SIZE, 0);
    }
}
