//! RockChip checksums.
//!
//! The boot ROM and loaders use two non-reflected CRCs:
//! - CRC32 with polynomial `0x04C10DB7`, zero init, no final XOR
//!   (parameter blocks).
//! - CRC16-CCITT with init `0xFFFF` (vendor code uploaded in maskrom mode).

use crc::{Algorithm, CRC_16_IBM_3740, CRC_32_MPEG_2, Crc};

const CRC_32_ROCKCHIP: Algorithm<u32> = Algorithm {
    poly: 0x04c1_0db7,
    init: 0,
    ..CRC_32_MPEG_2
};

/// CRC32 engine used for parameter blocks.
pub const RK_CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ROCKCHIP);

/// CRC16 engine used for vendor code.
pub const RK_CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// RockChip CRC32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    RK_CRC32.checksum(data)
}

/// RockChip CRC16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    RK_CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bitwise reference, one byte at a time, MSB first.
    fn crc32_reference(data: &[u8]) -> u32 {
        let mut crc = 0u32;
        for &b in data {
            crc ^= (b as u32) << 24;
            for _ in 0..8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ 0x04c1_0db7
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    fn crc16_reference(data: &[u8]) -> u16 {
        let mut crc = 0xffffu16;
        for &b in data {
            crc ^= (b as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ 0x1021
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    #[test]
    fn test_crc32_matches_reference() {
        let data = b"mtdparts=rk29xxnand:0x00002000@0x00002000(misc)";
        assert_eq!(crc32(data), crc32_reference(data));
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc16_matches_reference() {
        let data: Vec<u8> = (0..=255u8).collect();
        assert_eq!(crc16(&data), crc16_reference(&data));
        assert_eq!(crc16(b"123456789"), 0x29b1);
    }

    #[test]
    fn test_checksums_are_deterministic() {
        let data = vec![0xa5u8; 4096];
        assert_eq!(crc32(&data), crc32(&data.clone()));
        assert_eq!(crc16(&data), crc16(&data.clone()));
        assert_ne!(crc32(&data[..4095]), crc32(&data));
    }
}
