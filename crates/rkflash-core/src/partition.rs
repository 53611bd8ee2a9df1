//! `mtdparts=` partition lookup.
//!
//! The partition table lives in the kernel command line stored in the
//! parameter block, e.g.
//! `mtdparts=rk29xxnand:0x2000@0x2000(boot),-@0x4000(userdata)`.
//! Offsets and sizes are in sectors.

use tracing::{debug, info, instrument};

use crate::error::{FormatError, Result};
use crate::events::FlashObserver;
use crate::param::{PARAM_HEADER_SIZE, check_length};
use crate::protocol::constants::*;
use crate::session::DeviceSession;
use crate::transport::UsbTransport;

const MTDPARTS: &str = "mtdparts=";

/// Where a partition's size comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    Sectors(u32),
    /// `-@offset`: the partition runs to the end of the device.
    ToEnd,
}

/// A partition located in the command line, before the device size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpec {
    pub offset: u32,
    pub size: PartitionSize,
}

impl PartitionSpec {
    /// Resolve to `(offset, size)` against the device's total sector count.
    pub fn resolve(&self, total_sectors: u32) -> (u32, u32) {
        let size = match self.size {
            PartitionSize::Sectors(n) => n,
            PartitionSize::ToEnd => total_sectors.saturating_sub(self.offset),
        };
        (self.offset, size)
    }
}

/// Parse an unsigned integer prefix the way C `strtoul(s, NULL, 0)` does:
/// leading whitespace is skipped, `0x` selects hex, a leading `0` octal,
/// anything else decimal. Parsing stops at the first invalid digit and an
/// empty digit run yields 0.
pub fn parse_c_number(s: &str) -> u32 {
    let s = s.trim_start();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    digits
        .chars()
        .map_while(|c| c.to_digit(radix))
        .fold(0u32, |acc, d| acc.wrapping_mul(radix).wrapping_add(d))
}

/// Strict variant of [`parse_c_number`]: the whole string must be a number.
pub fn parse_number(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

/// Find partition `name` in a command line.
///
/// Only the exact `(name)` form matches. The text before it is searched for
/// the last `@` (offset) and then, within the last list item, for a `-`
/// (runs to end), otherwise the size after the last `,` or, for the first
/// partition, after the `:`.
pub fn find_partition(cmdline: &str, name: &str) -> std::result::Result<PartitionSpec, FormatError> {
    let start = cmdline.find(MTDPARTS).ok_or(FormatError::MissingMtdparts)?;
    let mtdparts = &cmdline[start..];

    let pattern = format!("({})", name);
    let end = mtdparts
        .find(&pattern)
        .ok_or_else(|| FormatError::PartitionNotFound(name.to_string()))?;
    let head = &mtdparts[..end];

    let at = head
        .rfind('@')
        .ok_or_else(|| FormatError::BadPartitionSyntax("missing '@' before partition name".into()))?;
    let offset = parse_c_number(&head[at + 1..]);
    let head = &head[..at];

    let comma = head.rfind(',');
    let colon = head.rfind(':');
    let item_start = comma.max(colon).map(|i| i + 1).unwrap_or(0);

    let size = if head[item_start..].contains('-') {
        PartitionSize::ToEnd
    } else if let Some(i) = comma {
        PartitionSize::Sectors(parse_c_number(&head[i + 1..]))
    } else if let Some(i) = colon {
        PartitionSize::Sectors(parse_c_number(&head[i + 1..]))
    } else {
        return Err(FormatError::BadPartitionSyntax(
            "bad syntax for partition size".into(),
        ));
    };

    Ok(PartitionSpec { offset, size })
}

/// Resolve partition `name` against a parameter payload and device size.
pub fn resolve_in(
    cmdline: &str,
    name: &str,
    total_sectors: u32,
) -> std::result::Result<(u32, u32), FormatError> {
    Ok(find_partition(cmdline, name)?.resolve(total_sectors))
}

/// The NUL-terminated text of a parameter payload.
pub(crate) fn payload_text(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

impl<T: UsbTransport, O: FlashObserver> DeviceSession<T, O> {
    /// Look up a partition by name in the device's parameter block.
    ///
    /// Returns `(offset, size)` in sectors. NAND info is only queried for
    /// partitions that run to the end of the device.
    #[instrument(skip(self))]
    pub fn resolve_partition(&mut self, name: &str) -> Result<(u32, u32)> {
        info!("working with partition: {}", name);

        let block = self.block_size();
        self.send_command(CMD_READ_LBA, 0, self.block_sectors() as u16)?;
        self.recv_data(block)?;
        self.recv_status()?;

        let length = check_length(&self.buf[..block])?;
        let end = (PARAM_HEADER_SIZE + length).min(block);
        let text = payload_text(&self.buf[PARAM_HEADER_SIZE..end]);

        let spec = find_partition(&text, name)?;
        debug!(offset = %format!("{:#010x}", spec.offset), "found offset");

        let total = match spec.size {
            PartitionSize::Sectors(_) => 0,
            PartitionSize::ToEnd => {
                let nand = self.read_nand_info()?;
                info!("partition extends up to the end of NAND");
                nand.flash_size
            }
        };
        let (offset, size) = spec.resolve(total);
        info!(
            offset = %format!("{:#010x}", offset),
            size = %format!("{:#010x}", size),
            "Partition resolved"
        );
        Ok((offset, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::param::ParameterBlock;
    use crate::session::ToolConfig;
    use crate::transport::MockTransport;

    const CMDLINE: &str = "CMDLINE:console=ttyS1 mtdparts=mtd-nand0:0x00002000@0x00002000(bootloader),0x00001000@0x00004000(misc),-@0x00005000(userdata)";

    #[test]
    fn test_resolve_examples() {
        let total = 0x0010_0000;
        assert_eq!(resolve_in(CMDLINE, "misc", total).unwrap(), (0x4000, 0x1000));
        assert_eq!(
            resolve_in(CMDLINE, "userdata", total).unwrap(),
            (0x5000, total - 0x5000)
        );
        assert_eq!(
            resolve_in(CMDLINE, "bootloader", total).unwrap(),
            (0x2000, 0x2000)
        );
        assert!(matches!(
            resolve_in(CMDLINE, "nonexistent", total),
            Err(FormatError::PartitionNotFound(_))
        ));
    }

    #[test]
    fn test_requires_parenthesized_name() {
        // "boot" is a substring of "bootloader" but not "(boot)".
        assert!(matches!(
            resolve_in(CMDLINE, "boot", 0),
            Err(FormatError::PartitionNotFound(_))
        ));
    }

    #[test]
    fn test_missing_mtdparts_and_bad_syntax() {
        assert!(matches!(
            resolve_in("console=ttyS0", "misc", 0),
            Err(FormatError::MissingMtdparts)
        ));
        assert!(matches!(
            resolve_in("mtdparts=0x100(misc)", "misc", 0),
            Err(FormatError::BadPartitionSyntax(_))
        ));
        assert!(matches!(
            resolve_in("mtdparts=0x100@0x200(misc)", "misc", 0),
            Err(FormatError::BadPartitionSyntax(_))
        ));
    }

    #[test]
    fn test_c_number_rules() {
        assert_eq!(parse_c_number("0x1f)"), 0x1f);
        assert_eq!(parse_c_number("010"), 8);
        assert_eq!(parse_c_number("42abc"), 42);
        assert_eq!(parse_c_number("0"), 0);
        assert_eq!(parse_c_number(""), 0);

        assert_eq!(parse_number("0x60000000"), Some(0x6000_0000));
        assert_eq!(parse_number("0755"), Some(0o755));
        assert_eq!(parse_number("12"), Some(12));
        assert_eq!(parse_number("12k"), None);
    }

    #[test]
    fn test_resolve_on_device() {
        let mock = MockTransport::new();
        let block = ParameterBlock::new(CMDLINE.as_bytes().to_vec());
        mock.set_flash(0, &block.encode(DEFAULT_BLOCK_SIZE).unwrap());

        let config = ToolConfig {
            unit_ready_delay_ms: 0,
            ..Default::default()
        };
        let mut session = DeviceSession::new(mock.clone(), config);
        assert_eq!(session.resolve_partition("misc").unwrap(), (0x4000, 0x1000));

        // Mock flash is 0x10000 sectors.
        assert_eq!(
            session.resolve_partition("userdata").unwrap(),
            (0x5000, 0x10000 - 0x5000)
        );
        assert!(matches!(
            session.resolve_partition("nope").unwrap_err(),
            Error::Format(FormatError::PartitionNotFound(_))
        ));
    }
}
