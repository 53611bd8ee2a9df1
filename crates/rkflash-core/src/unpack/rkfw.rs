//! `RKFW` firmware and its embedded `RKAF` update archive.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use super::{ContainerKind, UnpackError, UnpackPlan, c_string, window};
use crate::error::FormatError;

const RKFW_HEADER_SIZE: usize = 0x29;
const RKFW_DATE: usize = 0x0e;
const RKFW_CHIP: usize = 0x15;
const RKFW_BOOT: usize = 0x19;
const RKFW_RKAF: usize = 0x21;

const RKAF_MODEL: usize = 0x08;
const RKAF_MODEL_LEN: usize = 0x22;
const RKAF_MANUFACTURER: usize = 0x48;
const RKAF_MANUFACTURER_LEN: usize = 0x38;
const RKAF_COUNT: usize = 0x88;
const RKAF_ENTRIES: usize = 0x8c;
const RKAF_ENTRY_SIZE: usize = 0x70;

/// Envelope around a `parameter` entry: `PARM` + length, CRC32.
const PARAM_HEAD: u32 = 8;
const PARAM_ENVELOPE: u32 = 12;

/// Chip family from the RKFW chip code.
pub fn chip_family(code: u8) -> Option<&'static str> {
    match code {
        0x50 => Some("rk29xx"),
        0x60 => Some("rk30xx"),
        0x70 => Some("rk31xx"),
        0x80 => Some("rk32xx"),
        0x41 => Some("rk3368"),
        0x38 => Some("rk3588"),
        _ => None,
    }
}

fn region(buf: &[u8], at: usize) -> (usize, usize) {
    (
        LittleEndian::read_u32(&buf[at..at + 4]) as usize,
        LittleEndian::read_u32(&buf[at + 4..at + 8]) as usize,
    )
}

/// One RKAF directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RkafEntry {
    name: String,
    path: String,
    offset: u32,
    flash_offset: u32,
    padded_size: u32,
    size: u32,
}

impl RkafEntry {
    fn parse(raw: &[u8]) -> Self {
        Self {
            name: c_string(&raw[0x00..0x20]),
            path: c_string(&raw[0x20..0x5c]),
            offset: LittleEndian::read_u32(&raw[0x60..0x64]),
            flash_offset: LittleEndian::read_u32(&raw[0x64..0x68]),
            padded_size: LittleEndian::read_u32(&raw[0x68..0x6c]),
            size: LittleEndian::read_u32(&raw[0x6c..0x70]),
        }
    }
}

pub(super) fn plan_firmware(buf: &[u8]) -> Result<UnpackPlan<'_>, UnpackError> {
    if buf.len() < RKFW_HEADER_SIZE {
        return Err(FormatError::Truncated {
            what: "RKFW header",
            needed: RKFW_HEADER_SIZE,
            actual: buf.len(),
        }
        .into());
    }
    let mut plan = UnpackPlan::new(ContainerKind::Firmware);

    plan.meta(
        "version",
        format!(
            "{}.{}.{}",
            buf[9],
            buf[8],
            LittleEndian::read_u16(&buf[6..8])
        ),
    );
    let d = &buf[RKFW_DATE..RKFW_DATE + 7];
    plan.meta(
        "date",
        format!(
            "{}-{:02}-{:02} {:02}:{:02}:{:02}",
            LittleEndian::read_u16(&d[0..2]),
            d[2],
            d[3],
            d[4],
            d[5],
            d[6]
        ),
    );
    let chip = buf[RKFW_CHIP];
    match chip_family(chip) {
        Some(family) => plan.meta("family", family.to_string()),
        None => {
            info!("You got a brand new chip ({:#x}), congratulations!!!", chip);
            plan.meta("family", "unknown".to_string());
        }
    }

    let (boot_off, boot_size) = region(buf, RKFW_BOOT);
    match window(buf, boot_off, boot_size) {
        Some(boot) if boot.starts_with(b"BOOT") => {
            info!(
                "{:08x}-{:08x} {:<26} (size: {})",
                boot_off,
                (boot_off + boot_size).saturating_sub(1),
                "BOOT",
                boot_size
            );
            plan.add("BOOT", boot);
        }
        _ => plan.warn("cannot find BOOT signature... skipping".to_string()),
    }

    let (rkaf_off, rkaf_size) = region(buf, RKFW_RKAF);
    let rkaf = buf.get(rkaf_off..).ok_or(UnpackError::MissingRkaf)?;
    if !rkaf.starts_with(b"RKAF") {
        return Err(UnpackError::MissingRkaf);
    }
    let rkaf = if rkaf_size <= rkaf.len() {
        &rkaf[..rkaf_size]
    } else {
        plan.warn(format!(
            "RKAF declares {} bytes but only {} are present",
            rkaf_size,
            rkaf.len()
        ));
        rkaf
    };
    if rkaf.len() < RKAF_ENTRIES {
        plan.warn("RKAF header is truncated, no files extracted".to_string());
        return Ok(plan);
    }

    let declared = LittleEndian::read_u32(&rkaf[4..8]) as usize + 4;
    if declared != rkaf_size {
        plan.warn(format!(
            "invalid file size {}(should be {} bytes)",
            rkaf_size, declared
        ));
    } else {
        info!("file size matches ({} bytes)", declared);
    }

    plan.meta(
        "manufacturer",
        c_string(&rkaf[RKAF_MANUFACTURER..RKAF_MANUFACTURER + RKAF_MANUFACTURER_LEN]),
    );
    plan.meta("model", c_string(&rkaf[RKAF_MODEL..RKAF_MODEL + RKAF_MODEL_LEN]));

    let count = LittleEndian::read_u32(&rkaf[RKAF_COUNT..RKAF_COUNT + 4]) as usize;
    plan.meta("number of files", count.to_string());

    for i in 0..count {
        let at = RKAF_ENTRIES + i * RKAF_ENTRY_SIZE;
        let Some(raw) = window(rkaf, at, RKAF_ENTRY_SIZE) else {
            plan.warn(format!("directory ends after {} of {} entries", i, count));
            break;
        };
        let entry = RkafEntry::parse(raw);
        debug!(
            name = %entry.name,
            flash_offset = %format!("0x{:08x}", entry.flash_offset),
            padded_size = entry.padded_size,
            "RKAF entry"
        );

        if entry.name == "SELF" || entry.path.starts_with("SELF") {
            info!("skipping SELF entry");
            continue;
        }
        info!(
            "{:08x}-{:08x} {:<26} (size: {})",
            entry.offset,
            (entry.offset as u64 + entry.padded_size as u64).saturating_sub(1),
            entry.path,
            entry.size
        );

        let (mut offset, mut size) = (entry.offset, entry.size);
        if entry.name.starts_with("parameter") {
            if size < PARAM_ENVELOPE {
                plan.warn(format!("{}: parameter entry too small, skipping", entry.path));
                continue;
            }
            offset += PARAM_HEAD;
            size -= PARAM_ENVELOPE;
        }

        match window(rkaf, offset as usize, size as usize) {
            Some(data) => plan.add(&entry.path, data),
            None => plan.warn(format!(
                "{}: content 0x{:08x}+{} lies outside the archive, skipping",
                entry.path, offset, size
            )),
        }
    }
    Ok(plan)
}
