//! Single-image containers: `KRNL`, `LOADER  ` and `RSCE`.

use byteorder::{ByteOrder, LittleEndian};

use super::{ContainerKind, UnpackError, UnpackPlan, c_string, window};
use crate::error::FormatError;

const KRNL_HEADER: usize = 8;
const KRNL_TRAILER: usize = 4;

/// The loader header is always 2048 bytes, signature area included.
const LOADER_HEADER_SIZE: usize = 2048;

const BLOCK: usize = 512;
const RSCE_HEADER_SIZE: usize = 16;
const ENTR_PATH_LEN: usize = 256;
const ENTR_SIZE: usize = 4 + ENTR_PATH_LEN + 8;

fn truncated(what: &'static str, needed: usize, actual: usize) -> UnpackError {
    FormatError::Truncated {
        what,
        needed,
        actual,
    }
    .into()
}

/// `KRNL`: the payload sits between an 8-byte header and a 4-byte CRC.
pub(super) fn plan_kernel<'a>(buf: &'a [u8], output: &str) -> Result<UnpackPlan<'a>, UnpackError> {
    let needed = KRNL_HEADER + KRNL_TRAILER;
    if buf.len() < needed {
        return Err(truncated("KRNL image", needed, buf.len()));
    }
    let mut plan = UnpackPlan::new(ContainerKind::Kernel);
    plan.meta(
        "payload size",
        LittleEndian::read_u32(&buf[4..8]).to_string(),
    );
    plan.add_output(output, &buf[KRNL_HEADER..buf.len() - KRNL_TRAILER]);
    Ok(plan)
}

/// `LOADER  `: the payload follows the header, `load_size` bytes long.
pub(super) fn plan_loader<'a>(buf: &'a [u8], output: &str) -> Result<UnpackPlan<'a>, UnpackError> {
    if buf.len() < LOADER_HEADER_SIZE {
        return Err(truncated("LOADER header", LOADER_HEADER_SIZE, buf.len()));
    }
    let mut plan = UnpackPlan::new(ContainerKind::Loader);

    let version = LittleEndian::read_u32(&buf[8..12]);
    let load_addr = LittleEndian::read_u32(&buf[16..20]);
    let load_size = LittleEndian::read_u32(&buf[20..24]) as usize;
    let crc32 = LittleEndian::read_u32(&buf[24..28]);
    let hash_len = LittleEndian::read_u32(&buf[28..32]);
    plan.meta("version", version.to_string());
    plan.meta("load addr", format!("{:08x}", load_addr));
    plan.meta("load size", load_size.to_string());
    plan.meta("crc32", format!("{:08x}", crc32));
    plan.meta("hash len", hash_len.to_string());

    let body = &buf[LOADER_HEADER_SIZE..];
    let payload = if load_size > body.len() {
        plan.warn(format!(
            "load size {} exceeds the {} bytes present, extracting what is there",
            load_size,
            body.len()
        ));
        body
    } else {
        &body[..load_size]
    };
    plan.add_output(output, payload);
    Ok(plan)
}

/// `RSCE`: an index table of `ENTR` records, offsets in 512-byte blocks.
pub(super) fn plan_resource(buf: &[u8]) -> Result<UnpackPlan<'_>, UnpackError> {
    if buf.len() < RSCE_HEADER_SIZE {
        return Err(truncated("RSCE header", RSCE_HEADER_SIZE, buf.len()));
    }
    let mut plan = UnpackPlan::new(ContainerKind::Resource);

    let tbl_offset = buf[9] as usize * BLOCK;
    let entry_size = buf[10] as usize * BLOCK;
    let mut count = LittleEndian::read_u32(&buf[12..16]) as usize;
    if entry_size == 0 {
        return Err(FormatError::InvalidField {
            what: "RSCE entry size",
            value: 0,
        }
        .into());
    }
    plan.meta("partition version", LittleEndian::read_u16(&buf[4..6]).to_string());
    plan.meta("index version", LittleEndian::read_u16(&buf[6..8]).to_string());
    plan.meta("number of files", count.to_string());

    let room = buf.len().saturating_sub(tbl_offset) / entry_size;
    if count > room {
        plan.warn(format!("index table holds at most {} of {} entries", room, count));
        count = room;
    }

    for i in 0..count {
        let at = tbl_offset + i * entry_size;
        let Some(raw) = window(buf, at, ENTR_SIZE) else {
            plan.warn(format!("index table ends after {} of {} entries", i, count));
            break;
        };
        if &raw[..4] != b"ENTR" {
            plan.warn(format!("entry {} at 0x{:x} has no ENTR tag, skipping", i, at));
            continue;
        }

        let path = c_string(&raw[4..4 + ENTR_PATH_LEN]);
        let offset = LittleEndian::read_u32(&raw[260..264]) as usize * BLOCK;
        let size = LittleEndian::read_u32(&raw[264..268]) as usize;
        match window(buf, offset, size) {
            Some(data) => plan.add(&path, data),
            None => plan.warn(format!(
                "{}: content 0x{:x}+{} lies outside the image, skipping",
                path, offset, size
            )),
        }
    }
    Ok(plan)
}
