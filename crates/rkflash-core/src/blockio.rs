//! Chunked flash, SDRAM and raw IDB transfers.
//!
//! Flash ranges are in sectors and split into block-unit chunks. SDRAM
//! ranges are in bytes and addressed physically; the SDRAM base is
//! subtracted before a command is encoded.

use std::io::{self, Read, Write};

use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::events::{FlashEvent, FlashObserver, Operation};
use crate::protocol::constants::*;
use crate::session::DeviceSession;
use crate::transport::UsbTransport;

/// Payload bytes of one raw IDB sector; the rest of the sector is spare.
pub const IDB_DATA_SIZE: usize = 0x200;

/// How erased flash gets its 0xFF fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EraseMode {
    /// Erase command without a data phase; the device fills 0xFF itself.
    Fast,
    /// Write an all-0xFF buffer over the range.
    #[default]
    Overwrite,
}

/// Result of an input-driven transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Sectors (flash, IDB) or bytes (SDRAM) committed to the device.
    pub done: u64,
    /// Input ran out before the requested range was covered.
    pub truncated: bool,
}

/// Splits `[offset, offset + length)` into `unit`-sized chunks plus one
/// final chunk for any remainder.
#[derive(Debug, Clone)]
pub struct Chunks {
    offset: u32,
    remaining: u32,
    unit: u32,
}

impl Chunks {
    pub fn new(offset: u32, length: u32, unit: u32) -> Self {
        Self {
            offset,
            remaining: length,
            unit: unit.max(1),
        }
    }
}

impl Iterator for Chunks {
    /// `(offset, length)` of the next chunk.
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let len = self.remaining.min(self.unit);
        let chunk = (self.offset, len);
        self.offset = self.offset.wrapping_add(len);
        self.remaining -= len;
        Some(chunk)
    }
}

/// Fill `buf` from `input`, stopping early only at end of input.
pub(crate) fn read_full<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reject ranges whose end does not fit the 32-bit address space.
fn check_range(offset: u32, length: u32) -> Result<()> {
    match offset.checked_add(length) {
        Some(_) => Ok(()),
        None => Err(Error::Input(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("range 0x{:08x}+0x{:x} exceeds the address space", offset, length),
        ))),
    }
}

impl<T: UsbTransport, O: FlashObserver> DeviceSession<T, O> {
    fn truncated(&self, operation: Operation, at: u32) {
        let reason = format!("premature end-of-file reached at offset 0x{:08x}", at);
        warn!(operation = %operation, "{}", reason);
        self.emit(FlashEvent::Truncated { operation, reason });
    }

    /// Read `length` sectors of flash starting at `offset` into `out`.
    #[instrument(skip(self, out))]
    pub fn read_flash<W: Write + ?Sized>(
        &mut self,
        offset: u32,
        length: u32,
        out: &mut W,
    ) -> Result<()> {
        check_range(offset, length)?;
        let total = length as u64;
        let mut current = 0u64;
        for (lba, count) in Chunks::new(offset, length, self.block_sectors()) {
            let bytes = count as usize * SECTOR_SIZE;
            self.send_command(CMD_READ_LBA, lba, count as u16)?;
            self.recv_data(bytes)?;
            self.recv_status()?;
            out.write_all(&self.buf[..bytes]).map_err(Error::Output)?;

            current += count as u64;
            self.progress(Operation::ReadFlash, lba as u64, current, total);
        }
        out.flush().map_err(Error::Output)?;
        self.emit(FlashEvent::Complete {
            operation: Operation::ReadFlash,
        });
        Ok(())
    }

    /// Write `length` sectors from `input` starting at `offset`.
    ///
    /// A short final read is zero-padded to whole sectors and written, then
    /// the transfer stops and reports truncation.
    #[instrument(skip(self, input))]
    pub fn write_flash<R: Read + ?Sized>(
        &mut self,
        offset: u32,
        length: u32,
        input: &mut R,
    ) -> Result<Transfer> {
        check_range(offset, length)?;
        let total = length as u64;
        let mut done = 0u64;
        for (lba, count) in Chunks::new(offset, length, self.block_sectors()) {
            let bytes = count as usize * SECTOR_SIZE;
            let n = read_full(input, &mut self.buf[..bytes]).map_err(Error::Input)?;
            if n == 0 {
                self.truncated(Operation::WriteFlash, lba);
                return Ok(Transfer {
                    done,
                    truncated: true,
                });
            }

            let sectors = n.div_ceil(SECTOR_SIZE);
            self.buf[n..sectors * SECTOR_SIZE].fill(0);
            self.send_command(CMD_WRITE_LBA, lba, sectors as u16)?;
            self.send_data(sectors * SECTOR_SIZE)?;
            self.recv_status()?;

            done += sectors as u64;
            self.progress(Operation::WriteFlash, lba as u64, done, total);
            if n < bytes {
                self.truncated(Operation::WriteFlash, lba + sectors as u32);
                return Ok(Transfer {
                    done,
                    truncated: true,
                });
            }
        }
        self.emit(FlashEvent::Complete {
            operation: Operation::WriteFlash,
        });
        Ok(Transfer {
            done,
            truncated: false,
        })
    }

    /// Fill `length` sectors at `offset` with 0xFF.
    #[instrument(skip(self))]
    pub fn erase_flash(&mut self, offset: u32, length: u32, mode: EraseMode) -> Result<()> {
        check_range(offset, length)?;
        let total = length as u64;
        let mut current = 0u64;
        if mode == EraseMode::Overwrite {
            self.buf.fill(0xff);
        }
        for (lba, count) in Chunks::new(offset, length, self.block_sectors()) {
            match mode {
                EraseMode::Fast => {
                    self.send_command(CMD_ERASE_SECTORS, lba, count as u16)?;
                }
                EraseMode::Overwrite => {
                    self.send_command(CMD_WRITE_LBA, lba, count as u16)?;
                    self.send_data(count as usize * SECTOR_SIZE)?;
                }
            }
            self.recv_status()?;

            current += count as u64;
            self.progress(Operation::EraseFlash, lba as u64, current, total);
        }
        self.emit(FlashEvent::Complete {
            operation: Operation::EraseFlash,
        });
        Ok(())
    }

    /// Read the whole flash as reported by NAND info.
    pub fn dump_flash<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<()> {
        let nand = self.read_nand_info()?;
        info!(sectors = nand.flash_size, "Dumping flash");
        self.read_flash(0, nand.flash_size, out)
    }

    /// Erase the whole flash as reported by NAND info.
    pub fn erase_all(&mut self, mode: EraseMode) -> Result<()> {
        let nand = self.read_nand_info()?;
        info!(sectors = nand.flash_size, "Erasing whole flash");
        self.erase_flash(0, nand.flash_size, mode)
    }

    fn ram_unit(&self) -> u32 {
        // The byte count travels in the 16-bit count field.
        self.block_size().min(u16::MAX as usize) as u32
    }

    /// Read `length` bytes of SDRAM at physical address `addr`.
    #[instrument(skip(self, out))]
    pub fn read_ram<W: Write + ?Sized>(&mut self, addr: u32, length: u32, out: &mut W) -> Result<()> {
        check_range(addr, length)?;
        let base = self.config().sdram_base;
        let total = length as u64;
        let mut current = 0u64;
        for (at, len) in Chunks::new(addr, length, self.ram_unit()) {
            self.send_command(CMD_READ_SDRAM, at.wrapping_sub(base), len as u16)?;
            self.recv_data(len as usize)?;
            self.recv_status()?;
            out.write_all(&self.buf[..len as usize]).map_err(Error::Output)?;

            current += len as u64;
            self.progress(Operation::ReadRam, at as u64, current, total);
        }
        out.flush().map_err(Error::Output)?;
        self.emit(FlashEvent::Complete {
            operation: Operation::ReadRam,
        });
        Ok(())
    }

    /// Write `length` bytes from `input` to SDRAM at physical address `addr`.
    #[instrument(skip(self, input))]
    pub fn write_ram<R: Read + ?Sized>(
        &mut self,
        addr: u32,
        length: u32,
        input: &mut R,
    ) -> Result<Transfer> {
        check_range(addr, length)?;
        let base = self.config().sdram_base;
        let total = length as u64;
        let mut done = 0u64;
        for (at, len) in Chunks::new(addr, length, self.ram_unit()) {
            let n = read_full(input, &mut self.buf[..len as usize]).map_err(Error::Input)?;
            if n == 0 {
                self.truncated(Operation::WriteRam, at);
                return Ok(Transfer {
                    done,
                    truncated: true,
                });
            }

            self.send_command(CMD_WRITE_SDRAM, at.wrapping_sub(base), n as u16)?;
            self.send_data(n)?;
            self.recv_status()?;

            done += n as u64;
            self.progress(Operation::WriteRam, at as u64, done, total);
            if n < len as usize {
                self.truncated(Operation::WriteRam, at + n as u32);
                return Ok(Transfer {
                    done,
                    truncated: true,
                });
            }
        }
        self.emit(FlashEvent::Complete {
            operation: Operation::WriteRam,
        });
        Ok(Transfer {
            done,
            truncated: false,
        })
    }

    /// Read `count` raw IDB sectors (data plus spare) starting at `offset`.
    #[instrument(skip(self, out))]
    pub fn read_idb<W: Write + ?Sized>(&mut self, offset: u32, count: u32, out: &mut W) -> Result<()> {
        check_range(offset, count)?;
        let total = count as u64;
        let mut current = 0u64;
        for (sector, n) in Chunks::new(offset, count, IDB_READ_INCR) {
            let bytes = IDB_SECTOR_SIZE * n as usize;
            self.send_command(CMD_READ_SECTOR, sector, n as u16)?;
            self.recv_data(bytes)?;
            self.recv_status()?;
            out.write_all(&self.buf[..bytes]).map_err(Error::Output)?;

            current += n as u64;
            self.progress(Operation::ReadIdb, sector as u64, current, total);
        }
        out.flush().map_err(Error::Output)?;
        self.emit(FlashEvent::Complete {
            operation: Operation::ReadIdb,
        });
        Ok(())
    }

    /// Write `count` IDB sectors, one per command. Each sector takes 512
    /// bytes of input and is sent with its spare area set to 0xFF.
    #[instrument(skip(self, input))]
    pub fn write_idb<R: Read + ?Sized>(
        &mut self,
        offset: u32,
        count: u32,
        input: &mut R,
    ) -> Result<Transfer> {
        check_range(offset, count)?;
        let total = count as u64;
        let mut done = 0u64;
        for (sector, _) in Chunks::new(offset, count, 1) {
            self.buf[..IDB_SECTOR_SIZE].fill(0xff);
            let n = read_full(input, &mut self.buf[..IDB_DATA_SIZE]).map_err(Error::Input)?;
            if n == 0 {
                self.truncated(Operation::WriteIdb, sector);
                return Ok(Transfer {
                    done,
                    truncated: true,
                });
            }

            self.send_command(CMD_WRITE_SECTOR, sector, 1)?;
            self.send_data(IDB_SECTOR_SIZE)?;
            self.recv_status()?;

            done += 1;
            self.progress(Operation::WriteIdb, sector as u64, done, total);
            if n < IDB_DATA_SIZE {
                self.truncated(Operation::WriteIdb, sector + 1);
                return Ok(Transfer {
                    done,
                    truncated: true,
                });
            }
        }
        self.emit(FlashEvent::Complete {
            operation: Operation::WriteIdb,
        });
        Ok(Transfer {
            done,
            truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::DecodedCommand;
    use crate::session::ToolConfig;
    use crate::transport::MockTransport;

    fn session_with_block(block_size: usize) -> (DeviceSession<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        let config = ToolConfig {
            block_size,
            unit_ready_delay_ms: 0,
            ..Default::default()
        };
        (DeviceSession::new(mock.clone(), config), mock)
    }

    fn ops(mock: &MockTransport, opcode: u32) -> Vec<DecodedCommand> {
        mock.commands()
            .into_iter()
            .filter(|c| c.opcode == opcode)
            .collect()
    }

    #[test]
    fn test_chunking_8_8_4() {
        let chunks: Vec<_> = Chunks::new(0x100, 20, 8).collect();
        assert_eq!(chunks, vec![(0x100, 8), (0x108, 8), (0x110, 4)]);
        let advanced: u32 = chunks.iter().map(|(_, n)| n).sum();
        assert_eq!(advanced, 20);
        assert_eq!(Chunks::new(0, 0, 8).count(), 0);
    }

    #[test]
    fn test_read_flash_chunks_by_block_unit() {
        let (mut session, mock) = session_with_block(8 * SECTOR_SIZE);
        let data: Vec<u8> = (0..20 * SECTOR_SIZE).map(|i| (i / SECTOR_SIZE) as u8).collect();
        mock.set_flash(0x100, &data);

        let mut out = Vec::new();
        session.read_flash(0x100, 20, &mut out).unwrap();
        assert_eq!(out, data);

        let counts: Vec<u16> = ops(&mock, CMD_READ_LBA).iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![8, 8, 4]);
    }

    #[test]
    fn test_write_flash_roundtrip() {
        let (mut session, mock) = session_with_block(4 * SECTOR_SIZE);
        let data = vec![0x3cu8; 6 * SECTOR_SIZE];
        let transfer = session.write_flash(0x2000, 6, &mut &data[..]).unwrap();
        assert_eq!(
            transfer,
            Transfer {
                done: 6,
                truncated: false
            }
        );
        assert_eq!(mock.flash(0x2000, 6), data);
    }

    #[test]
    fn test_write_flash_short_input_truncates() {
        let (mut session, mock) = session_with_block(4 * SECTOR_SIZE);
        let data = vec![0x11u8; 5 * SECTOR_SIZE + 100];
        let transfer = session.write_flash(0, 16, &mut &data[..]).unwrap();
        assert!(transfer.truncated);
        assert_eq!(transfer.done, 6);

        let last = mock.flash(5, 1);
        assert!(last[..100].iter().all(|&b| b == 0x11));
        assert!(last[100..].iter().all(|&b| b == 0));
        assert_eq!(ops(&mock, CMD_WRITE_LBA).len(), 2);
    }

    #[test]
    fn test_write_flash_empty_input() {
        let (mut session, mock) = session_with_block(DEFAULT_BLOCK_SIZE);
        let transfer = session.write_flash(0, 4, &mut io::empty()).unwrap();
        assert_eq!(transfer.done, 0);
        assert!(transfer.truncated);
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_range_past_address_space_rejected() {
        let (mut session, mock) = session_with_block(DEFAULT_BLOCK_SIZE);
        let data = vec![0u8; 4 * SECTOR_SIZE];
        let err = session
            .write_flash(u32::MAX - 1, 4, &mut &data[..])
            .unwrap_err();
        assert!(matches!(err, Error::Input(_)));
        let err = session
            .write_ram(u32::MAX - 8, 16, &mut &data[..])
            .unwrap_err();
        assert!(matches!(err, Error::Input(_)));
        let err = session.write_idb(u32::MAX, 1, &mut &data[..]).unwrap_err();
        assert!(matches!(err, Error::Input(_)));
        assert!(mock.commands().is_empty());

        // A range ending exactly at the top still fits.
        let transfer = session
            .write_flash(u32::MAX - 4, 4, &mut &data[..])
            .unwrap();
        assert_eq!(transfer.done, 4);
    }

    #[test]
    fn test_erase_modes() {
        let (mut session, mock) = session_with_block(2 * SECTOR_SIZE);
        mock.set_flash(0, &[0u8; 8 * SECTOR_SIZE]);

        session.erase_flash(0, 3, EraseMode::Overwrite).unwrap();
        assert_eq!(mock.flash(0, 3), vec![0xff; 3 * SECTOR_SIZE]);
        assert_eq!(ops(&mock, CMD_WRITE_LBA).len(), 2);

        session.erase_flash(4, 4, EraseMode::Fast).unwrap();
        assert_eq!(mock.flash(4, 4), vec![0xff; 4 * SECTOR_SIZE]);
        assert_eq!(ops(&mock, CMD_ERASE_SECTORS).len(), 2);
        assert_eq!(mock.flash(3, 1), vec![0; SECTOR_SIZE]);
    }

    #[test]
    fn test_ram_subtracts_base() {
        let (mut session, mock) = session_with_block(DEFAULT_BLOCK_SIZE);
        let data: Vec<u8> = (0..700u32).map(|i| i as u8).collect();
        let transfer = session
            .write_ram(SDRAM_BASE_ADDRESS + 0x100, 700, &mut &data[..])
            .unwrap();
        assert_eq!(transfer.done, 700);
        assert_eq!(mock.sdram(0x100, 700), data);

        let writes = ops(&mock, CMD_WRITE_SDRAM);
        assert_eq!(writes[0].offset, 0x100);
        assert_eq!(writes[0].count, 512);
        assert_eq!(writes[1].offset, 0x300);
        assert_eq!(writes[1].count, 188);

        let mut out = Vec::new();
        session
            .read_ram(SDRAM_BASE_ADDRESS + 0x100, 700, &mut out)
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_idb_write_then_read() {
        let (mut session, mock) = session_with_block(DEFAULT_BLOCK_SIZE);
        let data = vec![0x77u8; 2 * IDB_DATA_SIZE];
        let transfer = session.write_idb(0x40, 2, &mut &data[..]).unwrap();
        assert_eq!(transfer.done, 2);

        let raw = mock.idb_sector(0x41).unwrap();
        assert_eq!(raw.len(), IDB_SECTOR_SIZE);
        assert!(raw[..IDB_DATA_SIZE].iter().all(|&b| b == 0x77));
        assert!(raw[IDB_DATA_SIZE..].iter().all(|&b| b == 0xff));

        let mut out = Vec::new();
        session.read_idb(0x40, 0x21, &mut out).unwrap();
        assert_eq!(out.len(), 0x21 * IDB_SECTOR_SIZE);
        let reads: Vec<u16> = ops(&mock, CMD_READ_SECTOR).iter().map(|c| c.count).collect();
        assert_eq!(reads, vec![0x20, 1]);
    }

    #[test]
    fn test_dump_uses_nand_size() {
        let (mut session, mock) = session_with_block(0x4000);
        let mut nand = crate::protocol::NandInfo::from_bytes(&[0u8; 16]).unwrap();
        nand.flash_size = 0x50;
        mock.set_nand_info(nand);

        let mut out = Vec::new();
        session.dump_flash(&mut out).unwrap();
        assert_eq!(out.len(), 0x50 * SECTOR_SIZE);
        assert_eq!(ops(&mock, CMD_READ_LBA).len(), 3);
    }

    #[test]
    fn test_output_failure_is_fatal() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (mut session, _mock) = session_with_block(DEFAULT_BLOCK_SIZE);
        let err = session.read_flash(0, 4, &mut Broken).unwrap_err();
        assert!(matches!(err, Error::Output(_)));
    }
}
