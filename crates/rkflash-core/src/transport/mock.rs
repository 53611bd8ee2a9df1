//! Mock USB transport for testing.
//!
//! Behaves like a small RockChip target in loader mode: it decodes command
//! frames, serves reads from a sparse flash array, stores data-phase writes
//! and answers every command with a 13-byte status frame.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::command::{self, DecodedCommand};
use crate::protocol::constants::*;
use crate::protocol::info::NandInfo;

const ERASED: u8 = 0xff;

#[derive(Debug)]
struct MockState {
    /// Sparse flash, one entry per written sector; missing sectors read 0xFF.
    flash: BTreeMap<u32, Vec<u8>>,
    /// Sparse raw IDB sectors (0x210 bytes each).
    idb: BTreeMap<u32, Vec<u8>>,
    /// SDRAM window starting at the SDRAM base.
    sdram: Vec<u8>,
    nand: NandInfo,
    flash_id: [u8; FLASH_ID_SIZE],
    chip_info: [u8; CHIP_INFO_SIZE],
    /// Command waiting for its OUT data phase.
    pending: Option<DecodedCommand>,
    /// Queued IN transfers.
    in_queue: VecDeque<Vec<u8>>,
    write_log: Vec<Vec<u8>>,
    commands: Vec<DecodedCommand>,
    vendor_uploads: Vec<(u16, Vec<u8>)>,
    short_status_after: Option<usize>,
    connected: bool,
}

/// Mock transport for unit testing session logic.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    vid: u16,
    pid: u16,
    bcd_usb: u16,
}

impl MockTransport {
    /// An RK3399 in loader mode with 0x10000 sectors (32 MiB) of flash.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                flash: BTreeMap::new(),
                idb: BTreeMap::new(),
                sdram: vec![0; 0x10000],
                nand: NandInfo {
                    flash_size: 0x10000,
                    block_size: 0x200,
                    page_size: 8,
                    ecc_bits: 40,
                    access_time: 32,
                    manufacturer_id: 0,
                    chip_select: 1,
                },
                flash_id: [0xec, 0xd7, 0x94, 0x76, 0x54],
                chip_info: *b"0033V\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00",
                pending: None,
                in_queue: VecDeque::new(),
                write_log: Vec::new(),
                commands: Vec::new(),
                vendor_uploads: Vec::new(),
                short_status_after: None,
                connected: true,
            })),
            vid: ROCKCHIP_VENDOR_ID,
            pid: 0x330c,
            bcd_usb: USB_MODE_LOADER,
        }
    }

    /// Set PID and bcdUSB for identification tests.
    pub fn with_ids(mut self, pid: u16, bcd_usb: u16) -> Self {
        self.pid = pid;
        self.bcd_usb = bcd_usb;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Replace the reported NAND geometry.
    pub fn set_nand_info(&self, nand: NandInfo) {
        self.lock().nand = nand;
    }

    /// Preload flash contents starting at `lba`.
    pub fn set_flash(&self, lba: u32, data: &[u8]) {
        let mut state = self.lock();
        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let mut sector = vec![ERASED; SECTOR_SIZE];
            sector[..chunk.len()].copy_from_slice(chunk);
            state.flash.insert(lba + i as u32, sector);
        }
    }

    /// Read back `count` sectors of flash starting at `lba`.
    pub fn flash(&self, lba: u32, count: u32) -> Vec<u8> {
        Self::sector_range(&self.lock(), lba, count)
    }

    /// Read back `len` bytes of SDRAM at `offset` from the SDRAM base.
    pub fn sdram(&self, offset: usize, len: usize) -> Vec<u8> {
        self.lock().sdram[offset..offset + len].to_vec()
    }

    /// Read back one raw IDB sector.
    pub fn idb_sector(&self, sector: u32) -> Option<Vec<u8>> {
        self.lock().idb.get(&sector).cloned()
    }

    /// Commands decoded so far, in order.
    pub fn commands(&self) -> Vec<DecodedCommand> {
        self.lock().commands.clone()
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.lock().write_log.clone()
    }

    /// Vendor control uploads as (index, data) pairs.
    pub fn vendor_uploads(&self) -> Vec<(u16, Vec<u8>)> {
        self.lock().vendor_uploads.clone()
    }

    /// Queue a raw IN transfer; it is read before the replies of any
    /// command sent afterwards.
    pub fn queue_response(&self, bytes: &[u8]) {
        self.lock().in_queue.push_back(bytes.to_vec());
    }

    /// Reply to the command after `n` more commands with a short status.
    pub fn short_status_after(&self, n: usize) {
        self.lock().short_status_after = Some(n);
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    fn sector_range(state: &MockState, lba: u32, count: u32) -> Vec<u8> {
        (lba..lba + count)
            .flat_map(|s| {
                state
                    .flash
                    .get(&s)
                    .cloned()
                    .unwrap_or_else(|| vec![ERASED; SECTOR_SIZE])
            })
            .collect()
    }

    fn push_status(state: &mut MockState) {
        let len = match state.short_status_after {
            Some(0) => {
                state.short_status_after = None;
                STATUS_FRAME_SIZE - 4
            }
            Some(n) => {
                state.short_status_after = Some(n - 1);
                STATUS_FRAME_SIZE
            }
            None => STATUS_FRAME_SIZE,
        };
        let mut status = vec![0u8; len];
        status[..4.min(len)].copy_from_slice(&b"USBS"[..4.min(len)]);
        state.in_queue.push_back(status);
    }

    fn handle_command(state: &mut MockState, cmd: DecodedCommand) {
        state.commands.push(cmd);
        match cmd.opcode {
            CMD_READ_LBA => {
                let data = Self::sector_range(state, cmd.offset, cmd.count as u32);
                state.in_queue.push_back(data);
            }
            CMD_READ_SDRAM => {
                let start = cmd.offset as usize;
                let end = (start + cmd.count as usize).min(state.sdram.len());
                let data = state.sdram[start.min(end)..end].to_vec();
                state.in_queue.push_back(data);
            }
            CMD_READ_SECTOR => {
                let data: Vec<u8> = (cmd.offset..cmd.offset + cmd.count as u32)
                    .flat_map(|s| {
                        state
                            .idb
                            .get(&s)
                            .cloned()
                            .unwrap_or_else(|| vec![ERASED; IDB_SECTOR_SIZE])
                    })
                    .collect();
                state.in_queue.push_back(data);
            }
            CMD_READ_FLASH_INFO => {
                let data = state.nand.to_bytes().to_vec();
                state.in_queue.push_back(data);
            }
            CMD_READ_FLASH_ID => {
                let data = state.flash_id.to_vec();
                state.in_queue.push_back(data);
            }
            CMD_READ_CHIP_INFO => {
                let data = state.chip_info.to_vec();
                state.in_queue.push_back(data);
            }
            CMD_ERASE_SECTORS => {
                for s in cmd.offset..cmd.offset + cmd.count as u32 {
                    state.flash.remove(&s);
                }
            }
            CMD_WRITE_LBA | CMD_WRITE_SDRAM | CMD_WRITE_SECTOR => {
                state.pending = Some(cmd);
                return;
            }
            _ => {}
        }
        Self::push_status(state);
    }

    fn handle_data(state: &mut MockState, cmd: DecodedCommand, data: &[u8]) {
        match cmd.opcode {
            CMD_WRITE_LBA => {
                for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
                    let mut sector = vec![ERASED; SECTOR_SIZE];
                    sector[..chunk.len()].copy_from_slice(chunk);
                    state.flash.insert(cmd.offset + i as u32, sector);
                }
            }
            CMD_WRITE_SDRAM => {
                let start = cmd.offset as usize;
                let end = (start + data.len()).min(state.sdram.len());
                if start < end {
                    state.sdram[start..end].copy_from_slice(&data[..end - start]);
                }
            }
            CMD_WRITE_SECTOR => {
                state.idb.insert(cmd.offset, data.to_vec());
            }
            _ => {}
        }
        Self::push_status(state);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.write_log.push(data.to_vec());

        if let Some(cmd) = state.pending.take() {
            Self::handle_data(&mut state, cmd, data);
        } else if let Some(cmd) = command::decode(data) {
            Self::handle_command(&mut state, cmd);
        }
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        let mut data = state
            .in_queue
            .pop_front()
            .ok_or(TransportError::Timeout { timeout_ms: 5000 })?;
        data.truncate(max_len);
        Ok(data)
    }

    fn control_out(
        &self,
        _request: u8,
        _value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.vendor_uploads.push((index, data.to_vec()));
        Ok(())
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn usb_version(&self) -> u16 {
        self.bcd_usb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_serves_reads_and_status() {
        let mock = MockTransport::new();
        mock.set_flash(2, &[0xaa; 512]);

        mock.write(&command::encode(CMD_READ_LBA, 2, 1)).unwrap();
        assert_eq!(mock.read(512).unwrap(), vec![0xaa; 512]);
        assert_eq!(mock.read(13).unwrap().len(), 13);

        // Queue is empty now
        assert!(mock.read(13).is_err());
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockTransport::new();
        mock.write(&command::encode(CMD_WRITE_LBA, 5, 1)).unwrap();
        mock.write(&[0x11; 512]).unwrap();

        assert_eq!(mock.get_writes().len(), 2);
        assert_eq!(mock.flash(5, 1), vec![0x11; 512]);
        assert_eq!(mock.commands()[0].opcode, CMD_WRITE_LBA);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockTransport::new();
        mock.disconnect();
        assert!(mock.write(b"test").is_err());
        assert!(mock.read(13).is_err());
    }
}
