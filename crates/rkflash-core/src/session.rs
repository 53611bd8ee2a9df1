//! Device session - one open RockChip target and the buffers used to talk to it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result as AnyResult, ensure};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::checksum;
use crate::error::Result;
use crate::events::{FlashEvent, FlashObserver, Operation, TracingObserver};
use crate::protocol::command::{self, CommandFrame, ProtocolError};
use crate::protocol::constants::*;
use crate::protocol::info::{ChipVersion, FlashId, NandInfo, UsbMode};
use crate::rc4;
use crate::transport::UsbTransport;

/// Tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Bytes moved per flash command. Multiple of 512.
    pub block_size: usize,
    /// Physical address of SDRAM offset zero.
    pub sdram_base: u32,
    /// Per-transfer timeout in milliseconds, 0 waits forever.
    pub transfer_timeout_ms: u64,
    /// Pause after TEST_UNIT_READY before the first real command.
    pub unit_ready_delay_ms: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            sdram_base: SDRAM_BASE_ADDRESS,
            transfer_timeout_ms: 0,
            unit_ready_delay_ms: 20,
        }
    }
}

impl ToolConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> AnyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ToolConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> AnyResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> AnyResult<()> {
        ensure!(
            self.block_size >= SECTOR_SIZE && self.block_size % SECTOR_SIZE == 0,
            "block_size {:#x} is not a non-zero multiple of {}",
            self.block_size,
            SECTOR_SIZE
        );
        // The sector count travels in a 16-bit field.
        ensure!(
            self.block_size / SECTOR_SIZE <= u16::MAX as usize,
            "block_size {:#x} is too large",
            self.block_size
        );
        Ok(())
    }
}

/// Pad, obfuscate and checksum a DDR-init or USB-plug blob for upload.
///
/// The blob is zero-padded to a multiple of 2048 bytes, RC4-encoded as one
/// stream, and followed by its CRC16 in big-endian order.
pub fn prepare_vendor_code(bin: &[u8]) -> Vec<u8> {
    let size = bin.len().div_ceil(VENDOR_CODE_ALIGN) * VENDOR_CODE_ALIGN;
    let mut out = vec![0u8; size];
    out[..bin.len()].copy_from_slice(bin);
    rc4::rc4_apply(&mut out);
    let crc = checksum::crc16(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// An open RockChip device.
///
/// Owns the transport and the command/response/data buffers. Every
/// operation takes `&mut self`, so requests are serialized by construction.
/// Dropping the session drops the transport, which releases the interface.
pub struct DeviceSession<T: UsbTransport, O: FlashObserver = TracingObserver> {
    transport: T,
    observer: Arc<O>,
    config: ToolConfig,
    soc: &'static str,
    mode: UsbMode,
    cmd: CommandFrame,
    res: [u8; STATUS_FRAME_SIZE],
    pub(crate) buf: Vec<u8>,
}

impl<T: UsbTransport> DeviceSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: T, config: ToolConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: UsbTransport, O: FlashObserver> DeviceSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: T, config: ToolConfig, observer: Arc<O>) -> Self {
        let soc = soc_name(transport.product_id()).unwrap_or("unknown");
        let mode = UsbMode::from_bcd(transport.usb_version());
        let buf_len = config
            .block_size
            .max(FLASH_INFO_SIZE)
            .max(IDB_SECTOR_SIZE * IDB_READ_INCR as usize);

        let session = Self {
            transport,
            observer,
            config,
            soc,
            mode,
            cmd: [0; CMD_FRAME_SIZE],
            res: [0; STATUS_FRAME_SIZE],
            buf: vec![0; buf_len],
        };
        info!(soc = %soc, mode = %mode, "Session opened");
        session.emit(FlashEvent::DeviceConnected {
            vid: session.transport.vendor_id(),
            pid: session.transport.product_id(),
            soc,
            mode,
        });
        session
    }

    pub fn soc(&self) -> &'static str {
        self.soc
    }

    pub fn mode(&self) -> UsbMode {
        self.mode
    }

    pub fn vendor_id(&self) -> u16 {
        self.transport.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.transport.product_id()
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Block unit in bytes.
    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Block unit in sectors.
    pub fn block_sectors(&self) -> u32 {
        (self.config.block_size / SECTOR_SIZE) as u32
    }

    pub(crate) fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn progress(&self, operation: Operation, position: u64, current: u64, total: u64) {
        self.emit(FlashEvent::Progress {
            operation,
            position,
            current,
            total,
        });
    }

    fn send_frame(&mut self, frame: CommandFrame) -> Result<()> {
        self.cmd = frame;
        let written = self.transport.write(&self.cmd)?;
        if written != CMD_FRAME_SIZE {
            return Err(ProtocolError::ShortCommand {
                expected: CMD_FRAME_SIZE,
                written,
            }
            .into());
        }
        Ok(())
    }

    /// Send one command frame.
    pub(crate) fn send_command(&mut self, opcode: u32, offset: u32, count: u16) -> Result<()> {
        debug!(
            opcode = %format!("0x{:08x}", opcode),
            offset = %format!("0x{:08x}", offset),
            count,
            "Command"
        );
        self.send_frame(command::encode(opcode, offset, count))
    }

    /// Wait for the status frame that closes a command.
    pub(crate) fn recv_status(&mut self) -> Result<()> {
        let frame = self.transport.read(STATUS_FRAME_SIZE)?;
        command::decode_status(&frame)?;
        self.res.copy_from_slice(&frame);
        Ok(())
    }

    /// Send `self.buf[..len]` as the data phase.
    pub(crate) fn send_data(&mut self, len: usize) -> Result<()> {
        let written = self.transport.write(&self.buf[..len])?;
        if written != len {
            return Err(ProtocolError::ShortTransfer {
                expected: len,
                actual: written,
            }
            .into());
        }
        Ok(())
    }

    /// Receive exactly `len` bytes into `self.buf[..len]`.
    pub(crate) fn recv_data(&mut self, len: usize) -> Result<()> {
        let data = self.transport.read(len)?;
        if data.len() != len {
            return Err(ProtocolError::ShortTransfer {
                expected: len,
                actual: data.len(),
            }
            .into());
        }
        self.buf[..len].copy_from_slice(&data);
        Ok(())
    }

    /// Command with an inbound data phase: returns a copy of the reply.
    fn query(&mut self, opcode: u32, len: usize) -> Result<Vec<u8>> {
        self.send_command(opcode, 0, 0)?;
        self.recv_data(len)?;
        self.recv_status()?;
        Ok(self.buf[..len].to_vec())
    }

    /// Initialize the loader interface.
    #[instrument(skip(self))]
    pub fn test_unit_ready(&mut self) -> Result<()> {
        self.send_command(CMD_TEST_UNIT_READY, 0, 0)?;
        self.recv_status()?;
        if self.config.unit_ready_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.unit_ready_delay_ms));
        }
        Ok(())
    }

    /// Reboot the device. `flag` selects the target (0 = normal boot).
    #[instrument(skip(self))]
    pub fn reset(&mut self, flag: u8) -> Result<()> {
        info!("rebooting device...");
        self.send_frame(command::encode_reset(flag))?;
        self.recv_status()
    }

    /// Jump to code previously written to SDRAM. Addresses are physical.
    #[instrument(skip(self))]
    pub fn exec_sdram(&mut self, kernel_addr: u32, param_addr: u32) -> Result<()> {
        info!("booting kernel...");
        let base = self.config.sdram_base;
        self.send_frame(command::encode_exec(
            kernel_addr.wrapping_sub(base),
            param_addr.wrapping_sub(base),
        ))?;
        self.recv_status()
    }

    pub fn read_flash_id(&mut self) -> Result<FlashId> {
        let data = self.query(CMD_READ_FLASH_ID, FLASH_ID_SIZE)?;
        let mut id = [0u8; FLASH_ID_SIZE];
        id.copy_from_slice(&data);
        Ok(FlashId(id))
    }

    pub fn read_nand_info(&mut self) -> Result<NandInfo> {
        let data = self.query(CMD_READ_FLASH_INFO, FLASH_INFO_SIZE)?;
        Ok(NandInfo::from_bytes(&data)?)
    }

    pub fn read_chip_version(&mut self) -> Result<ChipVersion> {
        let data = self.query(CMD_READ_CHIP_INFO, CHIP_INFO_SIZE)?;
        let mut raw = [0u8; CHIP_INFO_SIZE];
        raw.copy_from_slice(&data);
        Ok(ChipVersion(raw))
    }

    /// Upload a DDR-init (`0x471`) or USB-plug (`0x472`) blob in maskrom mode.
    #[instrument(skip(self, bin), fields(len = bin.len(), code = %format!("0x{:03x}", code)))]
    pub fn load_vendor_code(&mut self, code: u16, bin: &[u8]) -> Result<()> {
        if self.mode != UsbMode::Maskrom {
            warn!(mode = %self.mode, "Vendor code is normally only accepted in maskrom mode");
        }
        let prepared = prepare_vendor_code(bin);
        let total = prepared.len() as u64;
        let mut sent = 0u64;
        for chunk in prepared.chunks(VENDOR_CHUNK_SIZE) {
            self.transport
                .control_out(VENDOR_REQUEST_LOAD, 0, code, chunk)?;
            sent += chunk.len() as u64;
            self.progress(Operation::VendorCode, sent, sent, total);
        }
        self.emit(FlashEvent::Complete {
            operation: Operation::VendorCode,
        });
        Ok(())
    }
}

impl<T: UsbTransport, O: FlashObserver> Drop for DeviceSession<T, O> {
    fn drop(&mut self) {
        debug!(last_status = ?self.res, "Releasing interface");
        info!("disconnect");
        self.emit(FlashEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::MockTransport;

    fn session() -> (DeviceSession<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        let config = ToolConfig {
            unit_ready_delay_ms: 0,
            ..Default::default()
        };
        (DeviceSession::new(mock.clone(), config), mock)
    }

    #[test]
    fn test_identification() {
        let mock = MockTransport::new().with_ids(0x320a, USB_MODE_MASKROM);
        let session = DeviceSession::new(mock, ToolConfig::default());
        assert_eq!(session.soc(), "RK3288");
        assert_eq!(session.mode(), UsbMode::Maskrom);
        assert_eq!(session.vendor_id(), ROCKCHIP_VENDOR_ID);
    }

    #[test]
    fn test_unit_ready_and_queries() {
        let (mut session, mock) = session();
        session.test_unit_ready().unwrap();
        let nand = session.read_nand_info().unwrap();
        assert_eq!(nand.flash_size, 0x10000);
        let id = session.read_flash_id().unwrap();
        assert_eq!(id.0[0], 0xec);
        session.read_chip_version().unwrap();

        let ops: Vec<u32> = mock.commands().iter().map(|c| c.opcode).collect();
        assert_eq!(
            ops,
            vec![
                CMD_TEST_UNIT_READY,
                CMD_READ_FLASH_INFO,
                CMD_READ_FLASH_ID,
                CMD_READ_CHIP_INFO
            ]
        );
    }

    #[test]
    fn test_reset_sends_flag() {
        let (mut session, mock) = session();
        session.reset(1).unwrap();
        let cmd = mock.commands()[0];
        assert_eq!(cmd.opcode, CMD_RESET_DEVICE);
        assert_eq!(cmd.flag, 1);
    }

    #[test]
    fn test_exec_subtracts_sdram_base() {
        let (mut session, mock) = session();
        session.exec_sdram(0x6040_8000, 0x6000_0000).unwrap();
        let cmd = mock.commands()[0];
        assert_eq!(cmd.opcode, CMD_EXECUTE_SDRAM);
        assert_eq!(cmd.offset, 0x0040_8000);
    }

    #[test]
    fn test_short_status_is_protocol_error() {
        let (mut session, mock) = session();
        mock.short_status_after(0);
        let err = session.test_unit_ready().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::BadStatus { .. })));
        // The session stays usable.
        session.test_unit_ready().unwrap();
    }

    #[test]
    fn test_short_data_phase_is_protocol_error() {
        let (mut session, mock) = session();
        // A stray 3-byte packet is served before the flash ID reply.
        mock.queue_response(&[0xec, 0xd7, 0x94]);
        let err = session.read_flash_id().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ShortTransfer {
                expected: 5,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_transport_error_propagates() {
        let (mut session, mock) = session();
        mock.disconnect();
        assert!(matches!(
            session.test_unit_ready().unwrap_err(),
            Error::Transport(_)
        ));
    }

    #[test]
    fn test_prepare_vendor_code() {
        let bin = vec![0x5au8; 3000];
        let prepared = prepare_vendor_code(&bin);
        assert_eq!(prepared.len(), 4096 + 2);

        let body = &prepared[..4096];
        let crc = checksum::crc16(body);
        assert_eq!(&prepared[4096..], &crc.to_be_bytes());

        let mut decoded = body.to_vec();
        rc4::rc4_apply(&mut decoded);
        assert_eq!(&decoded[..3000], &bin[..]);
        assert!(decoded[3000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_vendor_code_chunking() {
        let mock = MockTransport::new().with_ids(0x330c, USB_MODE_MASKROM);
        let mut session = DeviceSession::new(mock.clone(), ToolConfig::default());
        session.load_vendor_code(LOAD_CODE_471, &[1u8; 9000]).unwrap();

        let uploads = mock.vendor_uploads();
        let sizes: Vec<usize> = uploads.iter().map(|(_, d)| d.len()).collect();
        assert_eq!(sizes, vec![4096, 4096, 2048 + 2]);
        assert!(uploads.iter().all(|(idx, _)| *idx == LOAD_CODE_471));
    }

    #[test]
    fn test_config_validation_and_toml() {
        assert!(ToolConfig::default().validate().is_ok());
        let bad = ToolConfig {
            block_size: 700,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let parsed: ToolConfig = toml::from_str("block_size = 16384").unwrap();
        assert_eq!(parsed.block_size, 0x4000);
        assert_eq!(parsed.sdram_base, SDRAM_BASE_ADDRESS);
    }
}
