//! rkflash-core: RockChip maskrom/loader USB protocol in Rust.
//!
//! Talks to RockChip SoCs sitting in the boot ROM's USB service mode and
//! decodes the container formats their firmware ships in.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Primitives**: RockChip CRC16/CRC32, fixed-key RC4
//! - **Protocol**: Constants, command/status frames, device info decoders
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Session**: One open device, command cycles, vendor code upload
//! - **Block I/O**: Chunked flash, SDRAM and IDB transfers
//! - **Partition / Param**: `mtdparts=` lookup and the parameter block
//! - **Boot**: Packed bootloader parsing and IDB installation
//! - **Unpack**: Offline RKFW/RKAF, KRNL, LOADER and RSCE extraction
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use rkflash_core::{DeviceSession, NusbTransport, ToolConfig};
//!
//! let config = ToolConfig::default();
//! let transport = NusbTransport::open()
//!     .expect("no device")
//!     .with_timeout(config.transfer_timeout_ms);
//! let mut session = DeviceSession::new(transport, config);
//! session.test_unit_ready().expect("device not ready");
//! let (offset, size) = session.resolve_partition("boot").expect("no boot partition");
//! let mut out = std::fs::File::create("boot.img").unwrap();
//! session.read_flash(offset, size, &mut out).expect("read failed");
//! ```

pub mod blockio;
pub mod boot;
pub mod checksum;
pub mod error;
pub mod events;
pub mod param;
pub mod partition;
pub mod protocol;
pub mod rc4;
pub mod session;
pub mod transport;
pub mod unpack;

// Re-exports for convenience
pub use blockio::{EraseMode, Transfer};
pub use boot::{BootPackage, EntryKind};
pub use error::{Error, FormatError, Result};
pub use events::{FlashEvent, FlashObserver, NullObserver, Operation, TracingObserver};
pub use param::ParameterBlock;
pub use partition::{parse_number, resolve_in};
pub use protocol::{ChipVersion, FlashId, NandInfo, ProtocolError, UsbMode};
pub use session::{DeviceSession, ToolConfig, prepare_vendor_code};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
pub use unpack::{ContainerKind, Outcome, UnpackError, UnpackPlan, unpack_file};
