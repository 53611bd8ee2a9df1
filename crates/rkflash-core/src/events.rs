//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow long block loops without
//! the core knowing how progress is displayed.

use std::fmt;

use crate::protocol::UsbMode;

/// Long-running operations that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ReadFlash,
    WriteFlash,
    EraseFlash,
    ReadRam,
    WriteRam,
    ReadIdb,
    WriteIdb,
    WriteParameters,
    VendorCode,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ReadFlash => write!(f, "reading flash memory"),
            Operation::WriteFlash => write!(f, "writing flash memory"),
            Operation::EraseFlash => write!(f, "erasing flash memory"),
            Operation::ReadRam => write!(f, "reading memory"),
            Operation::WriteRam => write!(f, "writing memory"),
            Operation::ReadIdb => write!(f, "reading IDB flash memory"),
            Operation::WriteIdb => write!(f, "writing IDB flash memory"),
            Operation::WriteParameters => write!(f, "writing parameters"),
            Operation::VendorCode => write!(f, "sending vendor code"),
        }
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Session opened.
    DeviceConnected {
        vid: u16,
        pid: u16,
        soc: &'static str,
        mode: UsbMode,
    },
    /// One chunk of a long operation finished. `position` is the device
    /// offset the chunk started at (sectors or bytes, per operation).
    Progress {
        operation: Operation,
        position: u64,
        current: u64,
        total: u64,
    },
    /// Operation stopped early but the device is consistent.
    Truncated { operation: Operation, reason: String },
    /// Operation completed.
    Complete { operation: Operation },
    /// Session closed.
    Disconnected,
}

impl FlashEvent {
    /// Completion percentage for `Progress` events.
    pub fn percent(&self) -> Option<u64> {
        match self {
            FlashEvent::Progress { current, total, .. } => Some(if *total > 0 {
                (*current * 100) / *total
            } else {
                100
            }),
            _ => None,
        }
    }
}

/// Observer trait for receiving session events.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { vid, pid, soc, mode } => {
                tracing::info!(
                    vid = %format!("{:04x}", vid),
                    pid = %format!("{:04x}", pid),
                    soc = %soc,
                    mode = %mode,
                    "Device connected"
                );
            }
            FlashEvent::Progress {
                operation,
                position,
                ..
            } => {
                tracing::debug!(
                    operation = %operation,
                    offset = %format!("0x{:08x}", position),
                    progress = %format!("{}%", event.percent().unwrap_or(0)),
                    "Progress"
                );
            }
            FlashEvent::Truncated { operation, reason } => {
                tracing::warn!(operation = %operation, "Stopped early: {}", reason);
            }
            FlashEvent::Complete { operation } => {
                tracing::info!(operation = %operation, "Done");
            }
            FlashEvent::Disconnected => {
                tracing::info!("Disconnected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        let ev = FlashEvent::Progress {
            operation: Operation::ReadFlash,
            position: 0,
            current: 8,
            total: 20,
        };
        assert_eq!(ev.percent(), Some(40));
        assert_eq!(FlashEvent::Disconnected.percent(), None);
    }
}
