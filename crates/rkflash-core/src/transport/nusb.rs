//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{Bulk, ControlOut, ControlType, In, Out, Recipient};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{TransportError, UsbTransport};
use crate::protocol::constants::{EP_IN, EP_OUT, ROCKCHIP_VENDOR_ID, soc_name};

/// Stand-in for "no timeout": the protocol itself never gives up.
const WAIT_FOREVER: Duration = Duration::from_secs(24 * 60 * 60);

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
    bcd_usb: u16,
    timeout: Duration,
}

impl NusbTransport {
    /// Open the first RockChip device whose PID is in the SoC table.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() == ROCKCHIP_VENDOR_ID
                && soc_name(device_info.product_id()).is_some()
            {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: ROCKCHIP_VENDOR_ID,
        })
    }

    /// Per-transfer timeout; zero waits forever.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = transfer_timeout(timeout_ms);
        self
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();
        let bcd_usb = device_info.usb_version();

        info!(
            vendor_id = %format!("{:04x}", vid),
            product_id = %format!("{:04x}", pid),
            bcd_usb = %format!("{:04x}", bcd_usb),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        // Detaches a bound kernel driver first where the platform needs it.
        let interface = device.detach_and_claim_interface(0).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: 0,
                message: e.to_string(),
            }
        })?;

        let (found_in, found_out) = bulk_endpoints(&device);
        let in_endpoint = found_in.unwrap_or_else(|| {
            debug!("no bulk IN endpoint on interface 0, falling back to 0x81");
            EP_IN
        });
        let out_endpoint = found_out.unwrap_or_else(|| {
            debug!("no bulk OUT endpoint on interface 0, falling back to 0x02");
            EP_OUT
        });

        info!(
            in_ep = %format!("0x{:02x}", in_endpoint),
            out_ep = %format!("0x{:02x}", out_endpoint),
            "Interface claimed"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
            bcd_usb,
            timeout: WAIT_FOREVER,
        })
    }
}

/// Deadline applied to every bulk and control transfer.
fn transfer_timeout(timeout_ms: u64) -> Duration {
    if timeout_ms == 0 {
        WAIT_FOREVER
    } else {
        Duration::from_millis(timeout_ms)
    }
}

/// Bulk IN and OUT endpoint addresses of interface 0, last one listed wins.
fn bulk_endpoints(device: &nusb::Device) -> (Option<u8>, Option<u8>) {
    let mut found = (None, None);
    for config in device.configurations() {
        for group in config.interfaces().filter(|g| g.interface_number() == 0) {
            for alt in group.alt_settings() {
                let bulk = alt
                    .endpoints()
                    .filter(|ep| ep.transfer_type() == nusb::descriptors::TransferType::Bulk);
                for ep in bulk {
                    match ep.direction() {
                        nusb::transfer::Direction::In => found.0 = Some(ep.address()),
                        nusb::transfer::Direction::Out => found.1 = Some(ep.address()),
                    }
                }
            }
        }
    }
    found
}

impl UsbTransport for NusbTransport {
    #[instrument(skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut buf = ep.allocate(data.len());
        buf.extend_from_slice(data);
        ep.submit(buf);

        let Some(completion) = ep.wait_next_complete(self.timeout) else {
            ep.cancel_all();
            return Err(TransportError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            });
        };
        completion
            .status
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = completion.actual_len, "Write complete");
        Ok(completion.actual_len)
    }

    #[instrument(skip(self), fields(max_len))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        // One transfer per call, so a status frame queued behind the data
        // phase is never read ahead and lost.
        let packet = ep.max_packet_size().max(1);
        let requested = max_len.div_ceil(packet).max(1) * packet;
        let mut buf = ep.allocate(requested);
        buf.set_requested_len(requested);
        ep.submit(buf);

        let Some(completion) = ep.wait_next_complete(self.timeout) else {
            ep.cancel_all();
            return Err(TransportError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            });
        };
        completion
            .status
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut data = completion.buffer.into_vec();
        data.truncate(completion.actual_len.min(max_len));
        debug!(bytes_read = data.len(), "Read complete");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed(e.to_string()))
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
