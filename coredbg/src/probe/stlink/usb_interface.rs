//! Low-level USB transport for ST-Link adapters.
//!
//! Commands are fixed 16 byte frames on the bulk OUT endpoint; responses
//! arrive on a separate IN endpoint, SWV trace data on a third. A background
//! producer thread drains the IN endpoint into an in-order queue. The command
//! path primes the queue with the expected response size before the command
//! frame goes out, so response latency is decoupled from synchronous polling.

use super::StlinkError;
use crate::probe::{DebugProbeError, DebugProbeInfo};

use once_cell::sync::Lazy;
use rusb::{Context, DeviceHandle, UsbContext};

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// The fixed USB command frame size.
const CMD_LEN: usize = 16;

/// The ST-Link USB vendor id.
pub const USB_VID: u16 = 0x0483;

/// Timeout for a command/response round trip.
pub const TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout the producer thread grants a single bulk read.
const BULK_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Endpoints and version name per known USB PID.
#[derive(Clone, Debug)]
pub struct StLinkInfo {
    /// The marketing name of this hardware version.
    pub version_name: &'static str,
    pub(crate) ep_out: u8,
    pub(crate) ep_in: u8,
    pub(crate) ep_swv: u8,
}

impl StLinkInfo {
    const fn new(version_name: &'static str, ep_out: u8, ep_in: u8, ep_swv: u8) -> Self {
        Self {
            version_name,
            ep_out,
            ep_in,
            ep_swv,
        }
    }
}

/// Map of USB PID to firmware version name and device endpoints.
pub(crate) static USB_PID_EP_MAP: Lazy<HashMap<u16, StLinkInfo>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(0x3748, StLinkInfo::new("V2", 0x02, 0x81, 0x83));
    m.insert(0x374b, StLinkInfo::new("V2-1", 0x01, 0x81, 0x82));
    m.insert(0x374a, StLinkInfo::new("V2-1", 0x01, 0x81, 0x82)); // Audio
    m.insert(0x3742, StLinkInfo::new("V2-1", 0x01, 0x81, 0x82)); // No MSD
    m.insert(0x3752, StLinkInfo::new("V2-1", 0x01, 0x81, 0x82));
    m.insert(0x374e, StLinkInfo::new("V3", 0x01, 0x81, 0x82));
    m.insert(0x374f, StLinkInfo::new("V3", 0x01, 0x81, 0x82)); // Bridge
    m.insert(0x3753, StLinkInfo::new("V3", 0x01, 0x81, 0x82)); // 2VCP
    m
});

/// The transport operations the ST-Link driver needs. Factored into a trait
/// so the driver can be exercised against a mock in tests.
pub trait StLinkUsb: std::fmt::Debug + Send {
    /// Send a command frame, then optional data out, then read `read_data`
    /// bytes of response.
    fn write(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
        timeout: Duration,
    ) -> Result<(), StlinkError>;

    /// Read SWV trace bytes from the dedicated endpoint.
    fn read_swo(&mut self, read_data: &mut [u8], timeout: Duration)
        -> Result<usize, StlinkError>;

    /// Re-synchronize the transport after an error.
    fn reset(&mut self) -> Result<(), StlinkError>;
}

/// A physical ST-Link attached over USB.
pub struct StLinkUsbDevice {
    handle: Arc<DeviceHandle<Context>>,
    /// Endpoint map and version name of this device.
    pub info: StLinkInfo,
    request_tx: Option<mpsc::Sender<usize>>,
    response_rx: mpsc::Receiver<Result<Vec<u8>, rusb::Error>>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for StLinkUsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StLinkUsbDevice")
            .field("info", &self.info)
            .finish()
    }
}

impl StLinkUsbDevice {
    /// Open the device described by `info` and start the receive thread.
    pub fn new_from_info(info: &DebugProbeInfo) -> Result<Self, DebugProbeError> {
        let context =
            Context::new().map_err(|e| DebugProbeError::ProbeCouldNotBeCreated(e.to_string()))?;

        let device = context
            .devices()
            .map_err(|e| DebugProbeError::ProbeCouldNotBeCreated(e.to_string()))?
            .iter()
            .find(|device| {
                device
                    .device_descriptor()
                    .map(|d| {
                        d.vendor_id() == info.vendor_id && d.product_id() == info.product_id
                    })
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                DebugProbeError::ProbeCouldNotBeCreated("no matching USB device".to_string())
            })?;

        let mut handle = device
            .open()
            .map_err(|e| DebugProbeError::Usb(Box::new(e)))?;

        let stlink_info = USB_PID_EP_MAP
            .get(&info.product_id)
            .ok_or_else(|| {
                DebugProbeError::ProbeCouldNotBeCreated(format!(
                    "unknown ST-Link product id {:04x}",
                    info.product_id
                ))
            })?
            .clone();

        handle
            .claim_interface(0)
            .map_err(|e| DebugProbeError::Usb(Box::new(e)))?;

        // Verify that the expected endpoints exist on interface 0.
        let config = device
            .active_config_descriptor()
            .map_err(|e| DebugProbeError::Usb(Box::new(e)))?;
        let mut found = (false, false, false);
        if let Some(interface) = config.interfaces().next() {
            if let Some(descriptor) = interface.descriptors().next() {
                for endpoint in descriptor.endpoint_descriptors() {
                    if endpoint.address() == stlink_info.ep_out {
                        found.0 = true;
                    } else if endpoint.address() == stlink_info.ep_in {
                        found.1 = true;
                    } else if endpoint.address() == stlink_info.ep_swv {
                        found.2 = true;
                    }
                }
            }
        }
        if !(found.0 && found.1 && found.2) {
            return Err(DebugProbeError::EndpointNotFound);
        }

        let handle = Arc::new(handle);

        let (request_tx, request_rx) = mpsc::channel::<usize>();
        let (response_tx, response_rx) = mpsc::channel();

        // The producer thread performs no protocol logic; it turns primed
        // sizes into in-order response packets.
        let reader_handle = Arc::clone(&handle);
        let ep_in = stlink_info.ep_in;
        let reader = std::thread::Builder::new()
            .name("stlink-rx".to_string())
            .spawn(move || {
                while let Ok(size) = request_rx.recv() {
                    let result = read_exact(&reader_handle, ep_in, size);
                    if response_tx.send(result).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| DebugProbeError::Other(format!("failed to spawn rx thread: {e}")))?;

        tracing::debug!(
            "Opened ST-Link {} ({:04x}:{:04x})",
            stlink_info.version_name,
            info.vendor_id,
            info.product_id
        );

        Ok(Self {
            handle,
            info: stlink_info,
            request_tx: Some(request_tx),
            response_rx,
            reader: Some(reader),
        })
    }

    fn prime(&self, size: usize) -> Result<(), StlinkError> {
        self.request_tx
            .as_ref()
            .expect("receive thread is running while the device is open")
            .send(size)
            .map_err(|_| StlinkError::ReceiveThreadGone)
    }
}

/// Read exactly `size` bytes from the bulk IN endpoint.
fn read_exact(
    handle: &DeviceHandle<Context>,
    ep_in: u8,
    size: usize,
) -> Result<Vec<u8>, rusb::Error> {
    let mut buf = vec![0u8; size];
    let mut offset = 0;
    while offset < size {
        let n = handle.read_bulk(ep_in, &mut buf[offset..], BULK_READ_TIMEOUT)?;
        if n == 0 {
            return Err(rusb::Error::Io);
        }
        offset += n;
    }
    Ok(buf)
}

impl StLinkUsb for StLinkUsbDevice {
    fn write(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
        timeout: Duration,
    ) -> Result<(), StlinkError> {
        // Prime the queue before the command goes out, so the response is
        // picked up the moment the firmware produces it.
        if !read_data.is_empty() {
            self.prime(read_data.len())?;
        }

        // Command phase: pad to the fixed frame size.
        let mut frame = [0u8; CMD_LEN];
        frame[..cmd.len()].copy_from_slice(cmd);

        let written = self
            .handle
            .write_bulk(self.info.ep_out, &frame, timeout)
            .map_err(StlinkError::from)?;
        if written != CMD_LEN {
            return Err(StlinkError::NotEnoughBytesWritten {
                is: written,
                should: CMD_LEN,
            });
        }

        // Optional data out phase.
        if !write_data.is_empty() {
            let written = self
                .handle
                .write_bulk(self.info.ep_out, write_data, timeout)
                .map_err(StlinkError::from)?;
            if written != write_data.len() {
                return Err(StlinkError::NotEnoughBytesWritten {
                    is: written,
                    should: write_data.len(),
                });
            }
        }

        // Optional data in phase, consumed from the receive queue. The
        // producer thread owns the bulk read timeout; waiting here only
        // covers its scheduling.
        if !read_data.is_empty() {
            let packet = self
                .response_rx
                .recv_timeout(BULK_READ_TIMEOUT)
                .map_err(|_| StlinkError::ReceiveThreadGone)?
                .map_err(StlinkError::from)?;
            read_data.copy_from_slice(&packet);
        }

        Ok(())
    }

    fn read_swo(
        &mut self,
        read_data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, StlinkError> {
        // SWV has its own endpoint and does not interfere with the queue.
        self.handle
            .read_bulk(self.info.ep_swv, read_data, timeout)
            .map_err(StlinkError::from)
    }

    fn reset(&mut self) -> Result<(), StlinkError> {
        // Drop stale responses so commands and responses line up again.
        let mut drained = 0;
        while self.response_rx.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            tracing::warn!("Discarded {} stale ST-Link response packets", drained);
        }
        Ok(())
    }
}

impl Drop for StLinkUsbDevice {
    fn drop(&mut self) {
        // Closing the request channel stops the receive thread.
        self.request_tx.take();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

