//! Discovery of CMSIS-DAP devices on the USB bus.

use super::commands::CmsisDapDevice;
use crate::probe::{DebugProbeError, DebugProbeInfo, DebugProbeType};

use rusb::UsbContext;

/// List all connected CMSIS-DAP devices.
///
/// Devices are identified by their product string containing `CMSIS-DAP`, as
/// the protocol specification mandates.
pub fn list_cmsisdap_devices() -> Vec<DebugProbeInfo> {
    let mut probes = Vec::new();

    if let Ok(api) = hidapi::HidApi::new() {
        for device in api.device_list() {
            let product = device.product_string().unwrap_or("");
            if product.contains("CMSIS-DAP") {
                probes.push(DebugProbeInfo {
                    identifier: product.to_string(),
                    vendor_id: device.vendor_id(),
                    product_id: device.product_id(),
                    serial_number: device.serial_number().map(Into::into),
                    probe_type: DebugProbeType::CmsisDap,
                });
            }
        }
    }

    tracing::debug!("Found {} CMSIS-DAP probes", probes.len());
    probes
}

/// Open the device behind `info`, preferring the v2 bulk interface and
/// falling back to v1 HID.
pub fn open_device_from_info(info: &DebugProbeInfo) -> Result<CmsisDapDevice, DebugProbeError> {
    if let Some(device) = open_v2_device(info) {
        return Ok(device);
    }

    open_v1_device(info)
}

fn open_v1_device(info: &DebugProbeInfo) -> Result<CmsisDapDevice, DebugProbeError> {
    let api = hidapi::HidApi::new()
        .map_err(|e| DebugProbeError::ProbeCouldNotBeCreated(e.to_string()))?;

    let device = api
        .device_list()
        .find(|d| {
            d.vendor_id() == info.vendor_id
                && d.product_id() == info.product_id
                && (info.serial_number.is_none()
                    || d.serial_number() == info.serial_number.as_deref())
        })
        .ok_or_else(|| {
            DebugProbeError::ProbeCouldNotBeCreated("no matching HID device".to_string())
        })?
        .open_device(&api)
        .map_err(|e| DebugProbeError::ProbeCouldNotBeCreated(e.to_string()))?;

    tracing::debug!("Opened {:04x}:{:04x} in CMSIS-DAP v1 mode", info.vendor_id, info.product_id);

    Ok(CmsisDapDevice::V1 {
        handle: device,
        // The protocol minimum; the driver probes for a larger report size
        // right after opening.
        report_size: 64,
    })
}

fn open_v2_device(info: &DebugProbeInfo) -> Option<CmsisDapDevice> {
    // A v2 interface is a vendor-specific class with a bulk OUT and a bulk IN
    // endpoint and an interface string containing "CMSIS-DAP".
    let context = rusb::Context::new().ok()?;

    for device in context.devices().ok()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != info.vendor_id || descriptor.product_id() != info.product_id {
            continue;
        }

        let Ok(mut handle) = device.open() else {
            continue;
        };
        let Ok(config) = device.active_config_descriptor() else {
            continue;
        };

        for interface in config.interfaces() {
            for idesc in interface.descriptors() {
                if idesc.class_code() != 0xFF {
                    continue;
                }

                let timeout = std::time::Duration::from_millis(100);
                let Some(language) = handle
                    .read_languages(timeout)
                    .ok()
                    .and_then(|languages| languages.first().copied())
                else {
                    continue;
                };
                let name = handle
                    .read_interface_string(language, &idesc, timeout)
                    .unwrap_or_default();
                if !name.contains("CMSIS-DAP") {
                    continue;
                }

                let mut out_ep = None;
                let mut in_ep = None;
                let mut max_packet_size = 64;
                for ep in idesc.endpoint_descriptors() {
                    if ep.transfer_type() == rusb::TransferType::Bulk {
                        match ep.direction() {
                            rusb::Direction::Out if out_ep.is_none() => {
                                out_ep = Some(ep.address())
                            }
                            rusb::Direction::In if in_ep.is_none() => {
                                in_ep = Some(ep.address());
                                max_packet_size = ep.max_packet_size() as usize;
                            }
                            _ => {}
                        }
                    }
                }

                if let (Some(out_ep), Some(in_ep)) = (out_ep, in_ep) {
                    if handle.claim_interface(idesc.interface_number()).is_err() {
                        continue;
                    }
                    tracing::debug!(
                        "Opened {:04x}:{:04x} in CMSIS-DAP v2 mode",
                        info.vendor_id,
                        info.product_id
                    );
                    return Some(CmsisDapDevice::V2 {
                        handle,
                        out_ep,
                        in_ep,
                        max_packet_size,
                    });
                }
            }
        }
    }

    None
}
