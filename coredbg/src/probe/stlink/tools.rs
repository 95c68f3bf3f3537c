//! Discovery of ST-Link devices on the USB bus.

use super::usb_interface::{USB_PID_EP_MAP, USB_VID};
use crate::probe::{DebugProbeInfo, DebugProbeType};

use rusb::UsbContext;

use std::time::Duration;

/// List all connected ST-Link probes.
pub fn list_stlink_devices() -> Vec<DebugProbeInfo> {
    let mut probes = Vec::new();

    let Ok(context) = rusb::Context::new() else {
        return probes;
    };
    let Ok(devices) = context.devices() else {
        return probes;
    };

    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != USB_VID {
            continue;
        }
        let Some(info) = USB_PID_EP_MAP.get(&descriptor.product_id()) else {
            continue;
        };

        let serial_number = device.open().ok().and_then(|handle| {
            let timeout = Duration::from_millis(100);
            let language = handle.read_languages(timeout).ok()?.first().copied()?;
            handle
                .read_serial_number_string(language, &descriptor, timeout)
                .ok()
        });

        probes.push(DebugProbeInfo {
            identifier: format!("ST-Link {}", info.version_name),
            vendor_id: USB_VID,
            product_id: descriptor.product_id(),
            serial_number,
            probe_type: DebugProbeType::StLink,
        });
    }

    tracing::debug!("Found {} ST-Link probes", probes.len());
    probes
}
