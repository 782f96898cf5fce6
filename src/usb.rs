//! Host side lookup of the exploit device.
//!
//! Handy when the device is plugged into a PC instead of the console: the
//! number of configurations tells which identity is currently presented.

use crate::descriptor::{PRODUCT_ID, VENDOR_ID};
use crate::device::Identity;
use rusb::{Device, DeviceList, GlobalContext, Result};

/// What a host sees of the exploit device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub bus: u8,
    pub address: u8,
    pub num_configurations: u8,
    /// `None` if the configuration count matches no identity.
    pub identity: Option<Identity>,
}

impl Presence {
    fn of(device: &Device<GlobalContext>, num_configurations: u8) -> Self {
        Presence {
            bus: device.bus_number(),
            address: device.address(),
            num_configurations,
            identity: Identity::from_configuration_count(num_configurations),
        }
    }
}

/// Attempts to find the exploit device on any bus.
pub fn get_udpih_device(vid: Option<u16>, pid: Option<u16>) -> Result<Presence> {
    let vid = vid.unwrap_or(VENDOR_ID);
    let pid = pid.unwrap_or(PRODUCT_ID);

    let device_list = DeviceList::new()?;

    for device in device_list.iter() {
        let descriptor = device.device_descriptor()?;

        if descriptor.product_id() == pid && descriptor.vendor_id() == vid {
            return Ok(Presence::of(&device, descriptor.num_configurations()));
        }
    }

    Err(rusb::Error::NoDevice)
}
