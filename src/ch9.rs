//! The subset of USB 2.0 chapter 9 the exploit device speaks.
//!
//! Everything on the wire here is little-endian, unlike the victim's own
//! structures in [`crate::layout`].

use bytes::{Buf, BufMut};

pub const USB_DIR_OUT: u8 = 0x00;
pub const USB_DIR_IN: u8 = 0x80;
pub const USB_DIR_MASK: u8 = 0x80;

pub const USB_REQ_SET_ADDRESS: u8 = 0x05;
pub const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQ_SET_CONFIGURATION: u8 = 0x09;

pub const USB_DT_DEVICE: u8 = 0x01;
pub const USB_DT_CONFIG: u8 = 0x02;
pub const USB_DT_STRING: u8 = 0x03;
pub const USB_DT_ENDPOINT: u8 = 0x05;

pub const USB_DT_DEVICE_SIZE: usize = 18;
pub const USB_DT_CONFIG_SIZE: usize = 9;

pub const USB_CLASS_PER_INTERFACE: u8 = 0;
pub const USB_CONFIG_ATT_ONE: u8 = 0x80;
pub const USB_CONFIG_ATT_SELFPOWER: u8 = 0x40;

/// Address of the control endpoint, IN direction.
pub const EP0_IN: u8 = USB_DIR_IN;
/// Address of the control endpoint, OUT direction.
pub const EP0_OUT: u8 = USB_DIR_OUT;

/// Size of a SETUP packet.
pub const SETUP_PACKET_SIZE: usize = 8;

/// Speed of the link the device enumerated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Full,
    High,
}

/// Transfer direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// The direction encoded in an endpoint address or `bmRequestType`.
    pub fn from_bits(bits: u8) -> Self {
        if bits & USB_DIR_MASK == USB_DIR_IN {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::In => Direction::Out,
            Direction::Out => Direction::In,
        }
    }

    /// Address of endpoint zero in this direction.
    pub fn ep0(self) -> u8 {
        match self {
            Direction::In => EP0_IN,
            Direction::Out => EP0_OUT,
        }
    }
}

/// A decoded SETUP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    pub fn parse(packet: &[u8; SETUP_PACKET_SIZE]) -> Self {
        let mut buf = &packet[..];
        ControlRequest {
            request_type: buf.get_u8(),
            request: buf.get_u8(),
            value: buf.get_u16_le(),
            index: buf.get_u16_le(),
            length: buf.get_u16_le(),
        }
    }

    /// Builds a standard `GET_DESCRIPTOR` request.
    pub fn get_descriptor(kind: u8, descriptor_index: u8, index: u16, length: u16) -> Self {
        ControlRequest {
            request_type: USB_DIR_IN,
            request: USB_REQ_GET_DESCRIPTOR,
            value: (kind as u16) << 8 | descriptor_index as u16,
            index,
            length,
        }
    }

    pub fn set_address(address: u8) -> Self {
        ControlRequest {
            request_type: USB_DIR_OUT,
            request: USB_REQ_SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn set_configuration(value: u8) -> Self {
        ControlRequest {
            request_type: USB_DIR_OUT,
            request: USB_REQ_SET_CONFIGURATION,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bits(self.request_type)
    }

    /// Descriptor type of a `GET_DESCRIPTOR` request.
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }
}

/// Standard device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u8(USB_DT_DEVICE_SIZE as u8);
        out.put_u8(USB_DT_DEVICE);
        out.put_u16_le(self.bcd_usb);
        out.put_u8(self.device_class);
        out.put_u8(self.device_sub_class);
        out.put_u8(self.device_protocol);
        out.put_u8(self.max_packet_size0);
        out.put_u16_le(self.vendor_id);
        out.put_u16_le(self.product_id);
        out.put_u16_le(self.bcd_device);
        out.put_u8(self.manufacturer);
        out.put_u8(self.product);
        out.put_u8(self.serial_number);
        out.put_u8(self.num_configurations);
    }
}

/// Standard configuration descriptor header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
}

/// Offset of `wTotalLength` inside a configuration descriptor.
pub const CONFIG_TOTAL_LENGTH_OFFSET: usize = 2;

impl ConfigDescriptor {
    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u8(USB_DT_CONFIG_SIZE as u8);
        out.put_u8(USB_DT_CONFIG);
        out.put_u16_le(self.total_length);
        out.put_u8(self.num_interfaces);
        out.put_u8(self.configuration_value);
        out.put_u8(self.configuration);
        out.put_u8(self.attributes);
        out.put_u8(self.max_power);
    }

    /// Rewrites `wTotalLength` of an already encoded header.
    pub fn set_total_length(out: &mut [u8], total_length: u16) {
        let mut field = &mut out[CONFIG_TOTAL_LENGTH_OFFSET..CONFIG_TOTAL_LENGTH_OFFSET + 2];
        field.put_u16_le(total_length);
    }

    /// Reads `wTotalLength` back out of an encoded header.
    pub fn total_length_of(data: &[u8]) -> u16 {
        let mut field = &data[CONFIG_TOTAL_LENGTH_OFFSET..CONFIG_TOTAL_LENGTH_OFFSET + 2];
        field.get_u16_le()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setup_packet() {
        let request = ControlRequest::parse(&[0x80, 0x06, 0x00, 0x02, 0x03, 0x00, 0x09, 0x00]);
        assert_eq!(request.request_type, USB_DIR_IN);
        assert_eq!(request.request, USB_REQ_GET_DESCRIPTOR);
        assert_eq!(request.descriptor_type(), USB_DT_CONFIG);
        assert_eq!(request.value & 0xff, 0);
        assert_eq!(request.index, 3);
        assert_eq!(request.length, 9);
        assert_eq!(request.direction(), Direction::In);
        assert_eq!(request, ControlRequest::get_descriptor(USB_DT_CONFIG, 0, 3, 9));
    }

    #[test]
    fn test_direction_endpoints() {
        assert_eq!(Direction::from_bits(EP0_IN), Direction::In);
        assert_eq!(Direction::from_bits(EP0_OUT), Direction::Out);
        assert_eq!(Direction::In.opposite().ep0(), EP0_OUT);
    }

    #[test]
    fn test_config_header() {
        let mut buf = [0u8; USB_DT_CONFIG_SIZE];
        let header = ConfigDescriptor {
            total_length: 9,
            num_interfaces: 0,
            configuration_value: 0,
            configuration: 0,
            attributes: USB_CONFIG_ATT_ONE | USB_CONFIG_ATT_SELFPOWER,
            max_power: 50,
        };
        header.encode(&mut buf);
        assert_eq!(buf, [0x09, 0x02, 0x09, 0x00, 0x00, 0x00, 0x00, 0xc0, 0x32]);

        ConfigDescriptor::set_total_length(&mut buf, 0xaa20);
        assert_eq!(&buf[2..4], &[0x20, 0xaa]);
        assert_eq!(ConfigDescriptor::total_length_of(&buf), 0xaa20);
    }
}
