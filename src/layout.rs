//! Byte-exact mirrors of the victim's heap and event structures.
//!
//! The victim runs big-endian, so every multi-byte field is encoded
//! big-endian regardless of the host. Pointers are opaque 32-bit
//! addresses in the victim's address space.

use bytes::BufMut;

/// Allocator metadata preceding every heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapBlockHeader {
    pub magic: u32,
    pub size: u32,
    pub prev: u32,
    pub next: u32,
}

impl HeapBlockHeader {
    pub const SIZE: usize = 0x10;

    pub const SIZE_OFFSET: u32 = 0x4;
    pub const NEXT_OFFSET: u32 = 0xc;

    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u32(self.magic);
        out.put_u32(self.size);
        out.put_u32(self.prev);
        out.put_u32(self.next);
    }
}

/// Intrusive queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Queue {
    pub num_items: u32,
    pub first: u32,
    pub last: u32,
}

impl Queue {
    pub const SIZE: usize = 0xc;

    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u32(self.num_items);
        out.put_u32(self.first);
        out.put_u32(self.last);
    }
}

/// Link header every queued item starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueItemHeader {
    pub index: u32,
    pub queue: u32,
    pub prev: u32,
    pub next: u32,
}

impl QueueItemHeader {
    pub const SIZE: usize = 0x10;

    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u32(self.index);
        out.put_u32(self.queue);
        out.put_u32(self.prev);
        out.put_u32(self.next);
    }
}

/// A control transfer queued on the victim's transfer manager.
///
/// Once linked into `UhsCtrlXferMgr::control_transaction_queue`, the victim
/// performs the described request and calls `callback` on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlTransactionEvent {
    pub header: QueueItemHeader,
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    pub buffer: u32,
    pub argptr: u32,
    pub timeout: u32,
    pub result: i32,
    pub callback: u32,
}

impl ControlTransactionEvent {
    pub const SIZE: usize = 0x2c;

    pub fn encode(&self, out: &mut [u8]) {
        self.header.encode(&mut out[..QueueItemHeader::SIZE]);
        let mut out = &mut out[QueueItemHeader::SIZE..];
        out.put_u8(self.request_type);
        out.put_u8(self.request);
        out.put_u16(self.value);
        out.put_u16(self.index);
        out.put_u16(self.length);
        out.put_u32(self.buffer);
        out.put_u32(self.argptr);
        out.put_u32(self.timeout);
        out.put_i32(self.result);
        out.put_u32(self.callback);
    }
}

/// Field offsets of the victim's `UhsCtrlXferMgr`.
pub mod ctrl_xfer_mgr {
    pub const STATE: u32 = 0x00;
    pub const CONTROL_TRANSACTION_QUEUE: u32 = 0x18;
    pub const PENDING_TRANSACTION_EVENT: u32 = 0x28;
    pub const CTRL_XFER_TXN: u32 = 0x2c;
    pub const EVENTS: u32 = 0x50;
    pub const SIZE: u32 = 0x650;

    /// `UhsCtrlXferState::Idle`.
    pub const STATE_IDLE: u32 = 1;
}

/// Field offsets of the victim's `UhsDevice`.
pub mod uhs_device {
    pub const DEV_STRINGS: u32 = 0x1c;
    pub const CTRL_XFER_MGR: u32 = 0x7f0;
    pub const CONFIG_DESCRIPTORS: u32 = 0x824;
    pub const CONFIG_DESCRIPTORS_SIZE: u32 = 0x20 * 4;
}
