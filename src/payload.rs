//! Opaque binaries embedded in the final configuration descriptor.

use crate::blueprint::HeapGeometry;
use crate::ch9::Speed;
use crate::error::{Error, Result};
use crate::rop::{ARM_KERNEL_OFFSET, CUSTOM_EVENT_OFFSET};
use bytes::Bytes;

/// Maximum size of the kernel binary: it sits between the final chain and
/// the forged event.
pub const ARM_KERNEL_MAX_SIZE: usize = CUSTOM_EVENT_OFFSET - ARM_KERNEL_OFFSET;

/// The kernel-mode binary plus the heap repair snapshots copied over the
/// victim's control transfer manager surroundings.
#[derive(Debug, Clone, Default)]
pub struct Payloads {
    arm_kernel: Bytes,
    heap_repair_full_speed: Bytes,
    heap_repair_high_speed: Option<Bytes>,
}

impl Payloads {
    /// Creates payloads for a full speed link.
    pub fn new(arm_kernel: Bytes, heap_repair: Bytes) -> Result<Self> {
        check_size("arm kernel", arm_kernel.len(), ARM_KERNEL_MAX_SIZE)?;
        check_size(
            "full speed heap repair",
            heap_repair.len(),
            HeapGeometry::for_speed(Speed::Full).heap_repair_capacity(),
        )?;

        Ok(Payloads {
            arm_kernel,
            heap_repair_full_speed: heap_repair,
            heap_repair_high_speed: None,
        })
    }

    /// Adds the heap repair snapshot used on a high speed link.
    pub fn with_high_speed_repair(mut self, heap_repair: Bytes) -> Result<Self> {
        check_size(
            "high speed heap repair",
            heap_repair.len(),
            HeapGeometry::for_speed(Speed::High).heap_repair_capacity(),
        )?;
        self.heap_repair_high_speed = Some(heap_repair);
        Ok(self)
    }

    pub fn arm_kernel(&self) -> &[u8] {
        &self.arm_kernel
    }

    /// The heap repair snapshot for `speed`, if one was provided.
    pub fn heap_repair(&self, speed: Speed) -> Option<&[u8]> {
        match speed {
            Speed::Full => Some(&self.heap_repair_full_speed),
            Speed::High => self.heap_repair_high_speed.as_deref(),
        }
    }
}

fn check_size(what: &'static str, size: usize, limit: usize) -> Result<()> {
    if size > limit {
        return Err(Error::PayloadTooBig { what, size, limit });
    }
    Ok(())
}
