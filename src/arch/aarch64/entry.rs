//! The EL2 exception vector and the guest entry path.
//!
//! Exceptions taken from the guest save its registers into the [`TrapFrame`] that
//! `TPIDR_EL2` points to, then call into the binary hosting the hypervisor:
//!
//! ```ignore
//! #[no_mangle]
//! extern "C" fn axhyper_guest_sync(esr: u64, far: u64, hpfar: u64);
//! #[no_mangle]
//! extern "C" fn axhyper_guest_irq();
//! ```
//!
//! which are expected to forward to [`AxHypervisor::handle_sync_exception`] and
//! [`AxHypervisor::handle_irq`] with the per-CPU state of the core. When they return,
//! the (possibly modified) frame is restored and the guest resumed.
//!
//! [`AxHypervisor::handle_sync_exception`]: crate::AxHypervisor::handle_sync_exception
//! [`AxHypervisor::handle_irq`]: crate::AxHypervisor::handle_irq

use core::arch::global_asm;
use core::mem::offset_of;

use crate::{TrapFrame, VCpuContext};

// The assembly below hard-codes this layout.
const _: () = assert!(offset_of!(VCpuContext, frame) == 0);
const _: () = assert!(offset_of!(TrapFrame, spsr) == 248);
const _: () = assert!(offset_of!(TrapFrame, elr) == 256);

global_asm!(
    r#"
.macro SAVE_GUEST
    stp     x0, x1, [sp, #-16]!
    mrs     x0, tpidr_el2
    stp     x2, x3, [x0, #16]
    stp     x4, x5, [x0, #32]
    stp     x6, x7, [x0, #48]
    stp     x8, x9, [x0, #64]
    stp     x10, x11, [x0, #80]
    stp     x12, x13, [x0, #96]
    stp     x14, x15, [x0, #112]
    stp     x16, x17, [x0, #128]
    stp     x18, x19, [x0, #144]
    stp     x20, x21, [x0, #160]
    stp     x22, x23, [x0, #176]
    stp     x24, x25, [x0, #192]
    stp     x26, x27, [x0, #208]
    stp     x28, x29, [x0, #224]
    str     x30, [x0, #240]
    ldp     x2, x3, [sp], #16
    stp     x2, x3, [x0]
    mrs     x1, spsr_el2
    mrs     x2, elr_el2
    stp     x1, x2, [x0, #248]
.endm

.macro UNEXPECTED kind
    .balign 0x80
    mov     x0, #\kind
    b       __axhyper_unexpected
.endm

.macro VECTOR target
    .balign 0x80
    b       \target
.endm

.section .text.axhyper_vectors, "ax"
.balign 0x800
.global __axhyper_vectors
__axhyper_vectors:
    // current EL with SP0
    UNEXPECTED 0
    UNEXPECTED 1
    UNEXPECTED 2
    UNEXPECTED 3
    // current EL with SPx
    UNEXPECTED 4
    UNEXPECTED 5
    UNEXPECTED 6
    UNEXPECTED 7
    // lower EL, AArch64
    VECTOR  __axhyper_lower_sync
    VECTOR  __axhyper_lower_irq
    UNEXPECTED 10
    UNEXPECTED 11
    // lower EL, AArch32
    UNEXPECTED 12
    UNEXPECTED 13
    UNEXPECTED 14
    UNEXPECTED 15

.text
__axhyper_unexpected:
    mrs     x1, esr_el2
    mrs     x2, elr_el2
    bl      axhyper_unhandled_exception

__axhyper_lower_sync:
    SAVE_GUEST
    mrs     x0, esr_el2
    mrs     x1, far_el2
    mrs     x2, hpfar_el2
    bl      axhyper_guest_sync
    mrs     x0, tpidr_el2
    b       __axhyper_guest_restore

__axhyper_lower_irq:
    SAVE_GUEST
    bl      axhyper_guest_irq
    mrs     x0, tpidr_el2
    b       __axhyper_guest_restore

// x0: the frame to restore
.global __axhyper_guest_restore
__axhyper_guest_restore:
    ldp     x1, x2, [x0, #248]
    msr     spsr_el2, x1
    msr     elr_el2, x2
    ldp     x2, x3, [x0, #16]
    ldp     x4, x5, [x0, #32]
    ldp     x6, x7, [x0, #48]
    ldp     x8, x9, [x0, #64]
    ldp     x10, x11, [x0, #80]
    ldp     x12, x13, [x0, #96]
    ldp     x14, x15, [x0, #112]
    ldp     x16, x17, [x0, #128]
    ldp     x18, x19, [x0, #144]
    ldp     x20, x21, [x0, #160]
    ldp     x22, x23, [x0, #176]
    ldp     x24, x25, [x0, #192]
    ldp     x26, x27, [x0, #208]
    ldp     x28, x29, [x0, #224]
    ldr     x30, [x0, #240]
    ldp     x0, x1, [x0]
    eret
"#
);

extern "C" {
    static __axhyper_vectors: u8;
    fn __axhyper_guest_restore(ctx: *mut VCpuContext) -> !;
}

#[no_mangle]
extern "C" fn axhyper_unhandled_exception(kind: u64, esr: u64, elr: u64) -> ! {
    panic!(
        "unhandled EL2 exception: vector {}, esr {:#x}, elr {:#x}",
        kind, esr, elr
    );
}

/// Address to load into `VBAR_EL2`.
pub fn exception_vector_base() -> usize {
    // SAFETY: only the address of the symbol is taken.
    unsafe { core::ptr::addr_of!(__axhyper_vectors) as usize }
}

/// Restores the guest registers in `ctx` and returns to the guest.
///
/// # Safety
///
/// `ctx` must point to the context published in `TPIDR_EL2`, and stage-2 translation
/// and the EL1 system registers of the vcpu must already be installed.
pub(super) unsafe fn enter(ctx: *mut VCpuContext) -> ! {
    __axhyper_guest_restore(ctx)
}
