#[macro_use]
mod sysreg;

mod entry;
mod percpu;

pub use entry::exception_vector_base;
pub use percpu::Aarch64PerCpu;

/// Issues an `SMC` to EL3 firmware with the SMC calling convention.
pub fn smc_call(function: u32, arg0: u64, arg1: u64) -> u64 {
    let mut x0 = function as u64;
    // SAFETY: firmware calls clobber at most x0-x17 under SMCCC.
    unsafe {
        core::arch::asm!(
            "smc #0",
            inout("x0") x0,
            inout("x1") arg0 => _,
            inout("x2") arg1 => _,
            out("x3") _, out("x4") _, out("x5") _, out("x6") _, out("x7") _,
            out("x8") _, out("x9") _, out("x10") _, out("x11") _, out("x12") _,
            out("x13") _, out("x14") _, out("x15") _, out("x16") _, out("x17") _,
            options(nostack),
        );
    }
    x0
}

/// Frequency of the system counter, as programmed by firmware.
pub fn timer_frequency() -> u64 {
    read_sysreg!(cntfrq_el0)
}
