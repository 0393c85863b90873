//! System register access. Registers without an assembler mnemonic are named by their
//! encoding, e.g. `S3_4_C12_C9_5` for `ICC_SRE_EL2`.

macro_rules! read_sysreg {
    ($name:ident) => {{
        let val: u64;
        // SAFETY: reading a system register has no memory side effects.
        unsafe {
            core::arch::asm!(
                concat!("mrs {}, ", stringify!($name)),
                out(reg) val,
                options(nomem, nostack, preserves_flags),
            );
        }
        val
    }};
}

macro_rules! write_sysreg {
    ($name:ident, $val:expr) => {{
        let val: u64 = $val;
        // SAFETY: only EL2 code programs these registers, on its own core.
        unsafe {
            core::arch::asm!(
                concat!("msr ", stringify!($name), ", {}"),
                in(reg) val,
                options(nomem, nostack, preserves_flags),
            );
        }
    }};
}

macro_rules! isb {
    () => {
        // SAFETY: a barrier.
        unsafe { core::arch::asm!("isb", options(nostack, preserves_flags)) }
    };
}
