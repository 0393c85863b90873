use axerrno::AxResult;

use super::entry::{enter, exception_vector_base};
use crate::stage2::{hcr_value, mair_value, vtcr_value};
use crate::{AxArchPerCpu, SysRegs, VCpuContext};

/// `HCR_EL2.RW`: keeps EL1 in AArch64 once virtualization is off.
const HCR_EL2_RW: u64 = 1 << 31;
/// `VMPIDR_EL2` bit 31 is RES1.
const MPIDR_RES1: u64 = 1 << 31;

/// EL2 state of one physical core.
pub struct Aarch64PerCpu {
    cpu_id: usize,
    enabled: bool,
}

impl AxArchPerCpu for Aarch64PerCpu {
    fn new(cpu_id: usize) -> AxResult<Self> {
        Ok(Self {
            cpu_id,
            enabled: false,
        })
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn hardware_enable(&mut self) -> AxResult {
        write_sysreg!(vbar_el2, exception_vector_base() as u64);
        write_sysreg!(vtcr_el2, vtcr_value());
        write_sysreg!(mair_el2, mair_value());
        write_sysreg!(hcr_el2, hcr_value());
        isb!();
        debug!(
            "cpu {}: hcr_el2 {:#x}, vtcr_el2 {:#x}",
            self.cpu_id,
            read_sysreg!(hcr_el2),
            read_sysreg!(vtcr_el2)
        );
        self.enabled = true;
        Ok(())
    }

    fn hardware_disable(&mut self) -> AxResult {
        write_sysreg!(hcr_el2, HCR_EL2_RW);
        write_sysreg!(vttbr_el2, 0);
        isb!();
        self.enabled = false;
        Ok(())
    }

    fn set_current_context(&mut self, ctx: *mut VCpuContext) {
        write_sysreg!(tpidr_el2, ctx as u64);
    }

    fn install_stage2(&mut self, vttbr: u64) {
        write_sysreg!(vttbr_el2, vttbr);
        isb!();
    }

    fn flush_guest_tlb(&mut self) {
        // SAFETY: TLB maintenance for the VMID just installed.
        unsafe {
            core::arch::asm!(
                "dsb ishst",
                "tlbi vmalls12e1",
                "dsb ish",
                "isb",
                options(nostack, preserves_flags),
            );
        }
    }

    fn restore_sysregs(&mut self, regs: &SysRegs) {
        write_sysreg!(spsr_el1, regs.spsr_el1);
        write_sysreg!(elr_el1, regs.elr_el1);
        write_sysreg!(vmpidr_el2, regs.mpidr_el1 | MPIDR_RES1);
        write_sysreg!(vpidr_el2, regs.midr_el1);
        write_sysreg!(sp_el0, regs.sp_el0);
        write_sysreg!(sp_el1, regs.sp_el1);
        write_sysreg!(ttbr0_el1, regs.ttbr0_el1);
        write_sysreg!(ttbr1_el1, regs.ttbr1_el1);
        write_sysreg!(tcr_el1, regs.tcr_el1);
        write_sysreg!(vbar_el1, regs.vbar_el1);
        write_sysreg!(sctlr_el1, regs.sctlr_el1);
        write_sysreg!(cntv_ctl_el0, regs.cntv_ctl_el0);
        write_sysreg!(cntv_tval_el0, regs.cntv_tval_el0);
        // CNTFRQ_EL0 is only writable from EL3; the guest sees the value firmware set.
        isb!();
    }

    fn enter_guest(&mut self, ctx: *mut VCpuContext) {
        trace!("cpu {}: eret to guest", self.cpu_id);
        // SAFETY: `ctx` was published by `set_current_context` and the rest of the
        // world switch has been done by the caller.
        unsafe { enter(ctx) }
    }
}
