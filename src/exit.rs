use core::fmt;

use crate::{AccessSize, GuestPhysAddr};

/// Encoding of an AArch64 system register as reported in a trapped `MSR`/`MRS` syndrome.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SysRegAddr {
    pub op0: u8,
    pub op1: u8,
    pub crn: u8,
    pub crm: u8,
    pub op2: u8,
}

impl SysRegAddr {
    /// `ICC_SGI1R_EL1`, generates group 1 SGIs.
    pub const ICC_SGI1R_EL1: Self = Self::new(3, 0, 12, 11, 5);

    pub const fn new(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> Self {
        Self {
            op0,
            op1,
            crn,
            crm,
            op2,
        }
    }
}

impl fmt::Debug for SysRegAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "S{}_{}_C{}_C{}_{}",
            self.op0, self.op1, self.crn, self.crm, self.op2
        )
    }
}

/// Why a guest left EL1, decoded from `ESR_EL2` and the fault address registers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxVCpuExitReason {
    /// `HVC #imm`. The return address already points past the instruction.
    Hypercall {
        /// The immediate operand.
        imm: u16,
    },
    /// `SMC #imm`, trapped because `HCR_EL2.TSC` is set.
    SecureMonitorCall {
        /// The immediate operand.
        imm: u16,
    },
    /// `MRS` of a trapped system register.
    SysRegRead {
        addr: SysRegAddr,
        /// The GPR receiving the value.
        reg: usize,
    },
    /// `MSR` of a trapped system register.
    SysRegWrite {
        addr: SysRegAddr,
        /// The GPR holding the value.
        reg: usize,
    },
    /// A load from guest-physical memory without a stage-2 mapping.
    MmioRead {
        addr: GuestPhysAddr,
        width: AccessSize,
        /// The destination GPR, 31 meaning the zero register.
        reg: usize,
    },
    /// A store to guest-physical memory without a stage-2 mapping.
    MmioWrite {
        addr: GuestPhysAddr,
        width: AccessSize,
        /// The source GPR, 31 meaning the zero register.
        reg: usize,
    },
    /// Any exception class the hypervisor does not handle.
    Unknown {
        /// Exception class.
        ec: u8,
        /// Instruction specific syndrome.
        iss: u32,
    },
}

impl AxVCpuExitReason {
    /// Whether the guest must resume after the trapping instruction instead of at it.
    pub const fn skips_instruction(&self) -> bool {
        !matches!(
            self,
            AxVCpuExitReason::Hypercall { .. } | AxVCpuExitReason::Unknown { .. }
        )
    }
}
