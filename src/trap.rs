use axerrno::{ax_err, AxResult};
use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::exit::SysRegAddr;
use crate::{AccessSize, AxVCpuExitReason, GuestPhysAddr};

register_bitfields![u64,
    pub ESR_EL2 [
        ISS OFFSET(0) NUMBITS(25) [],
        IL OFFSET(25) NUMBITS(1) [],
        EC OFFSET(26) NUMBITS(6) [
            HvcAArch64 = 0x16,
            SmcAArch64 = 0x17,
            SysRegAArch64 = 0x18,
            DataAbortLowerEL = 0x24
        ]
    ],

    /// ISS of a trapped `MSR`/`MRS`.
    pub ISS_SYSREG [
        DIRECTION OFFSET(0) NUMBITS(1) [
            Write = 0,
            Read = 1
        ],
        CRM OFFSET(1) NUMBITS(4) [],
        RT OFFSET(5) NUMBITS(5) [],
        CRN OFFSET(10) NUMBITS(4) [],
        OP1 OFFSET(14) NUMBITS(3) [],
        OP2 OFFSET(17) NUMBITS(3) [],
        OP0 OFFSET(20) NUMBITS(2) []
    ],

    /// ISS of a data abort.
    pub ISS_DABT [
        WNR OFFSET(6) NUMBITS(1) [],
        SRT OFFSET(16) NUMBITS(5) [],
        SAS OFFSET(22) NUMBITS(2) [],
        ISV OFFSET(24) NUMBITS(1) []
    ],

    /// ISS of `HVC`/`SMC`.
    pub ISS_CALL [
        IMM16 OFFSET(0) NUMBITS(16) []
    ]
];

/// The hardware registers describing a synchronous exception from the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapSyndrome {
    /// `ESR_EL2`
    pub esr: u64,
    /// `FAR_EL2`
    pub far: u64,
    /// `HPFAR_EL2`
    pub hpfar: u64,
}

impl TrapSyndrome {
    pub const fn new(esr: u64, far: u64, hpfar: u64) -> Self {
        Self { esr, far, hpfar }
    }

    fn esr(&self) -> LocalRegisterCopy<u64, ESR_EL2::Register> {
        LocalRegisterCopy::new(self.esr)
    }

    /// Exception class.
    pub fn ec(&self) -> u8 {
        self.esr().read(ESR_EL2::EC) as u8
    }

    /// Instruction specific syndrome.
    pub fn iss(&self) -> u32 {
        self.esr().read(ESR_EL2::ISS) as u32
    }

    /// Whether the trapped instruction was 32 bits wide.
    pub fn il(&self) -> bool {
        self.esr().is_set(ESR_EL2::IL)
    }

    /// Faulting guest-physical address of a stage-2 abort: the page from `HPFAR_EL2`
    /// combined with the page offset from `FAR_EL2`.
    pub fn fault_ipa(&self) -> GuestPhysAddr {
        GuestPhysAddr::from((((self.hpfar >> 4) << 12) | (self.far & 0xfff)) as usize)
    }

    /// Decodes the exception into an exit reason.
    ///
    /// Data aborts without a valid instruction syndrome cannot be emulated and fail with
    /// `InvalidData`.
    pub fn decode(&self) -> AxResult<AxVCpuExitReason> {
        let iss = self.iss() as u64;
        let reason = match self.esr().read_as_enum(ESR_EL2::EC) {
            Some(ESR_EL2::EC::Value::HvcAArch64) => AxVCpuExitReason::Hypercall {
                imm: LocalRegisterCopy::<u64, ISS_CALL::Register>::new(iss).read(ISS_CALL::IMM16)
                    as u16,
            },
            Some(ESR_EL2::EC::Value::SmcAArch64) => AxVCpuExitReason::SecureMonitorCall {
                imm: LocalRegisterCopy::<u64, ISS_CALL::Register>::new(iss).read(ISS_CALL::IMM16)
                    as u16,
            },
            Some(ESR_EL2::EC::Value::SysRegAArch64) => {
                let iss = LocalRegisterCopy::<u64, ISS_SYSREG::Register>::new(iss);
                let addr = SysRegAddr::new(
                    iss.read(ISS_SYSREG::OP0) as u8,
                    iss.read(ISS_SYSREG::OP1) as u8,
                    iss.read(ISS_SYSREG::CRN) as u8,
                    iss.read(ISS_SYSREG::CRM) as u8,
                    iss.read(ISS_SYSREG::OP2) as u8,
                );
                let reg = iss.read(ISS_SYSREG::RT) as usize;
                if iss.matches_all(ISS_SYSREG::DIRECTION::Read) {
                    AxVCpuExitReason::SysRegRead { addr, reg }
                } else {
                    AxVCpuExitReason::SysRegWrite { addr, reg }
                }
            }
            Some(ESR_EL2::EC::Value::DataAbortLowerEL) => {
                let iss = LocalRegisterCopy::<u64, ISS_DABT::Register>::new(iss);
                if !iss.is_set(ISS_DABT::ISV) {
                    error!(
                        "data abort without valid syndrome: esr {:#x}, far {:#x}, hpfar {:#x}",
                        self.esr, self.far, self.hpfar
                    );
                    return ax_err!(InvalidData, "data abort syndrome is not valid");
                }
                let addr = self.fault_ipa();
                let width = AccessSize::from_sas(iss.read(ISS_DABT::SAS));
                let reg = iss.read(ISS_DABT::SRT) as usize;
                if iss.is_set(ISS_DABT::WNR) {
                    AxVCpuExitReason::MmioWrite { addr, width, reg }
                } else {
                    AxVCpuExitReason::MmioRead { addr, width, reg }
                }
            }
            None => AxVCpuExitReason::Unknown {
                ec: self.ec(),
                iss: self.iss(),
            },
        };
        Ok(reason)
    }
}
