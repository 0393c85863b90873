//! The physical interrupt controller as seen by the hypervisor.

use axerrno::AxResult;
use tock_registers::{register_bitfields, LocalRegisterCopy};

#[cfg(target_arch = "aarch64")]
mod gicv3;

#[cfg(target_arch = "aarch64")]
pub use gicv3::GicV3;

/// Largest SPI INTID the architecture allows; above it lie the special INTIDs.
pub const GIC_MAX_SPI: u32 = 1019;
/// First special INTID (1020..=1023), returned by an acknowledge with nothing pending.
pub const GIC_SPECIAL_INTID_START: u32 = 1020;

/// Software generated interrupts, 0..16.
pub const GIC_NSGI: usize = 16;
/// Private peripheral interrupts, 16..32.
pub const GIC_NPPI: usize = 16;
/// First shared peripheral interrupt.
pub const GIC_SPI_BASE: u32 = 32;

register_bitfields![u64,
    /// `ICH_LR<n>_EL2`, a hypervisor list register.
    pub ICH_LR [
        VINTID OFFSET(0) NUMBITS(32) [],
        PINTID OFFSET(32) NUMBITS(13) [],
        PRIORITY OFFSET(48) NUMBITS(8) [],
        GROUP OFFSET(60) NUMBITS(1) [],
        HW OFFSET(61) NUMBITS(1) [],
        STATE OFFSET(62) NUMBITS(2) [
            Invalid = 0,
            Pending = 1,
            Active = 2,
            PendingActive = 3
        ]
    ]
];

/// Builds a list register value presenting `virq` as pending group-1 to the guest, backed
/// by the hardware interrupt `pirq` so that the guest's deactivation also deactivates it.
pub fn make_list_register(pirq: u32, virq: u32) -> u64 {
    (ICH_LR::STATE::Pending
        + ICH_LR::HW::SET
        + ICH_LR::GROUP::SET
        + ICH_LR::PINTID.val(pirq as u64)
        + ICH_LR::VINTID.val(virq as u64))
    .value
}

/// Whether hardware reports the interrupt in `lr` as neither pending nor active.
pub fn list_register_inactive(lr: u64) -> bool {
    LocalRegisterCopy::<u64, ICH_LR::Register>::new(lr).matches_all(ICH_LR::STATE::Invalid)
}

/// Per-vCPU virtual CPU interface state restored on every world switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GicContext {
    /// `ICH_VMCR_EL2` baseline.
    pub vmcr: u64,
    /// Bits OR-ed into `ICC_SRE_EL1`.
    pub sre_el1: u64,
}

/// Operations of a physical interrupt controller generation.
///
/// Every method touches the controller of the calling core (system registers) or the
/// shared distributor (MMIO). Implementations serialize nothing themselves; the register
/// interface tolerates concurrent access from different cores.
pub trait GicOps: Send + Sync {
    /// Controller generation name, for logs.
    fn name(&self) -> &'static str;

    /// One-time global initialization of the distributor.
    fn init(&self) -> AxResult;

    /// Per-core initialization: redistributor wake, CPU interface and hypervisor control.
    fn init_percpu(&self, cpu_id: usize) -> AxResult;

    /// Disables forwarding of `irq`.
    fn mask(&self, irq: u32);
    /// Enables forwarding of `irq`.
    fn unmask(&self, irq: u32);
    fn set_affinity(&self, irq: u32, affinity: u8);

    /// Acknowledges the highest priority pending interrupt and returns its INTID.
    fn ack(&self) -> u32;
    /// Priority drop only. In split EOI mode the guest deactivates through the list
    /// register HW bit.
    fn eoi(&self, irq: u32);

    /// Number of implemented list registers.
    fn num_lrs(&self) -> usize;
    /// Highest implemented SPI INTID.
    fn max_spi(&self) -> u32;
    fn read_lr(&self, n: usize) -> u64;
    fn write_lr(&self, n: usize, val: u64);

    /// Writes the raw `ICC_SGI1R_EL1` payload.
    fn send_sgi(&self, sgir: u64);

    /// Current `ICH_VMCR_EL2` value.
    fn read_vmcr(&self) -> u64;
    /// Loads a vCPU's virtual interface state.
    fn restore_context(&self, ctx: &GicContext);

    /// 32-bit read of a physical distributor register.
    fn dist_read32(&self, offset: usize) -> u32;
    /// 32-bit read of a physical redistributor register of core `cpu`.
    fn redist_read32(&self, cpu: usize, offset: usize) -> u32;
    /// 64-bit read of a physical redistributor register of core `cpu`.
    fn redist_read64(&self, cpu: usize, offset: usize) -> u64;
}
