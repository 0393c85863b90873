//! Platform layout and the VM configuration record.
//!
//! The layout matches the QEMU `virt` machine with a GICv3.

use crate::GuestPhysAddr;

/// Number of physical cores, which also bounds the vCPU slot table.
pub const NCPU: usize = 4;

/// Stage-2 granule.
pub const PAGE_SIZE: usize = memory_addr::PAGE_SIZE_4K;

/// PL011 UART, passed through to the guest.
pub const PL011_BASE: usize = 0x0900_0000;

/// GIC distributor register window.
pub const GICD_BASE: usize = 0x0800_0000;
pub const GICD_SIZE: usize = 0x1_0000;

/// GIC redistributor register windows, one frame pair per core.
pub const GICR_BASE: usize = 0x080a_0000;
pub const GICR_SIZE: usize = 0x8_0000;
pub const GICR_STRIDE: usize = 0x2_0000;

/// MIDR reported to guests: Arm Cortex-A72 r0p1.
pub const GUEST_MIDR: u64 = 0x410F_D081;
pub const GUEST_CORE_NAME: &str = "Cortex-A72";

/// A blob packaged into the hypervisor image.
#[derive(Debug, Clone, Copy)]
pub struct GuestImage {
    pub name: &'static str,
    pub data: &'static [u8],
}

impl GuestImage {
    pub const fn new(name: &'static str, data: &'static [u8]) -> Self {
        Self { name, data }
    }

    pub const fn size(&self) -> usize {
        self.data.len()
    }
}

/// Everything the VM factory needs to materialize a guest.
#[derive(Debug, Clone)]
pub struct AxVMConfig {
    /// Kernel image, loaded at `entry`. Required.
    pub image: Option<GuestImage>,
    /// Device tree blob, copied to `dtb_addr` when present.
    pub dtb: Option<GuestImage>,
    /// Initial ramdisk, copied to `initrd_addr` when present.
    pub initrd: Option<GuestImage>,
    /// Guest-physical entry point of the boot vCPU, also the base of guest RAM.
    pub entry: GuestPhysAddr,
    /// Guest-physical address handed to the boot vCPU in `x0`.
    pub dtb_addr: GuestPhysAddr,
    pub initrd_addr: GuestPhysAddr,
    /// Bytes of guest RAM starting at `entry`.
    pub ram_size: usize,
    /// Number of virtual CPUs, at most [`NCPU`].
    pub ncpu: usize,
}
