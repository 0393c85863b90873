use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};

use crate::{GicOps, GuestPhysAddr, TrapFrame, VGic};

/// Width of a trapped memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    Byte = 1,
    HalfWord = 2,
    Word = 4,
    DoubleWord = 8,
}

impl AccessSize {
    /// Decodes the `SAS` field of a data abort syndrome.
    pub const fn from_sas(sas: u64) -> Self {
        match sas & 0b11 {
            0 => AccessSize::Byte,
            1 => AccessSize::HalfWord,
            2 => AccessSize::Word,
            _ => AccessSize::DoubleWord,
        }
    }

    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Truncates `val` to the access width.
    pub const fn truncate(self, val: u64) -> u64 {
        match self {
            AccessSize::DoubleWord => val,
            _ => val & ((1u64 << (8 * self.bytes())) - 1),
        }
    }
}

/// A decoded guest memory access that faulted in stage 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioAccess {
    /// Faulting guest-physical address.
    pub ipa: GuestPhysAddr,
    /// Guest PC of the faulting instruction.
    pub pc: u64,
    pub write: bool,
    pub size: AccessSize,
}

/// What an emulated device sees of the vcpu that faulted.
pub struct MmioContext<'a> {
    pub vgic: &'a VGic,
    /// Index of the faulting vcpu inside its VM.
    pub vcpu_index: usize,
    pub gic: &'a dyn GicOps,
}

/// A device emulated behind a trapped guest-physical range.
///
/// A device that leaves a direction unimplemented fails accesses in that direction.
pub trait VirtMmioDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Handles a read at `offset` from the region base.
    fn read(&self, _ctx: &MmioContext, _offset: usize, _access: &MmioAccess) -> AxResult<u64> {
        ax_err!(Unsupported, "mmio device does not handle reads")
    }

    /// Handles a write of `val` at `offset` from the region base.
    fn write(
        &self,
        _ctx: &MmioContext,
        _offset: usize,
        _val: u64,
        _access: &MmioAccess,
    ) -> AxResult {
        ax_err!(Unsupported, "mmio device does not handle writes")
    }
}

/// A registered trap region.
#[derive(Clone)]
pub struct MmioRegion {
    pub base: GuestPhysAddr,
    pub size: usize,
    pub device: Arc<dyn VirtMmioDevice>,
}

impl MmioRegion {
    pub fn contains(&self, ipa: GuestPhysAddr) -> bool {
        let (base, ipa) = (self.base.as_usize(), ipa.as_usize());
        base <= ipa && ipa - base < self.size
    }

    pub fn overlaps(&self, base: GuestPhysAddr, size: usize) -> bool {
        let (a0, b0) = (self.base.as_usize(), base.as_usize());
        a0 < b0.saturating_add(size) && b0 < a0.saturating_add(self.size)
    }
}

/// Routes `access` to the first of `regions` containing the faulting address.
///
/// `regions` is searched front to back. `reg` is the general purpose register named by
/// the syndrome, 31 meaning the zero register.
pub fn dispatch<'r>(
    regions: impl IntoIterator<Item = &'r MmioRegion>,
    ctx: &MmioContext,
    frame: &mut TrapFrame,
    reg: usize,
    access: &MmioAccess,
) -> AxResult {
    let region = match regions.into_iter().find(|r| r.contains(access.ipa)) {
        Some(region) => region,
        None => {
            error!("no mmio region for {:?} (pc {:#x})", access.ipa, access.pc);
            return ax_err!(NotFound, "unhandled mmio access");
        }
    };
    let offset = access.ipa.as_usize() - region.base.as_usize();

    if access.write {
        let val = access.size.truncate(frame.gpr(reg));
        trace!(
            "mmio write {} +{:#x} <- {:#x} ({:?})",
            region.device.name(),
            offset,
            val,
            access.size
        );
        region.device.write(ctx, offset, val, access)
    } else {
        let val = region.device.read(ctx, offset, access)?;
        trace!(
            "mmio read {} +{:#x} -> {:#x} ({:?})",
            region.device.name(),
            offset,
            val,
            access.size
        );
        frame.set_gpr(reg, access.size.truncate(val));
        Ok(())
    }
}
