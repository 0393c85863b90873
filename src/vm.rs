use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::{
    AxHyperHal, GuestPhysAddr, MmioRegion, Stage2PageTable, VCpuId, VGic, VirtMmioDevice,
};

/// A guest virtual machine.
///
/// VMs are built by [`AxHypervisor::create_guest_vm`](crate::AxHypervisor::create_guest_vm)
/// and live until the system shuts down.
pub struct AxVM<H: AxHyperHal> {
    id: usize,
    name: String,
    dtb_addr: GuestPhysAddr,
    /// Slots of the vcpus, indexed by their index inside this VM.
    vcpus: Mutex<Vec<VCpuId>>,
    stage2: Mutex<Stage2PageTable<H>>,
    /// Trap regions, most recently registered first.
    mmio: Mutex<Vec<MmioRegion>>,
    vgic: VGic,
}

impl<H: AxHyperHal> AxVM<H> {
    pub(crate) fn new(
        id: usize,
        name: &str,
        ncpu: usize,
        nspis: u32,
        dtb_addr: GuestPhysAddr,
    ) -> AxResult<Self> {
        Ok(Self {
            id,
            name: String::from(name),
            dtb_addr,
            vcpus: Mutex::new(Vec::with_capacity(ncpu)),
            stage2: Mutex::new(Stage2PageTable::new()?),
            mmio: Mutex::new(Vec::new()),
            vgic: VGic::new(nspis, ncpu),
        })
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of vcpus of this VM.
    pub fn ncpu(&self) -> usize {
        self.vgic.ncpu()
    }

    pub const fn dtb_addr(&self) -> GuestPhysAddr {
        self.dtb_addr
    }

    pub fn vgic(&self) -> &VGic {
        &self.vgic
    }

    pub fn stage2(&self) -> &Mutex<Stage2PageTable<H>> {
        &self.stage2
    }

    /// `VTTBR_EL2` value of this VM.
    pub fn vttbr(&self) -> u64 {
        self.stage2.lock().vttbr(self.id as u16)
    }

    /// The slot of vcpu `index`.
    pub fn vcpu_id(&self, index: usize) -> Option<VCpuId> {
        self.vcpus.lock().get(index).copied()
    }

    pub fn vcpu_ids(&self) -> Vec<VCpuId> {
        self.vcpus.lock().clone()
    }

    pub(crate) fn add_vcpu(&self, id: VCpuId) {
        self.vcpus.lock().push(id);
    }

    /// Routes guest accesses to `[base, base + size)` to `device`.
    ///
    /// A later registration shadows earlier overlapping ones.
    pub fn register_mmio_trap(
        &self,
        base: GuestPhysAddr,
        size: usize,
        device: Arc<dyn VirtMmioDevice>,
    ) -> AxResult {
        if size == 0 {
            return ax_err!(InvalidInput, "mmio trap region must not be empty");
        }
        let mut mmio = self.mmio.lock();
        if let Some(other) = mmio.iter().find(|r| r.overlaps(base, size)) {
            warn!(
                "vm {}: mmio region {} at {:?} overlaps {} at {:?}",
                self.id,
                device.name(),
                base,
                other.device.name(),
                other.base
            );
        }
        debug!(
            "vm {}: mmio trap {} [{:?}, +{:#x})",
            self.id,
            device.name(),
            base,
            size
        );
        mmio.insert(0, MmioRegion { base, size, device });
        Ok(())
    }

    /// Runs `f` over the trap regions in lookup order, with registration locked out.
    pub fn with_mmio_regions<R>(&self, f: impl FnOnce(&[MmioRegion]) -> R) -> R {
        f(&self.mmio.lock())
    }
}
