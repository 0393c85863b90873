//! Virtual GICv3: distributor and redistributor emulation plus list register
//! bookkeeping.
//!
//! Interrupt configuration is kept per line in [`IrqConfig`] records. Shared lines live
//! in the per-VM [`VGicDist`], private lines (SGIs and PPIs) in the per-vCPU
//! [`VGicCpu`]. When both are needed the distributor lock is taken first.

use alloc::vec::Vec;

use axerrno::{ax_err, ax_err_type, AxResult};
use spin::{Mutex, MutexGuard};

use crate::gic::{list_register_inactive, make_list_register, GIC_NPPI, GIC_NSGI};
use crate::GicOps;

mod dist;
mod redist;

pub use dist::VGicDistDevice;
pub use redist::VGicRedistDevice;

/// Configuration of one interrupt line as programmed by the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqConfig {
    pub priority: u8,
    pub affinity: u8,
    pub enabled: bool,
    pub group: u8,
}

/// The emulated distributor of one VM.
#[derive(Debug)]
pub struct VGicDist {
    nspis: u32,
    enabled: bool,
    spis: Vec<IrqConfig>,
}

impl VGicDist {
    fn new(nspis: u32) -> Self {
        let spi = IrqConfig {
            affinity: 1,
            group: 1,
            ..Default::default()
        };
        Self {
            nspis,
            enabled: false,
            spis: alloc::vec![spi; nspis as usize],
        }
    }

    pub const fn nspis(&self) -> u32 {
        self.nspis
    }

    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn spi(&self, irq: u32) -> Option<&IrqConfig> {
        irq.checked_sub(32).and_then(|n| self.spis.get(n as usize))
    }
}

/// The emulated redistributor of one vCPU.
#[derive(Debug)]
pub struct VGicCpu {
    /// Occupied hardware list registers.
    used_lr: u16,
    sgis: [IrqConfig; GIC_NSGI],
    ppis: [IrqConfig; GIC_NPPI],
}

impl VGicCpu {
    fn new(vcpu_index: usize) -> Self {
        let private = IrqConfig {
            affinity: 1u8.wrapping_shl(vcpu_index as u32),
            group: 1,
            ..Default::default()
        };
        Self {
            used_lr: 0,
            sgis: [private; GIC_NSGI],
            ppis: [private; GIC_NPPI],
        }
    }

    pub const fn used_lr(&self) -> u16 {
        self.used_lr
    }

    /// Private line `irq` (0..32).
    pub fn private(&self, irq: u32) -> Option<&IrqConfig> {
        match irq as usize {
            n if n < GIC_NSGI => Some(&self.sgis[n]),
            n if n < GIC_NSGI + GIC_NPPI => Some(&self.ppis[n - GIC_NSGI]),
            _ => None,
        }
    }

    fn private_mut(&mut self, irq: u32) -> Option<&mut IrqConfig> {
        match irq as usize {
            n if n < GIC_NSGI => Some(&mut self.sgis[n]),
            n if n < GIC_NSGI + GIC_NPPI => Some(&mut self.ppis[n - GIC_NSGI]),
            _ => None,
        }
    }
}

/// Resolves line `irq` to its record: private lines to `cpu`, shared lines to `dist`.
///
/// Lines beyond the emulated range resolve to `None` and are logged.
pub(crate) fn irq_config<'a>(
    dist: &'a mut VGicDist,
    cpu: &'a mut VGicCpu,
    irq: u32,
) -> Option<&'a mut IrqConfig> {
    let config = if irq < 32 {
        cpu.private_mut(irq)
    } else {
        dist.spis.get_mut((irq - 32) as usize)
    };
    if config.is_none() {
        warn!("vgic: access to unsupported irq {}", irq);
    }
    config
}

/// List registers usable with the 16-bit occupancy bitmap.
fn max_lrs(gic: &dyn GicOps) -> usize {
    gic.num_lrs().min(u16::BITS as usize)
}

/// The virtual interrupt controller of one VM.
pub struct VGic {
    dist: Mutex<VGicDist>,
    cpus: Vec<Mutex<VGicCpu>>,
}

impl VGic {
    /// Creates the distributor with `nspis` shared lines and one redistributor per vCPU.
    pub fn new(nspis: u32, ncpu: usize) -> Self {
        Self {
            dist: Mutex::new(VGicDist::new(nspis)),
            cpus: (0..ncpu).map(|i| Mutex::new(VGicCpu::new(i))).collect(),
        }
    }

    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    pub fn nspis(&self) -> u32 {
        self.dist.lock().nspis
    }

    pub fn dist(&self) -> MutexGuard<'_, VGicDist> {
        self.dist.lock()
    }

    /// The redistributor state of vCPU `index`.
    pub fn cpu(&self, index: usize) -> AxResult<MutexGuard<'_, VGicCpu>> {
        self.cpus
            .get(index)
            .map(|cpu| cpu.lock())
            .ok_or_else(|| ax_err_type!(NotFound, "no vgic redistributor for vcpu"))
    }

    /// Snapshot of the configuration of line `irq` as seen by vCPU `index`.
    pub fn irq_config(&self, index: usize, irq: u32) -> Option<IrqConfig> {
        if irq < 32 {
            self.cpu(index).ok()?.private(irq).copied()
        } else {
            self.dist.lock().spi(irq).copied()
        }
    }

    /// Presents `virq` to vCPU `index`, backed by `pirq`, through a free list register of
    /// the current physical CPU.
    ///
    /// Returns the list register used. Fails with `ResourceBusy` when all list registers
    /// are occupied; nothing is queued.
    pub fn inject(&self, index: usize, gic: &dyn GicOps, pirq: u32, virq: u32) -> AxResult<usize> {
        let mut cpu = self.cpu(index)?;
        let n = (0..max_lrs(gic)).find(|n| cpu.used_lr & (1 << n) == 0);
        match n {
            Some(n) => {
                cpu.used_lr |= 1 << n;
                gic.write_lr(n, make_list_register(pirq, virq));
                trace!("vgic: irq {} -> vcpu {} via lr{}", virq, index, n);
                Ok(n)
            }
            None => {
                error!(
                    "vgic: no free list register for irq {} on vcpu {}",
                    virq, index
                );
                ax_err!(ResourceBusy, "no free list register")
            }
        }
    }

    /// Frees the list registers of vCPU `index` that hardware reports inactive.
    pub fn reclaim(&self, index: usize, gic: &dyn GicOps) -> AxResult {
        let mut cpu = self.cpu(index)?;
        for n in 0..max_lrs(gic) {
            if cpu.used_lr & (1 << n) != 0 && list_register_inactive(gic.read_lr(n)) {
                cpu.used_lr &= !(1 << n);
            }
        }
        Ok(())
    }
}
