use axerrno::AxResult;

use super::{IrqConfig, VGicCpu};
use crate::config::GICR_STRIDE;
use crate::{MmioAccess, MmioContext, VirtMmioDevice};

// RD_base frame.
pub const GICR_CTLR: usize = 0x0;
pub const GICR_IIDR: usize = 0x4;
pub const GICR_TYPER: usize = 0x8;
pub const GICR_TYPER_HI: usize = 0xc;
pub const GICR_WAKER: usize = 0x14;
pub const GICR_PIDR2: usize = 0xffe8;

// SGI_base frame, 64K above RD_base.
pub const GICR_SGI_BASE: usize = 0x1_0000;
pub const GICR_IGROUPR0: usize = GICR_SGI_BASE + 0x80;
pub const GICR_ISENABLER0: usize = GICR_SGI_BASE + 0x100;
pub const GICR_ICENABLER0: usize = GICR_SGI_BASE + 0x180;
pub const GICR_ISPENDR0: usize = GICR_SGI_BASE + 0x200;
pub const GICR_ICPENDR0: usize = GICR_SGI_BASE + 0x280;
pub const GICR_ISACTIVER0: usize = GICR_SGI_BASE + 0x300;
pub const GICR_ICACTIVER0: usize = GICR_SGI_BASE + 0x380;
pub const GICR_IPRIORITYR: usize = GICR_SGI_BASE + 0x400;
pub const GICR_IPRIORITYR_LAST: usize = GICR_IPRIORITYR + 8 * 4 - 1;
pub const GICR_ICFGR0: usize = GICR_SGI_BASE + 0xc00;
pub const GICR_ICFGR1: usize = GICR_SGI_BASE + 0xc04;
pub const GICR_IGRPMODR0: usize = GICR_SGI_BASE + 0xd00;

/// `GICR_TYPER.Last`: this is the last redistributor of the region.
const GICR_TYPER_LAST: u64 = 1 << 4;

/// The emulated redistributor windows, one [`GICR_STRIDE`] sized frame pair per vCPU.
pub struct VGicRedistDevice;

/// Splits an offset into the region into a vcpu index and an offset inside its frames.
pub const fn gicr_offset(offset: usize) -> (usize, usize) {
    (offset / GICR_STRIDE, offset % GICR_STRIDE)
}

fn private_bits(cpu: &VGicCpu, get: impl Fn(&IrqConfig) -> bool) -> u64 {
    (0..32)
        .filter_map(|irq| cpu.private(irq).map(|config| (irq, config)))
        .filter(|(_, config)| get(config))
        .fold(0u32, |reg, (irq, _)| reg | (1 << irq)) as u64
}

impl VirtMmioDevice for VGicRedistDevice {
    fn name(&self) -> &str {
        "vgic-redist"
    }

    fn read(&self, ctx: &MmioContext, offset: usize, access: &MmioAccess) -> AxResult<u64> {
        let (index, reg) = gicr_offset(offset);
        if index >= ctx.vgic.ncpu() {
            warn!("vgic-redist: read of redistributor {} out of range", index);
            return Ok(0);
        }

        match reg {
            GICR_CTLR | GICR_WAKER => Ok(0),
            GICR_IIDR => Ok(ctx.gic.redist_read32(index, GICR_IIDR) as u64),
            GICR_TYPER => {
                let mut typer = ctx.gic.redist_read64(index, GICR_TYPER) & !GICR_TYPER_LAST;
                if index + 1 == ctx.vgic.ncpu() {
                    typer |= GICR_TYPER_LAST;
                }
                Ok(typer)
            }
            GICR_TYPER_HI => Ok(ctx.gic.redist_read64(index, GICR_TYPER) >> 32),
            GICR_PIDR2 => Ok(ctx.gic.redist_read32(index, GICR_PIDR2) as u64),
            GICR_IGROUPR0 => Ok(private_bits(&*ctx.vgic.cpu(index)?, |c| c.group != 0)),
            GICR_ISENABLER0 | GICR_ICENABLER0 => {
                Ok(private_bits(&*ctx.vgic.cpu(index)?, |c| c.enabled))
            }
            GICR_IPRIORITYR..=GICR_IPRIORITYR_LAST => {
                let cpu = ctx.vgic.cpu(index)?;
                let first = (reg - GICR_IPRIORITYR) as u32;
                let count = access.size.bytes().min(4) as u32;
                Ok((0..count)
                    .filter_map(|i| cpu.private(first + i).map(|c| (i, c.priority)))
                    .fold(0u64, |val, (i, prio)| val | ((prio as u64) << (i * 8))))
            }
            GICR_ISPENDR0 | GICR_ICPENDR0 | GICR_ISACTIVER0 | GICR_ICACTIVER0 | GICR_ICFGR0
            | GICR_ICFGR1 | GICR_IGRPMODR0 => Ok(0),
            _ => {
                warn!(
                    "vgic-redist: unhandled read of redistributor {} at {:#x}",
                    index, reg
                );
                Ok(0)
            }
        }
    }

    fn write(&self, ctx: &MmioContext, offset: usize, val: u64, access: &MmioAccess) -> AxResult {
        let (index, reg) = gicr_offset(offset);
        if index >= ctx.vgic.ncpu() {
            warn!("vgic-redist: write to redistributor {} out of range", index);
            return Ok(());
        }
        let val = val as u32;

        match reg {
            GICR_CTLR | GICR_WAKER | GICR_IIDR | GICR_TYPER | GICR_TYPER_HI | GICR_PIDR2 => Ok(()),
            GICR_IGROUPR0 => {
                let mut cpu = ctx.vgic.cpu(index)?;
                for irq in 0..32 {
                    if let Some(config) = cpu.private_mut(irq) {
                        config.group = ((val >> irq) & 1) as u8;
                    }
                }
                Ok(())
            }
            GICR_ISENABLER0 | GICR_ICENABLER0 => {
                let enable = reg == GICR_ISENABLER0;
                let mut cpu = ctx.vgic.cpu(index)?;
                for irq in (0..32).filter(|irq| (val >> irq) & 1 != 0) {
                    if let Some(config) = cpu.private_mut(irq) {
                        config.enabled = enable;
                        if enable {
                            ctx.gic.unmask(irq);
                        } else {
                            ctx.gic.mask(irq);
                        }
                    }
                }
                Ok(())
            }
            GICR_IPRIORITYR..=GICR_IPRIORITYR_LAST => {
                let mut cpu = ctx.vgic.cpu(index)?;
                let first = (reg - GICR_IPRIORITYR) as u32;
                for i in 0..access.size.bytes().min(4) as u32 {
                    if let Some(config) = cpu.private_mut(first + i) {
                        config.priority = (val >> (i * 8)) as u8;
                    }
                }
                Ok(())
            }
            GICR_ISPENDR0 | GICR_ICPENDR0 | GICR_ISACTIVER0 | GICR_ICACTIVER0 | GICR_ICFGR0
            | GICR_ICFGR1 | GICR_IGRPMODR0 => Ok(()),
            _ => {
                warn!(
                    "vgic-redist: unhandled write {:#x} to redistributor {} at {:#x}",
                    val, index, reg
                );
                Ok(())
            }
        }
    }
}
