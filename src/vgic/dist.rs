use axerrno::AxResult;

use super::{irq_config, IrqConfig};
use crate::{MmioAccess, MmioContext, VirtMmioDevice};

pub const GICD_CTLR: usize = 0x0;
pub const GICD_TYPER: usize = 0x4;
pub const GICD_IIDR: usize = 0x8;
pub const GICD_TYPER2: usize = 0xc;
pub const GICD_IGROUPR: usize = 0x80;
pub const GICD_ISENABLER: usize = 0x100;
pub const GICD_ICENABLER: usize = 0x180;
pub const GICD_ISPENDR: usize = 0x200;
pub const GICD_ICACTIVER_LAST: usize = 0x3ff;
pub const GICD_IPRIORITYR: usize = 0x400;
pub const GICD_ITARGETSR: usize = 0x800;
pub const GICD_ICFGR: usize = 0xc00;
pub const GICD_ICFGR_LAST: usize = 0xcff;
pub const GICD_IROUTER: usize = 0x6000;
pub const GICD_IROUTER_LAST: usize = 0x7fff;
pub const GICD_PIDR2: usize = 0xffe8;

pub const GICD_CTLR_ENABLE_G1A: u32 = 1 << 1;
pub const GICD_CTLR_ARE_NS: u32 = 1 << 4;
const GICD_TYPER_CPUNUMBER_SHIFT: u32 = 5;

/// Bit windows (`IGROUPR`, `IS/ICENABLER`) are 32 registers of 32 lines.
const BIT_WINDOW_SIZE: usize = 32 * 4;
/// Byte windows (`IPRIORITYR`, `ITARGETSR`) are 255 registers of 4 lines.
const BYTE_WINDOW_SIZE: usize = 255 * 4;

/// The emulated distributor register window.
pub struct VGicDistDevice;

/// First line covered by the 32-line register at `offset` inside a bit window.
fn bit_window_line(offset: usize, base: usize) -> u32 {
    ((offset - base) / 4 * 32) as u32
}

fn in_window(offset: usize, base: usize, size: usize) -> bool {
    (base..base + size).contains(&offset)
}

/// Runs `f` on `count` consecutive lines starting at `first`, under the distributor lock
/// and the faulting vcpu's redistributor lock.
fn for_each_line(
    ctx: &MmioContext,
    first: u32,
    count: u32,
    mut f: impl FnMut(u32, &mut IrqConfig),
) -> AxResult {
    let mut dist = ctx.vgic.dist();
    let mut cpu = ctx.vgic.cpu(ctx.vcpu_index)?;
    for i in 0..count {
        if let Some(config) = irq_config(&mut dist, &mut cpu, first + i) {
            f(i, config);
        }
    }
    Ok(())
}

impl VGicDistDevice {
    fn read_ctlr(&self, ctx: &MmioContext) -> u64 {
        let mut reg = GICD_CTLR_ARE_NS;
        if ctx.vgic.dist().enabled() {
            reg |= GICD_CTLR_ENABLE_G1A;
        }
        reg as u64
    }

    fn read_typer(&self, ctx: &MmioContext) -> u64 {
        let it_lines = ((ctx.vgic.nspis() + 32) >> 5) - 1;
        let cpus = (ctx.vgic.ncpu() as u32).saturating_sub(1);
        (it_lines | (cpus << GICD_TYPER_CPUNUMBER_SHIFT)) as u64
    }

    fn read_bits(
        &self,
        ctx: &MmioContext,
        first: u32,
        get: impl Fn(&IrqConfig) -> bool,
    ) -> AxResult<u64> {
        let mut reg = 0u32;
        for_each_line(ctx, first, 32, |i, config| {
            if get(config) {
                reg |= 1 << i;
            }
        })?;
        Ok(reg as u64)
    }

    fn read_bytes(
        &self,
        ctx: &MmioContext,
        first: u32,
        count: u32,
        get: impl Fn(&IrqConfig) -> u8,
    ) -> AxResult<u64> {
        let mut reg = 0u32;
        for_each_line(ctx, first, count, |i, config| {
            reg |= (get(config) as u32) << (i * 8);
        })?;
        Ok(reg as u64)
    }
}

impl VirtMmioDevice for VGicDistDevice {
    fn name(&self) -> &str {
        "vgic-dist"
    }

    fn read(&self, ctx: &MmioContext, offset: usize, access: &MmioAccess) -> AxResult<u64> {
        let byte_lines = access.size.bytes().min(4) as u32;
        match offset {
            GICD_CTLR => Ok(self.read_ctlr(ctx)),
            GICD_TYPER => Ok(self.read_typer(ctx)),
            GICD_IIDR => Ok(ctx.gic.dist_read32(GICD_IIDR) as u64),
            GICD_TYPER2 => Ok(0),
            GICD_PIDR2 => Ok(ctx.gic.dist_read32(GICD_PIDR2) as u64),
            o if in_window(o, GICD_IGROUPR, BIT_WINDOW_SIZE) => {
                self.read_bits(ctx, bit_window_line(o, GICD_IGROUPR), |c| c.group != 0)
            }
            o if in_window(o, GICD_ISENABLER, BIT_WINDOW_SIZE) => {
                self.read_bits(ctx, bit_window_line(o, GICD_ISENABLER), |c| c.enabled)
            }
            o if in_window(o, GICD_ICENABLER, BIT_WINDOW_SIZE) => {
                self.read_bits(ctx, bit_window_line(o, GICD_ICENABLER), |c| c.enabled)
            }
            o if in_window(o, GICD_IPRIORITYR, BYTE_WINDOW_SIZE) => self.read_bytes(
                ctx,
                (o - GICD_IPRIORITYR) as u32,
                byte_lines,
                |c| c.priority,
            ),
            o if in_window(o, GICD_ITARGETSR, BYTE_WINDOW_SIZE) => self.read_bytes(
                ctx,
                (o - GICD_ITARGETSR) as u32,
                byte_lines,
                |c| c.affinity,
            ),
            // Pending, active and trigger state is tracked by hardware.
            GICD_ISPENDR..=GICD_ICACTIVER_LAST
            | GICD_ICFGR..=GICD_ICFGR_LAST
            | GICD_IROUTER..=GICD_IROUTER_LAST => Ok(0),
            _ => {
                warn!("vgic-dist: unhandled read at offset {:#x}", offset);
                Ok(0)
            }
        }
    }

    fn write(&self, ctx: &MmioContext, offset: usize, val: u64, access: &MmioAccess) -> AxResult {
        let val = val as u32;
        let byte_lines = access.size.bytes().min(4) as u32;
        match offset {
            GICD_CTLR => {
                let enable = val & GICD_CTLR_ENABLE_G1A != 0;
                ctx.vgic.dist().enabled = enable;
                debug!("vgic-dist: distributor {}", if enable { "enabled" } else { "disabled" });
                Ok(())
            }
            GICD_TYPER | GICD_IIDR | GICD_TYPER2 | GICD_PIDR2 => Ok(()),
            o if in_window(o, GICD_IGROUPR, BIT_WINDOW_SIZE) => {
                for_each_line(ctx, bit_window_line(o, GICD_IGROUPR), 32, |i, config| {
                    config.group = ((val >> i) & 1) as u8;
                })
            }
            o if in_window(o, GICD_ISENABLER, BIT_WINDOW_SIZE) => {
                let first = bit_window_line(o, GICD_ISENABLER);
                for_each_line(ctx, first, 32, |i, config| {
                    if (val >> i) & 1 != 0 {
                        config.enabled = true;
                        ctx.gic.unmask(first + i);
                    }
                })
            }
            o if in_window(o, GICD_ICENABLER, BIT_WINDOW_SIZE) => {
                let first = bit_window_line(o, GICD_ICENABLER);
                for_each_line(ctx, first, 32, |i, config| {
                    if (val >> i) & 1 != 0 {
                        config.enabled = false;
                        ctx.gic.mask(first + i);
                    }
                })
            }
            o if in_window(o, GICD_IPRIORITYR, BYTE_WINDOW_SIZE) => for_each_line(
                ctx,
                (o - GICD_IPRIORITYR) as u32,
                byte_lines,
                |i, config| config.priority = (val >> (i * 8)) as u8,
            ),
            o if in_window(o, GICD_ITARGETSR, BYTE_WINDOW_SIZE) => {
                let first = (o - GICD_ITARGETSR) as u32;
                for_each_line(ctx, first, byte_lines, |i, config| {
                    config.affinity = (val >> (i * 8)) as u8;
                    ctx.gic.set_affinity(first + i, config.affinity);
                })
            }
            GICD_ISPENDR..=GICD_ICACTIVER_LAST
            | GICD_ICFGR..=GICD_ICFGR_LAST
            | GICD_IROUTER..=GICD_IROUTER_LAST => Ok(()),
            _ => {
                warn!(
                    "vgic-dist: unhandled write {:#x} at offset {:#x}",
                    val, offset
                );
                Ok(())
            }
        }
    }
}
