//! Arm GICv3 driver: distributor and redistributors through MMIO, the CPU interface and
//! the hypervisor control interface through system registers.

use core::mem::offset_of;
use core::ptr::read_volatile;

use axerrno::AxResult;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

use super::{GicContext, GicOps, GIC_MAX_SPI, GIC_SPECIAL_INTID_START, GIC_SPI_BASE};
use crate::config::GICR_STRIDE;
use crate::HostVirtAddr;

/// Offset of the SGI/PPI frame inside a redistributor.
const GICR_SGI_FRAME: usize = 0x1_0000;

register_bitfields![u32,
    GICD_CTLR [
        ENABLE_GRP0 OFFSET(0) NUMBITS(1) [],
        ENABLE_GRP1NS OFFSET(1) NUMBITS(1) [],
        ARE_NS OFFSET(4) NUMBITS(1) [],
        RWP OFFSET(31) NUMBITS(1) []
    ],

    GICD_TYPER [
        IT_LINES_NUMBER OFFSET(0) NUMBITS(5) [],
        CPU_NUMBER OFFSET(5) NUMBITS(3) []
    ],

    GICR_WAKER [
        PROCESSOR_SLEEP OFFSET(1) NUMBITS(1) [],
        CHILDREN_ASLEEP OFFSET(2) NUMBITS(1) []
    ]
];

/// The distributor registers used by the driver, up to `GICD_ICFGR`.
#[repr(C)]
#[allow(dead_code)]
struct GicdRegs {
    ctlr: ReadWrite<u32, GICD_CTLR::Register>,
    typer: ReadOnly<u32, GICD_TYPER::Register>,
    iidr: ReadOnly<u32>,
    typer2: ReadOnly<u32>,
    _reserved0: [u32; 28],
    igroupr: [ReadWrite<u32>; 32],
    isenabler: [ReadWrite<u32>; 32],
    icenabler: [ReadWrite<u32>; 32],
    ispendr: [ReadWrite<u32>; 32],
    icpendr: [ReadWrite<u32>; 32],
    isactiver: [ReadWrite<u32>; 32],
    icactiver: [ReadWrite<u32>; 32],
    ipriorityr: [ReadWrite<u8>; 1024],
    itargetsr: [ReadWrite<u8>; 1024],
    icfgr: [ReadWrite<u32>; 64],
}

/// Redistributor control frame (`RD_base`).
#[repr(C)]
#[allow(dead_code)]
struct GicrRdRegs {
    ctlr: ReadWrite<u32>,
    iidr: ReadOnly<u32>,
    typer: ReadOnly<u64>,
    statusr: ReadWrite<u32>,
    waker: ReadWrite<u32, GICR_WAKER::Register>,
}

/// Redistributor SGI/PPI frame (`SGI_base`).
#[repr(C)]
#[allow(dead_code)]
struct GicrSgiRegs {
    _reserved0: [u32; 32],
    igroupr0: ReadWrite<u32>,
    _reserved1: [u32; 31],
    isenabler0: ReadWrite<u32>,
    _reserved2: [u32; 31],
    icenabler0: ReadWrite<u32>,
    _reserved3: [u32; 63],
    icpendr0: ReadWrite<u32>,
    _reserved4: [u32; 63],
    icactiver0: ReadWrite<u32>,
    _reserved5: [u32; 31],
    ipriorityr: [ReadWrite<u8>; 32],
    _reserved6: [u32; 504],
    icfgr0: ReadWrite<u32>,
    icfgr1: ReadWrite<u32>,
    _reserved7: [u32; 62],
    igrpmodr0: ReadWrite<u32>,
}

const _: () = assert!(offset_of!(GicdRegs, igroupr) == 0x80);
const _: () = assert!(offset_of!(GicdRegs, ipriorityr) == 0x400);
const _: () = assert!(offset_of!(GicdRegs, icfgr) == 0xc00);
const _: () = assert!(offset_of!(GicrRdRegs, waker) == 0x14);
const _: () = assert!(offset_of!(GicrSgiRegs, isenabler0) == 0x100);
const _: () = assert!(offset_of!(GicrSgiRegs, icpendr0) == 0x280);
const _: () = assert!(offset_of!(GicrSgiRegs, ipriorityr) == 0x400);
const _: () = assert!(offset_of!(GicrSgiRegs, icfgr1) == 0xc04);
const _: () = assert!(offset_of!(GicrSgiRegs, igrpmodr0) == 0xd00);

/// A GICv3 whose register windows are mapped at the given host virtual addresses.
pub struct GicV3 {
    gicd: HostVirtAddr,
    gicr: HostVirtAddr,
}

impl GicV3 {
    /// # Safety
    ///
    /// `gicd` and `gicr` must map the distributor and the redistributor frames of all
    /// cores as device memory, for the lifetime of the driver.
    pub const unsafe fn new(gicd: HostVirtAddr, gicr: HostVirtAddr) -> Self {
        Self { gicd, gicr }
    }

    fn gicd(&self) -> &GicdRegs {
        // SAFETY: guaranteed by the caller of `new`.
        unsafe { &*(self.gicd.as_usize() as *const GicdRegs) }
    }

    fn gicr_base(&self, cpu: usize) -> usize {
        self.gicr.as_usize() + cpu * GICR_STRIDE
    }

    fn gicr_rd(&self, cpu: usize) -> &GicrRdRegs {
        // SAFETY: guaranteed by the caller of `new`.
        unsafe { &*(self.gicr_base(cpu) as *const GicrRdRegs) }
    }

    fn gicr_sgi(&self, cpu: usize) -> &GicrSgiRegs {
        // SAFETY: guaranteed by the caller of `new`.
        unsafe { &*((self.gicr_base(cpu) + GICR_SGI_FRAME) as *const GicrSgiRegs) }
    }

    fn wait_for_rwp(&self) {
        while self.gicd().ctlr.is_set(GICD_CTLR::RWP) {
            core::hint::spin_loop();
        }
    }

    fn nr_lines(&self) -> u32 {
        (self.gicd().typer.read(GICD_TYPER::IT_LINES_NUMBER) + 1) * 32
    }

    fn current_cpu() -> usize {
        (read_sysreg!(mpidr_el1) & 0xff) as usize
    }
}

impl GicOps for GicV3 {
    fn name(&self) -> &'static str {
        "ARM GICv3"
    }

    fn init(&self) -> AxResult {
        let gicd = self.gicd();
        gicd.ctlr.set(0);
        self.wait_for_rwp();

        let lines = self.nr_lines();
        for i in 1..(lines / 32) as usize {
            gicd.igroupr[i].set(u32::MAX);
            gicd.icenabler[i].set(u32::MAX);
            gicd.icactiver[i].set(u32::MAX);
            gicd.icpendr[i].set(u32::MAX);
        }
        // Level triggered.
        for i in 2..(lines / 16) as usize {
            gicd.icfgr[i].set(0);
        }

        self.wait_for_rwp();
        gicd.ctlr
            .write(GICD_CTLR::ENABLE_GRP0::SET + GICD_CTLR::ENABLE_GRP1NS::SET);
        self.wait_for_rwp();
        info!("{}: {} interrupt lines", self.name(), lines);
        Ok(())
    }

    fn init_percpu(&self, cpu_id: usize) -> AxResult {
        let rd = self.gicr_rd(cpu_id);
        rd.waker.modify(GICR_WAKER::PROCESSOR_SLEEP::CLEAR);
        while rd.waker.is_set(GICR_WAKER::CHILDREN_ASLEEP) {
            core::hint::spin_loop();
        }

        let sgi = self.gicr_sgi(cpu_id);
        sgi.igroupr0.set(u32::MAX);
        sgi.igrpmodr0.set(0);
        sgi.icenabler0.set(u32::MAX);
        sgi.icactiver0.set(u32::MAX);
        sgi.icpendr0.set(u32::MAX);
        sgi.icfgr1.set(0);

        // ICC_SRE_EL2: SRE, and EL1 accesses to ICC_SRE_EL1 do not trap.
        write_sysreg!(S3_4_C12_C9_5, read_sysreg!(S3_4_C12_C9_5) | (1 << 3) | 1);
        isb!();
        // ICC_SRE_EL1.SRE
        write_sysreg!(S3_0_C12_C12_5, read_sysreg!(S3_0_C12_C12_5) | 1);
        // ICC_PMR_EL1: let every priority through.
        write_sysreg!(S3_0_C4_C6_0, 0xff);
        // ICC_BPR1_EL1
        write_sysreg!(S3_0_C12_C12_3, 0x7);
        // ICC_CTLR_EL1.EOImode: split priority drop and deactivation.
        write_sysreg!(S3_0_C12_C12_4, 1 << 1);
        // ICC_IGRPEN1_EL1
        write_sysreg!(S3_0_C12_C12_7, 1);

        // ICH_VMCR_EL2.VENG1
        write_sysreg!(S3_4_C12_C11_7, 1 << 1);
        // ICH_HCR_EL2.En
        write_sysreg!(S3_4_C12_C11_0, 1);
        isb!();

        info!(
            "cpu {}: {} ready, {} list registers",
            cpu_id,
            self.name(),
            self.num_lrs()
        );
        Ok(())
    }

    fn mask(&self, irq: u32) {
        if irq >= GIC_SPECIAL_INTID_START {
            warn!("cannot mask interrupt {}", irq);
        } else if irq >= GIC_SPI_BASE {
            self.gicd().icenabler[(irq / 32) as usize].set(1 << (irq % 32));
        } else {
            self.gicr_sgi(Self::current_cpu())
                .icenabler0
                .set(1 << irq);
        }
    }

    fn unmask(&self, irq: u32) {
        if irq >= GIC_SPECIAL_INTID_START {
            warn!("cannot unmask interrupt {}", irq);
        } else if irq >= GIC_SPI_BASE {
            self.gicd().isenabler[(irq / 32) as usize].set(1 << (irq % 32));
        } else {
            self.gicr_sgi(Self::current_cpu())
                .isenabler0
                .set(1 << irq);
        }
    }

    fn set_affinity(&self, irq: u32, affinity: u8) {
        if irq < GIC_SPI_BASE {
            return;
        }
        if irq > GIC_MAX_SPI {
            warn!("cannot route interrupt {}", irq);
            return;
        }
        self.gicd().itargetsr[irq as usize].set(affinity);
    }

    fn ack(&self) -> u32 {
        // ICC_IAR1_EL1
        (read_sysreg!(S3_0_C12_C12_0) & 0xff_ffff) as u32
    }

    fn eoi(&self, irq: u32) {
        // ICC_EOIR1_EL1
        write_sysreg!(S3_0_C12_C12_1, irq as u64);
    }

    fn num_lrs(&self) -> usize {
        // ICH_VTR_EL2.ListRegs
        ((read_sysreg!(S3_4_C12_C11_1) & 0x1f) + 1) as usize
    }

    fn max_spi(&self) -> u32 {
        (self.nr_lines() - 1).min(GIC_MAX_SPI)
    }

    fn read_lr(&self, n: usize) -> u64 {
        match n {
            0 => read_sysreg!(S3_4_C12_C12_0),
            1 => read_sysreg!(S3_4_C12_C12_1),
            2 => read_sysreg!(S3_4_C12_C12_2),
            3 => read_sysreg!(S3_4_C12_C12_3),
            4 => read_sysreg!(S3_4_C12_C12_4),
            5 => read_sysreg!(S3_4_C12_C12_5),
            6 => read_sysreg!(S3_4_C12_C12_6),
            7 => read_sysreg!(S3_4_C12_C12_7),
            8 => read_sysreg!(S3_4_C12_C13_0),
            9 => read_sysreg!(S3_4_C12_C13_1),
            10 => read_sysreg!(S3_4_C12_C13_2),
            11 => read_sysreg!(S3_4_C12_C13_3),
            12 => read_sysreg!(S3_4_C12_C13_4),
            13 => read_sysreg!(S3_4_C12_C13_5),
            14 => read_sysreg!(S3_4_C12_C13_6),
            15 => read_sysreg!(S3_4_C12_C13_7),
            _ => panic!("list register {} does not exist", n),
        }
    }

    fn write_lr(&self, n: usize, val: u64) {
        match n {
            0 => write_sysreg!(S3_4_C12_C12_0, val),
            1 => write_sysreg!(S3_4_C12_C12_1, val),
            2 => write_sysreg!(S3_4_C12_C12_2, val),
            3 => write_sysreg!(S3_4_C12_C12_3, val),
            4 => write_sysreg!(S3_4_C12_C12_4, val),
            5 => write_sysreg!(S3_4_C12_C12_5, val),
            6 => write_sysreg!(S3_4_C12_C12_6, val),
            7 => write_sysreg!(S3_4_C12_C12_7, val),
            8 => write_sysreg!(S3_4_C12_C13_0, val),
            9 => write_sysreg!(S3_4_C12_C13_1, val),
            10 => write_sysreg!(S3_4_C12_C13_2, val),
            11 => write_sysreg!(S3_4_C12_C13_3, val),
            12 => write_sysreg!(S3_4_C12_C13_4, val),
            13 => write_sysreg!(S3_4_C12_C13_5, val),
            14 => write_sysreg!(S3_4_C12_C13_6, val),
            15 => write_sysreg!(S3_4_C12_C13_7, val),
            _ => panic!("list register {} does not exist", n),
        }
    }

    fn send_sgi(&self, sgir: u64) {
        // ICC_SGI1R_EL1
        write_sysreg!(S3_0_C12_C11_5, sgir);
        isb!();
    }

    fn read_vmcr(&self) -> u64 {
        read_sysreg!(S3_4_C12_C11_7)
    }

    fn restore_context(&self, ctx: &GicContext) {
        write_sysreg!(S3_4_C12_C11_7, ctx.vmcr);
        write_sysreg!(S3_0_C12_C12_5, read_sysreg!(S3_0_C12_C12_5) | ctx.sre_el1);
    }

    fn dist_read32(&self, offset: usize) -> u32 {
        // SAFETY: inside the distributor window.
        unsafe { read_volatile((self.gicd.as_usize() + offset) as *const u32) }
    }

    fn redist_read32(&self, cpu: usize, offset: usize) -> u32 {
        // SAFETY: inside the redistributor window of `cpu`.
        unsafe { read_volatile((self.gicr_base(cpu) + offset) as *const u32) }
    }

    fn redist_read64(&self, cpu: usize, offset: usize) -> u64 {
        // SAFETY: inside the redistributor window of `cpu`.
        unsafe { read_volatile((self.gicr_base(cpu) + offset) as *const u64) }
    }
}
