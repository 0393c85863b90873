use core::cell::UnsafeCell;

use axerrno::{ax_err, ax_err_type, AxResult};
use spin::Mutex;

use crate::config::{GUEST_CORE_NAME, GUEST_MIDR, NCPU};
use crate::gic::GicContext;
use crate::GuestPhysAddr;

/// `SPSR_EL2` seed: return to EL1h with D, A, I and F masked.
const SPSR_EL1H_DAIF_MASKED: u64 = (0xf << 6) | 0b0101;

/// Index of a slot in the [`VCpuTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VCpuId(pub usize);

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// The slot is free.
    Unused = 0,
    /// The slot is claimed by a VM but the vcpu may not run yet.
    Allocated = 1,
    /// The vcpu has an entry point and may be resumed.
    Ready = 2,
    /// The vcpu owns a physical CPU. A vcpu never leaves this state.
    Running = 3,
}

/// Guest general purpose registers plus the exception return state, saved and restored
/// by the exception vector. The layout is shared with assembly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub x: [u64; 31],
    /// `SPSR_EL2` on guest exit.
    pub spsr: u64,
    /// `ELR_EL2` on guest exit.
    pub elr: u64,
}

impl TrapFrame {
    /// Reads general purpose register `reg`; register 31 reads as zero.
    pub fn gpr(&self, reg: usize) -> u64 {
        if reg < 31 {
            self.x[reg]
        } else {
            0
        }
    }

    /// Writes general purpose register `reg`; writes to register 31 are discarded.
    pub fn set_gpr(&mut self, reg: usize, val: u64) {
        if reg < 31 {
            self.x[reg] = val;
        }
    }

    /// Skips the trapped instruction.
    pub fn advance_pc(&mut self) {
        self.elr += 4;
    }
}

/// Shadow copies of the EL1 system registers a guest owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SysRegs {
    pub spsr_el1: u64,
    pub elr_el1: u64,
    /// Loaded into `VMPIDR_EL2`.
    pub mpidr_el1: u64,
    /// Loaded into `VPIDR_EL2`.
    pub midr_el1: u64,
    pub sp_el0: u64,
    pub sp_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub tcr_el1: u64,
    pub vbar_el1: u64,
    pub sctlr_el1: u64,
    pub cntv_ctl_el0: u64,
    pub cntv_tval_el0: u64,
    pub cntfrq_el0: u64,
}

/// Everything restored when a vcpu is entered.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VCpuContext {
    pub frame: TrapFrame,
    pub sys: SysRegs,
    pub gic: GicContext,
}

/// Seed values for a vcpu slot handed out to a VM.
#[derive(Debug, Clone, Copy)]
pub struct VCpuSetup {
    pub vm_id: usize,
    /// Index of the vcpu inside its VM.
    pub index: usize,
    pub entry: GuestPhysAddr,
    /// Placed into `x0` of the boot vcpu.
    pub dtb_addr: GuestPhysAddr,
    pub cntfrq: u64,
    pub vmcr: u64,
}

/// The mutable part of [`AxVCpu`].
struct AxVCpuInnerMut {
    state: VCpuState,
    /// Owning VM, set while the slot is in use.
    vm_id: Option<usize>,
    /// Index within the owning VM.
    index: usize,
}

/// A virtual CPU slot.
///
/// The state machine lives behind a lock. The register context lives in an
/// `UnsafeCell`: the exception vector writes it while the guest runs, and a lock guard
/// cannot be held across entering the guest.
pub struct AxVCpu {
    id: VCpuId,
    inner_mut: Mutex<AxVCpuInnerMut>,
    context: UnsafeCell<VCpuContext>,
}

// SAFETY: the context is only touched by the physical CPU running the vcpu, or by a
// sibling while the vcpu is still `Allocated` (see `AxVCpu::context_mut`).
unsafe impl Sync for AxVCpu {}

impl AxVCpu {
    fn new(id: usize) -> Self {
        Self {
            id: VCpuId(id),
            inner_mut: Mutex::new(AxVCpuInnerMut {
                state: VCpuState::Unused,
                vm_id: None,
                index: 0,
            }),
            context: UnsafeCell::new(VCpuContext::default()),
        }
    }

    pub const fn id(&self) -> VCpuId {
        self.id
    }

    pub fn state(&self) -> VCpuState {
        self.inner_mut.lock().state
    }

    pub fn vm_id(&self) -> Option<usize> {
        self.inner_mut.lock().vm_id
    }

    /// Index of the vcpu inside its VM.
    pub fn index(&self) -> usize {
        self.inner_mut.lock().index
    }

    /// Whether this is the boot vcpu of its VM.
    pub fn is_bsp(&self) -> bool {
        self.index() == 0
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`.
    ///
    /// If the current state is not `from`, nothing runs, the state is kept and
    /// `BadState` is returned. If the block fails, the state is kept as well.
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut inner_mut = self.inner_mut.lock();
        if inner_mut.state != from {
            error!(
                "vcpu {} state is not {:?}, but {:?}",
                self.id.0, from, inner_mut.state
            );
            ax_err!(BadState, "unexpected vcpu state")
        } else {
            let result = f()?;
            inner_mut.state = to;
            Ok(result)
        }
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Raw pointer to the register context, for the exception vector.
    pub fn context_ptr(&self) -> *mut VCpuContext {
        self.context.get()
    }

    /// Mutable access to the register context.
    ///
    /// # Safety
    ///
    /// The caller must be the physical CPU currently running this vcpu, or the vcpu must
    /// not be running anywhere.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context_mut(&self) -> &mut VCpuContext {
        &mut *self.context.get()
    }

    /// Snapshot of the register context.
    pub fn context(&self) -> VCpuContext {
        // SAFETY: a plain copy; racing with the owner only yields a stale snapshot.
        unsafe { *self.context.get() }
    }
}

/// The fixed table of vcpu slots shared by all VMs.
pub struct VCpuTable {
    slots: [AxVCpu; NCPU],
    /// Held only across the scan for a free slot.
    alloc_lock: Mutex<()>,
}

impl VCpuTable {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(AxVCpu::new),
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, id: VCpuId) -> AxResult<&AxVCpu> {
        self.slots
            .get(id.0)
            .ok_or_else(|| ax_err_type!(NotFound, "vcpu slot out of range"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AxVCpu> {
        self.slots.iter()
    }

    /// Claims the first `Unused` slot.
    pub fn allocate(&self) -> AxResult<VCpuId> {
        let _guard = self.alloc_lock.lock();
        for vcpu in self.slots.iter() {
            if vcpu.state() == VCpuState::Unused
                && vcpu
                    .transition_state(VCpuState::Unused, VCpuState::Allocated)
                    .is_ok()
            {
                debug!("vcpu slot {} allocated", vcpu.id.0);
                return Ok(vcpu.id);
            }
        }
        ax_err!(ResourceBusy, "no free vcpu slot")
    }

    /// Returns an `Allocated` slot to the pool.
    pub fn release(&self, id: VCpuId) -> AxResult {
        let _guard = self.alloc_lock.lock();
        let vcpu = self.get(id)?;
        vcpu.transition_state(VCpuState::Allocated, VCpuState::Unused)?;
        vcpu.inner_mut.lock().vm_id = None;
        Ok(())
    }

    /// Allocates a slot and seeds it to boot at `setup.entry`.
    pub fn create(&self, setup: &VCpuSetup) -> AxResult<VCpuId> {
        let id = self.allocate()?;
        let vcpu = &self.slots[id.0];
        {
            let mut inner = vcpu.inner_mut.lock();
            inner.vm_id = Some(setup.vm_id);
            inner.index = setup.index;
        }

        // SAFETY: the slot is `Allocated`, so no physical CPU runs it.
        let ctx = unsafe { vcpu.context_mut() };
        *ctx = VCpuContext::default();
        ctx.frame.spsr = SPSR_EL1H_DAIF_MASKED;
        ctx.frame.elr = setup.entry.as_usize() as u64;
        ctx.sys.mpidr_el1 = setup.index as u64;
        ctx.sys.midr_el1 = GUEST_MIDR;
        ctx.sys.cntfrq_el0 = setup.cntfrq;
        if setup.index == 0 {
            ctx.frame.x[0] = setup.dtb_addr.as_usize() as u64;
        }
        ctx.gic = GicContext {
            vmcr: setup.vmcr,
            sre_el1: 1,
        };

        info!(
            "vm {} vcpu {} ({}) on slot {}, entry {:?}",
            setup.vm_id, setup.index, GUEST_CORE_NAME, id.0, setup.entry
        );
        Ok(id)
    }
}

impl Default for VCpuTable {
    fn default() -> Self {
        Self::new()
    }
}
