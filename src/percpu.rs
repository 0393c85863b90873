use core::mem::MaybeUninit;

use axerrno::{ax_err, AxResult};

use crate::{SysRegs, VCpuContext, VCpuId};

/// Trait representing the per-CPU EL2 state of a physical core.
///
/// Besides turning virtualization on and off, implementers carry out the individual steps
/// of a world switch, so that the ordering of those steps is decided by the hypervisor
/// core and can be observed in tests.
pub trait AxArchPerCpu: Sized {
    /// Create a new per-CPU state.
    fn new(cpu_id: usize) -> AxResult<Self>;
    /// Whether EL2 virtualization support is configured on the current CPU.
    fn is_enabled(&self) -> bool;
    /// Program `HCR_EL2`, `VBAR_EL2`, `VTCR_EL2` and `MAIR_EL2` on the current CPU.
    fn hardware_enable(&mut self) -> AxResult;
    /// Turn stage-2 translation and guest traps off on the current CPU.
    fn hardware_disable(&mut self) -> AxResult;

    /// Publish the context of the vcpu about to run where the exception vector finds it
    /// (`TPIDR_EL2`).
    fn set_current_context(&mut self, ctx: *mut VCpuContext);
    /// Install the stage-2 base (`VTTBR_EL2`).
    fn install_stage2(&mut self, vttbr: u64);
    /// Invalidate stage-1 and stage-2 TLB entries of the current VMID, ordered after
    /// preceding table writes and before any following translation.
    fn flush_guest_tlb(&mut self);
    /// Load the shadowed EL1 system registers.
    fn restore_sysregs(&mut self, regs: &SysRegs);
    /// Restore the guest registers from `ctx` and `eret` into the guest.
    ///
    /// On hardware this does not return: control comes back through the exception
    /// vector.
    fn enter_guest(&mut self, ctx: *mut VCpuContext);
}

/// Host per-CPU states to run the guest.
///
/// One of these is owned by each physical core and passed explicitly into every
/// [`AxHypervisor`](crate::AxHypervisor) entry point that acts on "the current core":
///
///   ```ignore
///   let mut percpu = AxPerCpu::<Aarch64PerCpu>::new_uninit();
///   percpu.init(cpu_id)?;
///   percpu.hardware_enable()?;
///   hypervisor.start_vcpu(&mut percpu)?;
///   ```
pub struct AxPerCpu<A: AxArchPerCpu> {
    /// The id of the CPU. It's also used to check whether the per-CPU state is initialized.
    cpu_id: Option<usize>,
    /// The vcpu this core runs, if any.
    current: Option<VCpuId>,
    /// The architecture-specific per-CPU state.
    arch: MaybeUninit<A>,
}

impl<A: AxArchPerCpu> AxPerCpu<A> {
    /// Create a new, uninitialized per-CPU state.
    pub const fn new_uninit() -> Self {
        Self {
            cpu_id: None,
            current: None,
            arch: MaybeUninit::uninit(),
        }
    }

    /// Initialize the per-CPU state.
    pub fn init(&mut self, cpu_id: usize) -> AxResult {
        if self.cpu_id.is_some() {
            ax_err!(BadState, "per-CPU state is already initialized")
        } else {
            self.arch.write(A::new(cpu_id)?);
            self.cpu_id = Some(cpu_id);
            Ok(())
        }
    }

    /// The id of this physical CPU. Panics if the per-CPU state is not initialized.
    pub fn cpu_id(&self) -> usize {
        match self.cpu_id {
            Some(cpu_id) => cpu_id,
            None => panic!("per-CPU state is not initialized"),
        }
    }

    /// The vcpu running on this core.
    pub fn current_vcpu(&self) -> Option<VCpuId> {
        self.current
    }

    pub(crate) fn set_current_vcpu(&mut self, vcpu: VCpuId) {
        self.current = Some(vcpu);
    }

    /// Return the architecture-specific per-CPU state. Panics if the per-CPU state is not initialized.
    pub fn arch_checked(&self) -> &A {
        assert!(self.cpu_id.is_some(), "per-CPU state is not initialized");
        // SAFETY: `cpu_id` is `Some` here, so `arch` must be initialized.
        unsafe { self.arch.assume_init_ref() }
    }

    /// Return the mutable architecture-specific per-CPU state. Panics if the per-CPU state is not initialized.
    pub fn arch_checked_mut(&mut self) -> &mut A {
        assert!(self.cpu_id.is_some(), "per-CPU state is not initialized");
        // SAFETY: `cpu_id` is `Some` here, so `arch` must be initialized.
        unsafe { self.arch.assume_init_mut() }
    }

    /// Whether the current CPU has EL2 virtualization configured.
    pub fn is_enabled(&self) -> bool {
        self.cpu_id.is_some() && self.arch_checked().is_enabled()
    }

    /// Enable virtualization on the current CPU.
    pub fn hardware_enable(&mut self) -> AxResult {
        info!("enabling EL2 virtualization on CPU {}", self.cpu_id());
        self.arch_checked_mut().hardware_enable()
    }

    /// Disable virtualization on the current CPU.
    pub fn hardware_disable(&mut self) -> AxResult {
        self.arch_checked_mut().hardware_disable()
    }
}

impl<A: AxArchPerCpu> Drop for AxPerCpu<A> {
    fn drop(&mut self) {
        if self.is_enabled() {
            if let Err(err) = self.hardware_disable() {
                warn!("failed to disable virtualization on drop: {:?}", err);
            }
        }
        if self.cpu_id.is_some() {
            // SAFETY: `cpu_id` is `Some`, so `arch` was written by `init`.
            unsafe { self.arch.assume_init_drop() };
        }
    }
}
