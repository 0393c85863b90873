use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{ax_err, ax_err_type, AxResult};
use memory_addr::{align_up_4k, is_aligned_4k};
use spin::Mutex;

use crate::config::{
    AxVMConfig, GuestImage, GICD_BASE, GICD_SIZE, GICR_BASE, GICR_SIZE, NCPU, PAGE_SIZE, PL011_BASE,
};
use crate::exit::SysRegAddr;
use crate::gic::GIC_SPECIAL_INTID_START;
use crate::psci::{handle_psci, PsciCall};
use crate::stage2::{hcr_value, mair_value, vtcr_value};
use crate::vgic::{VGicDistDevice, VGicRedistDevice};
use crate::{
    mmio, AxArchPerCpu, AxHyperHal, AxPerCpu, AxVCpu, AxVCpuExitReason, AxVM, GicOps,
    GuestPhysAddr, HostPhysAddr, MemAttr, MmioAccess, MmioContext, TrapFrame, TrapSyndrome,
    VCpuId, VCpuSetup, VCpuState, VCpuTable,
};

/// The hypervisor core: the vcpu slot table, the VMs, and the physical interrupt
/// controller, shared by all physical CPUs.
///
/// Every entry point acting on "the current CPU" takes that CPU's [`AxPerCpu`]
/// explicitly.
pub struct AxHypervisor<H: AxHyperHal, G: GicOps> {
    gic: G,
    vcpus: VCpuTable,
    vms: Mutex<Vec<Arc<AxVM<H>>>>,
    next_vm_id: AtomicUsize,
}

impl<H: AxHyperHal, G: GicOps> AxHypervisor<H, G> {
    pub fn new(gic: G) -> Self {
        Self {
            gic,
            vcpus: VCpuTable::new(),
            vms: Mutex::new(Vec::new()),
            next_vm_id: AtomicUsize::new(0),
        }
    }

    pub fn gic(&self) -> &G {
        &self.gic
    }

    pub fn vcpus(&self) -> &VCpuTable {
        &self.vcpus
    }

    pub fn vm(&self, vm_id: usize) -> AxResult<Arc<AxVM<H>>> {
        self.vms
            .lock()
            .iter()
            .find(|vm| vm.id() == vm_id)
            .cloned()
            .ok_or_else(|| ax_err_type!(NotFound, "no such vm"))
    }

    /// One-time global initialization, run on the boot CPU before any VM is created.
    pub fn init(&self) -> AxResult {
        info!(
            "hypervisor init: vtcr_el2 {:#x}, mair_el2 {:#x}, hcr_el2 {:#x}",
            vtcr_value(),
            mair_value(),
            hcr_value()
        );
        info!("initializing {} interrupt controller", self.gic.name());
        self.gic.init()
    }

    /// Brings physical CPU `cpu_id` into a state where it can run vcpus.
    pub fn init_percpu<A: AxArchPerCpu>(
        &self,
        percpu: &mut AxPerCpu<A>,
        cpu_id: usize,
    ) -> AxResult {
        percpu.init(cpu_id)?;
        percpu.hardware_enable()?;
        self.gic.init_percpu(cpu_id)
    }

    /// Builds a VM from `config` and marks its boot vcpu `Ready`.
    pub fn create_guest_vm(&self, config: &AxVMConfig) -> AxResult<Arc<AxVM<H>>> {
        let image = config
            .image
            .ok_or_else(|| ax_err_type!(InvalidInput, "a guest image is required"))?;
        if config.ncpu == 0 || config.ncpu > NCPU {
            error!("vm requests {} vcpus, at most {} supported", config.ncpu, NCPU);
            return ax_err!(InvalidInput, "invalid vcpu count");
        }
        if !is_aligned_4k(config.entry.as_usize()) || !is_aligned_4k(config.ram_size) {
            return ax_err!(InvalidInput, "guest entry and ram size must be page aligned");
        }

        info!("creating guest vm {}", image.name);
        info!("  image size {:#x}, entry {:?}", image.size(), config.entry);
        if let Some(dtb) = &config.dtb {
            info!("  dtb {} size {:#x} at {:?}", dtb.name, dtb.size(), config.dtb_addr);
        }
        if let Some(initrd) = &config.initrd {
            info!(
                "  initrd {} size {:#x} at {:?}",
                initrd.name,
                initrd.size(),
                config.initrd_addr
            );
        }
        info!("  {} vcpus, ram size {:#x}", config.ncpu, config.ram_size);

        let vm_id = self.next_vm_id.fetch_add(1, Ordering::Relaxed);
        let nspis = self.gic.max_spi().saturating_sub(31);
        let vm = Arc::new(AxVM::<H>::new(
            vm_id,
            image.name,
            config.ncpu,
            nspis,
            config.dtb_addr,
        )?);

        if let Err(err) = self
            .create_vcpus(&vm, config)
            .and_then(|_| self.populate_vm(&vm, config, &image))
        {
            warn!("vm {} ({}) creation failed: {:?}", vm_id, image.name, err);
            for id in vm.vcpu_ids() {
                let _ = self.vcpus.release(id);
            }
            return Err(err);
        }
        info!("vm {} ({}) created, vcpu 0 is ready", vm_id, image.name);

        self.vms.lock().push(vm.clone());
        Ok(vm)
    }

    /// Maps and loads guest memory, registers the virtual GIC windows and marks the
    /// boot vcpu `Ready`.
    fn populate_vm(&self, vm: &AxVM<H>, config: &AxVMConfig, image: &GuestImage) -> AxResult {
        {
            let mut stage2 = vm.stage2().lock();
            // Guest RAM starts at the entry point and always covers the image.
            let mem_size = align_up_4k(image.size()).max(config.ram_size);
            for off in (0..mem_size).step_by(PAGE_SIZE) {
                let frame = H::alloc_page()
                    .ok_or_else(|| ax_err_type!(NoMemory, "unable to allocate guest memory"))?;
                stage2.map(config.entry + off, frame, PAGE_SIZE, MemAttr::Normal)?;
            }
            stage2.copy_to_guest(config.entry, image.data)?;

            stage2.map(
                GuestPhysAddr::from(PL011_BASE),
                HostPhysAddr::from(PL011_BASE),
                PAGE_SIZE,
                MemAttr::Device,
            )?;

            if let Some(dtb) = &config.dtb {
                stage2.copy_to_guest(config.dtb_addr, dtb.data)?;
            }
            if let Some(initrd) = &config.initrd {
                stage2.copy_to_guest(config.initrd_addr, initrd.data)?;
            }
        }

        vm.register_mmio_trap(
            GuestPhysAddr::from(GICD_BASE),
            GICD_SIZE,
            Arc::new(VGicDistDevice),
        )?;
        vm.register_mmio_trap(
            GuestPhysAddr::from(GICR_BASE),
            GICR_SIZE,
            Arc::new(VGicRedistDevice),
        )?;

        let boot = vm
            .vcpu_id(0)
            .ok_or_else(|| ax_err_type!(BadState, "vm has no boot vcpu"))?;
        self.vcpus
            .get(boot)?
            .transition_state(VCpuState::Allocated, VCpuState::Ready)
    }

    /// Seeds one vcpu per requested core. Secondary vcpus get their entry from
    /// PSCI `CPU_ON`.
    fn create_vcpus(&self, vm: &AxVM<H>, config: &AxVMConfig) -> AxResult {
        let vmcr = self.gic.read_vmcr();
        for index in 0..config.ncpu {
            let entry = if index == 0 {
                config.entry
            } else {
                GuestPhysAddr::from(0)
            };
            let id = self.vcpus.create(&VCpuSetup {
                vm_id: vm.id(),
                index,
                entry,
                dtb_addr: config.dtb_addr,
                cntfrq: H::timer_frequency(),
                vmcr,
            })?;
            vm.add_vcpu(id);
        }
        Ok(())
    }

    fn vm_of(&self, vcpu: &AxVCpu) -> AxResult<Arc<AxVM<H>>> {
        let vm_id = vcpu
            .vm_id()
            .ok_or_else(|| ax_err_type!(BadState, "vcpu belongs to no vm"))?;
        self.vm(vm_id)
    }

    /// World switch into vcpu `id` on the current CPU.
    ///
    /// The vcpu must be `Ready`. On hardware this does not return; the guest comes back
    /// only through a trap.
    pub fn resume<A: AxArchPerCpu>(&self, percpu: &mut AxPerCpu<A>, id: VCpuId) -> AxResult {
        let vcpu = self.vcpus.get(id)?;
        let vm = self.vm_of(vcpu)?;
        vcpu.transition_state(VCpuState::Ready, VCpuState::Running)?;
        debug!(
            "cpu {}: entering vm {} vcpu {}",
            percpu.cpu_id(),
            vm.id(),
            vcpu.index()
        );

        percpu.set_current_vcpu(id);
        let ctx = vcpu.context_ptr();
        let arch = percpu.arch_checked_mut();
        arch.set_current_context(ctx);
        arch.install_stage2(vm.vttbr());
        arch.flush_guest_tlb();
        // SAFETY: the vcpu is now `Running` on this CPU and nowhere else.
        let context = unsafe { &*ctx };
        arch.restore_sysregs(&context.sys);
        self.gic.restore_context(&context.gic);
        arch.enter_guest(ctx);
        Ok(())
    }

    /// Runs the vcpu assigned to the current CPU: the slot whose index equals the CPU id.
    pub fn start_vcpu<A: AxArchPerCpu>(&self, percpu: &mut AxPerCpu<A>) -> AxResult {
        let cpu_id = percpu.cpu_id();
        info!("cpu {}: starting vcpu slot {}", cpu_id, cpu_id);
        self.resume(percpu, VCpuId(cpu_id))
    }

    fn current<A: AxArchPerCpu>(
        &self,
        percpu: &AxPerCpu<A>,
    ) -> AxResult<(&AxVCpu, Arc<AxVM<H>>)> {
        let id = percpu
            .current_vcpu()
            .ok_or_else(|| ax_err_type!(BadState, "no vcpu runs on this cpu"))?;
        let vcpu = self.vcpus.get(id)?;
        let vm = self.vm_of(vcpu)?;
        Ok((vcpu, vm))
    }

    /// Handles a synchronous exception taken from the vcpu running on the current CPU.
    ///
    /// Any error is fatal for the guest.
    pub fn handle_sync_exception<A: AxArchPerCpu>(
        &self,
        percpu: &mut AxPerCpu<A>,
        syndrome: TrapSyndrome,
    ) -> AxResult {
        let (vcpu, vm) = self.current(percpu)?;
        let index = vcpu.index();
        // SAFETY: the trapped vcpu is the one running on this CPU.
        let frame = unsafe { &mut vcpu.context_mut().frame };

        let reason = syndrome.decode()?;
        trace!("vm {} vcpu {}: {:?}", vm.id(), index, reason);

        match reason {
            AxVCpuExitReason::Hypercall { imm } | AxVCpuExitReason::SecureMonitorCall { imm } => {
                self.handle_call(&vm, index, frame, imm)?
            }
            AxVCpuExitReason::SysRegWrite { addr, reg } if addr == SysRegAddr::ICC_SGI1R_EL1 => {
                self.gic.send_sgi(frame.gpr(reg))
            }
            AxVCpuExitReason::SysRegRead { addr, .. } | AxVCpuExitReason::SysRegWrite { addr, .. } => {
                error!(
                    "vm {} vcpu {}: unhandled system register {:?} at {:#x}",
                    vm.id(),
                    index,
                    addr,
                    frame.elr
                );
                return ax_err!(Unsupported, "unhandled system register access");
            }
            AxVCpuExitReason::MmioRead { addr, width, reg }
            | AxVCpuExitReason::MmioWrite { addr, width, reg } => {
                let access = MmioAccess {
                    ipa: addr,
                    pc: frame.elr,
                    write: matches!(reason, AxVCpuExitReason::MmioWrite { .. }),
                    size: width,
                };
                let ctx = MmioContext {
                    vgic: vm.vgic(),
                    vcpu_index: index,
                    gic: &self.gic,
                };
                vm.with_mmio_regions(|regions| mmio::dispatch(regions, &ctx, frame, reg, &access))?
            }
            AxVCpuExitReason::Unknown { ec, iss } => {
                error!(
                    "vm {} vcpu {}: unknown exception ec {:#x}, iss {:#x}, elr {:#x}, far {:#x}",
                    vm.id(),
                    index,
                    ec,
                    iss,
                    frame.elr,
                    syndrome.far
                );
                return ax_err!(Unsupported, "unknown exception class");
            }
        }

        if reason.skips_instruction() {
            frame.advance_pc();
        }
        Ok(())
    }

    fn handle_call(
        &self,
        vm: &AxVM<H>,
        index: usize,
        frame: &mut TrapFrame,
        imm: u16,
    ) -> AxResult {
        if imm != 0 {
            error!("vm {} vcpu {}: unknown call #{}", vm.id(), index, imm);
            return ax_err!(Unsupported, "unknown hvc/smc immediate");
        }
        let call = PsciCall {
            function: frame.x[0],
            arg0: frame.x[1],
            arg1: frame.x[2],
            arg2: frame.x[3],
        };
        frame.x[0] = handle_psci(vm, &self.vcpus, index, call)?;
        Ok(())
    }

    /// Handles a physical interrupt taken while a guest runs on the current CPU by
    /// forwarding it to the running vcpu under the same INTID.
    pub fn handle_irq<A: AxArchPerCpu>(&self, percpu: &mut AxPerCpu<A>) -> AxResult {
        let (vcpu, vm) = self.current(percpu)?;
        let index = vcpu.index();
        vm.vgic().reclaim(index, &self.gic)?;

        let irq = self.gic.ack();
        if irq >= GIC_SPECIAL_INTID_START {
            trace!("cpu {}: spurious interrupt {}", percpu.cpu_id(), irq);
            return Ok(());
        }
        self.gic.eoi(irq);
        vm.vgic().inject(index, &self.gic, irq, irq)?;
        Ok(())
    }
}
