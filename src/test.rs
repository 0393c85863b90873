#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec, vec::Vec};
    use core::cell::{Cell, RefCell};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::BTreeSet;

    use axerrno::{AxError, AxResult};
    use spin::Mutex;

    use crate::config::{AxVMConfig, GuestImage, GICD_BASE, GICR_STRIDE, GUEST_MIDR, NCPU, PL011_BASE};
    use crate::gic::{make_list_register, GicContext};
    use crate::psci::*;
    use crate::stage2::{hcr_value, mair_value, vtcr_value};
    use crate::vgic::{VGicDistDevice, VGicRedistDevice};
    use crate::*;

    const PAGE: usize = 0x1000;

    // Distributor and redistributor register offsets as the guest sees them.
    const GICD_CTLR: usize = 0x0;
    const GICD_TYPER: usize = 0x4;
    const GICD_ISENABLER: usize = 0x100;
    const GICD_ICENABLER: usize = 0x180;
    const GICD_IPRIORITYR: usize = 0x400;
    const GICD_ITARGETSR: usize = 0x800;
    const GICR_TYPER: usize = 0x8;
    const GICR_ISENABLER0: usize = 0x1_0100;
    const GICR_ICENABLER0: usize = 0x1_0180;

    // Mock platform: frames come from the host heap, so physical equals virtual.
    thread_local! {
        static PAGES: RefCell<BTreeSet<usize>> = RefCell::new(BTreeSet::new());
        static PAGE_BUDGET: Cell<Option<usize>> = Cell::new(None);
        static FIRMWARE_CALLS: RefCell<Vec<(u32, u64, u64)>> = RefCell::new(Vec::new());
    }

    const SECONDARY_ENTRY: usize = 0x4008_0000;
    const FIRMWARE_PSCI_VERSION: u64 = 0x1_0000;

    struct MockHal;

    fn page_layout() -> Layout {
        Layout::from_size_align(PAGE, PAGE).unwrap()
    }

    impl AxHyperHal for MockHal {
        fn alloc_page() -> Option<HostPhysAddr> {
            let allowed = PAGE_BUDGET.with(|budget| match budget.get() {
                Some(0) => false,
                Some(n) => {
                    budget.set(Some(n - 1));
                    true
                }
                None => true,
            });
            if !allowed {
                return None;
            }
            let ptr = unsafe { alloc_zeroed(page_layout()) } as usize;
            PAGES.with(|pages| pages.borrow_mut().insert(ptr));
            Some(HostPhysAddr::from(ptr))
        }

        fn free_page(paddr: HostPhysAddr) {
            let owned = PAGES.with(|pages| pages.borrow_mut().remove(&paddr.as_usize()));
            assert!(owned, "freeing a frame that was never allocated: {:?}", paddr);
            unsafe { dealloc(paddr.as_usize() as *mut u8, page_layout()) };
        }

        fn timer_frequency() -> u64 {
            62_500_000
        }

        fn firmware_call(function: u32, arg0: u64, arg1: u64) -> u64 {
            FIRMWARE_CALLS.with(|calls| calls.borrow_mut().push((function, arg0, arg1)));
            match function {
                PSCI_VERSION => FIRMWARE_PSCI_VERSION,
                _ => PSCI_SUCCESS as u64,
            }
        }

        fn secondary_entry() -> HostPhysAddr {
            HostPhysAddr::from(SECONDARY_ENTRY)
        }
    }

    fn live_pages() -> usize {
        PAGES.with(|pages| pages.borrow().len())
    }

    fn firmware_calls() -> Vec<(u32, u64, u64)> {
        FIRMWARE_CALLS.with(|calls| calls.borrow().clone())
    }

    #[derive(Default)]
    struct MockGicState {
        lrs: [u64; 16],
        masked: Vec<u32>,
        unmasked: Vec<u32>,
        affinity: Vec<(u32, u8)>,
        pending: Vec<u32>,
        eoi: Vec<u32>,
        sgis: Vec<u64>,
        restored: Vec<GicContext>,
        percpu_init: Vec<usize>,
    }

    struct MockGic {
        num_lrs: usize,
        state: Mutex<MockGicState>,
    }

    impl MockGic {
        fn new(num_lrs: usize) -> Self {
            Self {
                num_lrs,
                state: Mutex::new(MockGicState::default()),
            }
        }
    }

    impl GicOps for MockGic {
        fn name(&self) -> &'static str {
            "mock-gic"
        }

        fn init(&self) -> AxResult {
            Ok(())
        }

        fn init_percpu(&self, cpu_id: usize) -> AxResult {
            self.state.lock().percpu_init.push(cpu_id);
            Ok(())
        }

        fn mask(&self, irq: u32) {
            self.state.lock().masked.push(irq);
        }

        fn unmask(&self, irq: u32) {
            self.state.lock().unmasked.push(irq);
        }

        fn set_affinity(&self, irq: u32, affinity: u8) {
            self.state.lock().affinity.push((irq, affinity));
        }

        fn ack(&self) -> u32 {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                1023
            } else {
                state.pending.remove(0)
            }
        }

        fn eoi(&self, irq: u32) {
            self.state.lock().eoi.push(irq);
        }

        fn num_lrs(&self) -> usize {
            self.num_lrs
        }

        fn max_spi(&self) -> u32 {
            63
        }

        fn read_lr(&self, n: usize) -> u64 {
            self.state.lock().lrs[n]
        }

        fn write_lr(&self, n: usize, val: u64) {
            self.state.lock().lrs[n] = val;
        }

        fn send_sgi(&self, sgir: u64) {
            self.state.lock().sgis.push(sgir);
        }

        fn read_vmcr(&self) -> u64 {
            0x2
        }

        fn restore_context(&self, ctx: &GicContext) {
            self.state.lock().restored.push(*ctx);
        }

        fn dist_read32(&self, offset: usize) -> u32 {
            match offset {
                0x8 => 0x0300_043b,
                0xffe8 => 0x30,
                _ => 0,
            }
        }

        fn redist_read32(&self, _cpu: usize, offset: usize) -> u32 {
            match offset {
                0x4 => 0x0300_043b,
                0xffe8 => 0x30,
                _ => 0,
            }
        }

        fn redist_read64(&self, cpu: usize, offset: usize) -> u64 {
            match offset {
                // Affinity in [63:32], processor number in [23:8], Last always set.
                0x8 => ((cpu as u64) << 32) | ((cpu as u64) << 8) | (1 << 4),
                _ => 0,
            }
        }
    }

    struct MockArchPerCpu {
        enabled: bool,
        calls: Vec<&'static str>,
        vttbr: u64,
    }

    impl AxArchPerCpu for MockArchPerCpu {
        fn new(_cpu_id: usize) -> AxResult<Self> {
            Ok(Self {
                enabled: false,
                calls: Vec::new(),
                vttbr: 0,
            })
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn hardware_enable(&mut self) -> AxResult {
            self.enabled = true;
            Ok(())
        }

        fn hardware_disable(&mut self) -> AxResult {
            self.enabled = false;
            Ok(())
        }

        fn set_current_context(&mut self, _ctx: *mut VCpuContext) {
            self.calls.push("set_current_context");
        }

        fn install_stage2(&mut self, vttbr: u64) {
            self.vttbr = vttbr;
            self.calls.push("install_stage2");
        }

        fn flush_guest_tlb(&mut self) {
            self.calls.push("flush_guest_tlb");
        }

        fn restore_sysregs(&mut self, _regs: &SysRegs) {
            self.calls.push("restore_sysregs");
        }

        fn enter_guest(&mut self, _ctx: *mut VCpuContext) {
            self.calls.push("enter_guest");
        }
    }

    type TestHypervisor = AxHypervisor<MockHal, MockGic>;

    const GUEST_ENTRY: usize = 0x8020_0000;
    const GUEST_RAM: usize = 0x8000;
    const GUEST_DTB: usize = 0x8020_6000;
    static GUEST_IMAGE: [u8; 6000] = [0xd5; 6000];
    static GUEST_DTB_BLOB: [u8; 8] = [0xd0, 0x0d, 0xfe, 0xed, b'-', b'd', b't', b'b'];

    fn test_config(ncpu: usize) -> AxVMConfig {
        AxVMConfig {
            image: Some(GuestImage::new("test-guest", &GUEST_IMAGE)),
            dtb: None,
            initrd: None,
            entry: GuestPhysAddr::from(GUEST_ENTRY),
            dtb_addr: GuestPhysAddr::from(GUEST_DTB),
            initrd_addr: GuestPhysAddr::from(0),
            ram_size: GUEST_RAM,
            ncpu,
        }
    }

    /// A hypervisor whose first VM runs its boot vcpu on CPU 0.
    fn running_guest(
        ncpu: usize,
    ) -> (TestHypervisor, Arc<AxVM<MockHal>>, AxPerCpu<MockArchPerCpu>) {
        let hv = TestHypervisor::new(MockGic::new(4));
        let vm = hv.create_guest_vm(&test_config(ncpu)).unwrap();
        let mut percpu = AxPerCpu::new_uninit();
        hv.init_percpu(&mut percpu, 0).unwrap();
        hv.start_vcpu(&mut percpu).unwrap();
        (hv, vm, percpu)
    }

    fn guest_frame(hv: &TestHypervisor, slot: usize) -> TrapFrame {
        hv.vcpus().get(VCpuId(slot)).unwrap().context().frame
    }

    fn set_guest_gpr(hv: &TestHypervisor, reg: usize, val: u64) {
        let vcpu = hv.vcpus().get(VCpuId(0)).unwrap();
        unsafe { vcpu.context_mut().frame.set_gpr(reg, val) };
    }

    fn esr(ec: u64, iss: u64) -> u64 {
        (ec << 26) | (1 << 25) | iss
    }

    fn hvc(imm: u16) -> TrapSyndrome {
        TrapSyndrome::new(esr(0x16, imm as u64), 0, 0)
    }

    fn smc(imm: u16) -> TrapSyndrome {
        TrapSyndrome::new(esr(0x17, imm as u64), 0, 0)
    }

    fn sysreg(addr: SysRegAddr, rt: u64, read: bool) -> TrapSyndrome {
        let iss = ((addr.op0 as u64) << 20)
            | ((addr.op2 as u64) << 17)
            | ((addr.op1 as u64) << 14)
            | ((addr.crn as u64) << 10)
            | (rt << 5)
            | ((addr.crm as u64) << 1)
            | read as u64;
        TrapSyndrome::new(esr(0x18, iss), 0, 0)
    }

    fn data_abort(ipa: usize, write: bool, sas: u64, srt: u64) -> TrapSyndrome {
        let iss = (1 << 24) | (sas << 22) | (srt << 16) | ((write as u64) << 6);
        TrapSyndrome::new(
            esr(0x24, iss),
            0xffff_0000_0000_0000 | (ipa & 0xfff) as u64,
            ((ipa >> 12) << 4) as u64,
        )
    }

    fn access(size: AccessSize, write: bool) -> MmioAccess {
        MmioAccess {
            ipa: GuestPhysAddr::from(0),
            pc: 0,
            write,
            size,
        }
    }

    fn word_write() -> MmioAccess {
        access(AccessSize::Word, true)
    }

    fn word_read() -> MmioAccess {
        access(AccessSize::Word, false)
    }

    fn ret(code: i32) -> u64 {
        code as i64 as u64
    }

    #[test]
    fn test_stage2_map_translate_unmap() {
        let mut pt = Stage2PageTable::<MockHal>::new().unwrap();
        let frame = MockHal::alloc_page().unwrap();
        let ipa = GuestPhysAddr::from(0x8000_0000);

        pt.map(ipa, frame, PAGE, MemAttr::Normal).unwrap();
        assert_eq!(
            pt.translate(GuestPhysAddr::from(0x8000_0123)),
            Some(frame + 0x123)
        );

        let leaves = pt.leaf_entries();
        assert_eq!(leaves.len(), 1);
        let (leaf_ipa, pte) = leaves[0];
        assert_eq!(leaf_ipa, ipa);
        assert_eq!(pte.paddr(), frame);
        assert_eq!(pte.attr(), Some(MemAttr::Normal));
        assert!(pte.is_accessed());
        assert_eq!(pte.access_permission(), 0b11);

        let before = live_pages();
        pt.unmap(ipa, PAGE).unwrap();
        assert_eq!(live_pages(), before - 1);
        assert_eq!(pt.translate(ipa), None);
        assert!(pt.leaf_entries().is_empty());

        // Unmapping again finds an empty descriptor.
        assert_eq!(pt.unmap(ipa, PAGE).err(), Some(AxError::NotFound));
    }

    #[test]
    fn test_stage2_unmap_never_mapped() {
        let mut pt = Stage2PageTable::<MockHal>::new().unwrap();
        assert_eq!(
            pt.unmap(GuestPhysAddr::from(0x4000_0000), PAGE).err(),
            Some(AxError::NotFound)
        );
    }

    #[test]
    fn test_stage2_double_map_rejected() {
        let mut pt = Stage2PageTable::<MockHal>::new().unwrap();
        let first = MockHal::alloc_page().unwrap();
        let second = MockHal::alloc_page().unwrap();
        let ipa = GuestPhysAddr::from(0x4000_0000);

        pt.map(ipa, first, PAGE, MemAttr::Normal).unwrap();
        assert_eq!(
            pt.map(ipa, second, PAGE, MemAttr::Device).err(),
            Some(AxError::AlreadyExists)
        );
        assert_eq!(pt.translate(ipa), Some(first));
        assert_eq!(pt.leaf_entries()[0].1.attr(), Some(MemAttr::Normal));
    }

    #[test]
    fn test_stage2_misaligned_rejected() {
        let mut pt = Stage2PageTable::<MockHal>::new().unwrap();
        let frame = MockHal::alloc_page().unwrap();

        let unaligned_ipa = pt.map(GuestPhysAddr::from(0x1001), frame, PAGE, MemAttr::Normal);
        assert_eq!(unaligned_ipa.err(), Some(AxError::InvalidInput));
        let unaligned_size = pt.map(GuestPhysAddr::from(0x1000), frame, 0x800, MemAttr::Normal);
        assert_eq!(unaligned_size.err(), Some(AxError::InvalidInput));
        let unaligned_hpa = pt.map(GuestPhysAddr::from(0x1000), frame + 8, PAGE, MemAttr::Normal);
        assert_eq!(unaligned_hpa.err(), Some(AxError::InvalidInput));
        assert!(pt.leaf_entries().is_empty());
    }

    #[test]
    fn test_stage2_multi_page_and_device() {
        let mut pt = Stage2PageTable::<MockHal>::new().unwrap();
        let uart = HostPhysAddr::from(PL011_BASE);
        pt.map(GuestPhysAddr::from(PL011_BASE), uart, PAGE, MemAttr::Device)
            .unwrap();

        // Three frames straddling a 1 GiB boundary, so two level-2 tables.
        let base = 0x4000_0000 - 2 * PAGE;
        for i in 0..3 {
            let frame = MockHal::alloc_page().unwrap();
            pt.map(GuestPhysAddr::from(base + i * PAGE), frame, PAGE, MemAttr::Normal)
                .unwrap();
        }

        let leaves = pt.leaf_entries();
        assert_eq!(leaves.len(), 4);
        assert_eq!(leaves[0].0, GuestPhysAddr::from(PL011_BASE));
        assert_eq!(leaves[0].1.attr(), Some(MemAttr::Device));
        assert_eq!(leaves[0].1.paddr(), uart);
        let normal: Vec<_> = leaves[1..].iter().map(|(ipa, _)| ipa.as_usize()).collect();
        assert_eq!(normal, vec![base, base + PAGE, base + 2 * PAGE]);
    }

    #[test]
    fn test_stage2_copy_to_guest() {
        let mut pt = Stage2PageTable::<MockHal>::new().unwrap();
        let frames = [MockHal::alloc_page().unwrap(), MockHal::alloc_page().unwrap()];
        let ipa = GuestPhysAddr::from(0x8000_0000);
        pt.map(ipa, frames[0], PAGE, MemAttr::Normal).unwrap();
        pt.map(ipa + PAGE, frames[1], PAGE, MemAttr::Normal).unwrap();

        let data: Vec<u8> = (0u8..16).collect();
        pt.copy_to_guest(ipa + (PAGE - 8), &data).unwrap();
        let tail =
            unsafe { core::slice::from_raw_parts(MockHal::phys_to_virt(frames[0] + (PAGE - 8)).as_ptr(), 8) };
        let head = unsafe { core::slice::from_raw_parts(MockHal::phys_to_virt(frames[1]).as_ptr(), 8) };
        assert_eq!(tail, &data[..8]);
        assert_eq!(head, &data[8..]);

        let unmapped = pt.copy_to_guest(ipa + 2 * PAGE - 4, &data);
        assert_eq!(unmapped.err(), Some(AxError::NotFound));
    }

    #[test]
    fn test_stage2_control_registers() {
        assert_eq!(
            vtcr_value(),
            20 | (2 << 6) | (4 << 16) | (1 << 29) | (1 << 30)
        );
        assert_eq!(mair_value(), 0x4400);
        assert_eq!(hcr_value(), 1 | (1 << 3) | (1 << 4) | (1 << 19) | (1 << 31));
        // IRQs taken while a guest runs must reach EL2, and list registers must signal.
        assert_ne!(hcr_value() & (1 << 4), 0);
        assert_ne!(hcr_value() & (1 << 3), 0);

        let pt = Stage2PageTable::<MockHal>::new().unwrap();
        let vttbr = pt.vttbr(5);
        assert_eq!(vttbr >> 48, 5);
        assert_eq!(vttbr & 0xffff_ffff_ffff, pt.root_paddr().as_usize() as u64);
    }

    #[test]
    fn test_stage2_out_of_memory() {
        let mut pt = Stage2PageTable::<MockHal>::new().unwrap();
        let frame = MockHal::alloc_page().unwrap();
        PAGE_BUDGET.with(|budget| budget.set(Some(1)));
        let res = pt.map(GuestPhysAddr::from(0x8000_0000), frame, PAGE, MemAttr::Normal);
        PAGE_BUDGET.with(|budget| budget.set(None));
        assert_eq!(res.err(), Some(AxError::NoMemory));
    }

    #[test]
    fn test_list_register_encoding() {
        let lr = make_list_register(33, 33);
        assert_eq!(lr, (1 << 62) | (1 << 61) | (1 << 60) | (33 << 32) | 33);
    }

    #[test]
    fn test_lr_inject_and_reclaim() {
        let vgic = VGic::new(32, 1);
        let gic = MockGic::new(4);

        for irq in 32..36 {
            assert_eq!(vgic.inject(0, &gic, irq, irq).unwrap(), (irq - 32) as usize);
        }
        assert_eq!(vgic.cpu(0).unwrap().used_lr(), 0b1111);
        assert_eq!(
            vgic.inject(0, &gic, 40, 40).err(),
            Some(AxError::ResourceBusy)
        );

        // The guest deactivated the interrupt in LR1.
        gic.state.lock().lrs[1] = 0;
        vgic.reclaim(0, &gic).unwrap();
        assert_eq!(vgic.cpu(0).unwrap().used_lr(), 0b1101);
        vgic.reclaim(0, &gic).unwrap();
        assert_eq!(vgic.cpu(0).unwrap().used_lr(), 0b1101);

        assert_eq!(vgic.inject(0, &gic, 40, 40).unwrap(), 1);
        assert_eq!(gic.state.lock().lrs[1], make_list_register(40, 40));

        // Every occupied list register holds an interrupt that is not inactive.
        let used = vgic.cpu(0).unwrap().used_lr();
        let lrs = gic.state.lock().lrs;
        for (n, lr) in lrs.iter().enumerate().take(4) {
            assert_eq!(used & (1 << n) != 0, *lr >> 62 != 0);
        }
    }

    #[test]
    fn test_lr_count_clamped_to_bitmap() {
        let vgic = VGic::new(32, 1);
        let gic = MockGic::new(32);
        for n in 0..16 {
            assert_eq!(vgic.inject(0, &gic, 32, 32).unwrap(), n);
        }
        assert_eq!(vgic.inject(0, &gic, 32, 32).err(), Some(AxError::ResourceBusy));
        assert_eq!(vgic.cpu(0).unwrap().used_lr(), u16::MAX);
    }

    #[test]
    fn test_vgic_dist_enable_window() {
        let vgic = VGic::new(32, 1);
        let gic = MockGic::new(4);
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };

        VGicDistDevice
            .write(&ctx, GICD_ISENABLER + 4, 0b101, &word_write())
            .unwrap();
        assert_eq!(gic.state.lock().unmasked, vec![32, 34]);
        assert!(vgic.irq_config(0, 32).unwrap().enabled);
        assert!(!vgic.irq_config(0, 33).unwrap().enabled);
        assert!(vgic.irq_config(0, 34).unwrap().enabled);

        let set = VGicDistDevice.read(&ctx, GICD_ISENABLER + 4, &word_read()).unwrap();
        let clear = VGicDistDevice.read(&ctx, GICD_ICENABLER + 4, &word_read()).unwrap();
        assert_eq!(set, 0b101);
        assert_eq!(clear, 0b101);
    }

    #[test]
    fn test_vgic_dist_disable_window() {
        let vgic = VGic::new(32, 1);
        let gic = MockGic::new(4);
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };

        VGicDistDevice
            .write(&ctx, GICD_ISENABLER + 4, u32::MAX as u64, &word_write())
            .unwrap();
        VGicDistDevice
            .write(&ctx, GICD_ICENABLER + 4, u32::MAX as u64, &word_write())
            .unwrap();

        let state = gic.state.lock();
        assert_eq!(state.masked.len(), 32);
        assert_eq!(state.masked, (32..64).collect::<Vec<u32>>());
        drop(state);
        assert!((32..64).all(|irq| !vgic.irq_config(0, irq).unwrap().enabled));
    }

    #[test]
    fn test_vgic_dist_priority_bytes() {
        let vgic = VGic::new(32, 1);
        let gic = MockGic::new(4);
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };

        VGicDistDevice
            .write(&ctx, GICD_IPRIORITYR + 32, 0x4030_2010, &word_write())
            .unwrap();
        VGicDistDevice
            .write(&ctx, GICD_IPRIORITYR + 33, 0x99, &access(AccessSize::Byte, true))
            .unwrap();

        let prio: Vec<u8> = (32..36)
            .map(|irq| vgic.irq_config(0, irq).unwrap().priority)
            .collect();
        assert_eq!(prio, vec![0x10, 0x99, 0x30, 0x40]);
        let word = VGicDistDevice.read(&ctx, GICD_IPRIORITYR + 32, &word_read()).unwrap();
        assert_eq!(word, 0x4030_9910);
    }

    #[test]
    fn test_vgic_dist_targets() {
        let vgic = VGic::new(32, 2);
        let gic = MockGic::new(4);
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };

        // Shared lines default to CPU 0.
        let targets = VGicDistDevice.read(&ctx, GICD_ITARGETSR + 32, &word_read()).unwrap();
        assert_eq!(targets, 0x0101_0101);

        VGicDistDevice
            .write(&ctx, GICD_ITARGETSR + 32, 0x0000_0201, &word_write())
            .unwrap();
        assert_eq!(
            gic.state.lock().affinity,
            vec![(32, 1), (33, 2), (34, 0), (35, 0)]
        );
        assert_eq!(vgic.irq_config(0, 33).unwrap().affinity, 2);
    }

    #[test]
    fn test_vgic_dist_ctlr_and_typer() {
        let vgic = VGic::new(32, 2);
        let gic = MockGic::new(4);
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };

        assert_eq!(VGicDistDevice.read(&ctx, GICD_CTLR, &word_read()).unwrap(), 0x10);
        VGicDistDevice.write(&ctx, GICD_CTLR, 0x2, &word_write()).unwrap();
        assert!(vgic.dist().enabled());
        assert_eq!(VGicDistDevice.read(&ctx, GICD_CTLR, &word_read()).unwrap(), 0x12);

        // ITLinesNumber 1 (64 lines), CPUNumber 1 (two vcpus).
        assert_eq!(VGicDistDevice.read(&ctx, GICD_TYPER, &word_read()).unwrap(), 0x21);
        // Identification registers come from hardware.
        assert_eq!(VGicDistDevice.read(&ctx, 0x8, &word_read()).unwrap(), 0x0300_043b);
    }

    #[test]
    fn test_vgic_unsupported_lines_ignored() {
        let vgic = VGic::new(32, 1);
        let gic = MockGic::new(4);
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };

        // Lines 64..96 do not exist with 32 SPIs.
        VGicDistDevice
            .write(&ctx, GICD_ISENABLER + 8, 1, &word_write())
            .unwrap();
        assert!(gic.state.lock().unmasked.is_empty());
        assert_eq!(vgic.irq_config(0, 64), None);
        assert_eq!(
            VGicDistDevice.read(&ctx, GICD_ISENABLER + 8, &word_read()).unwrap(),
            0
        );
        // Unknown offsets read as zero.
        assert_eq!(VGicDistDevice.read(&ctx, 0xf00, &word_read()).unwrap(), 0);
    }

    #[test]
    fn test_vgic_redist_out_of_range() {
        let vgic = VGic::new(32, 1);
        let gic = MockGic::new(4);
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };

        let typer = VGicRedistDevice
            .read(&ctx, GICR_STRIDE + GICR_TYPER, &access(AccessSize::DoubleWord, false))
            .unwrap();
        assert_eq!(typer, 0);
        VGicRedistDevice
            .write(&ctx, GICR_STRIDE + GICR_ISENABLER0, 1, &word_write())
            .unwrap();
        assert!(gic.state.lock().unmasked.is_empty());
    }

    #[test]
    fn test_vgic_redist_private_enable() {
        let vgic = VGic::new(32, 2);
        let gic = MockGic::new(4);
        // vcpu 0 programs the redistributor of vcpu 1.
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };

        VGicRedistDevice
            .write(&ctx, GICR_STRIDE + GICR_ISENABLER0, 1 << 27, &word_write())
            .unwrap();
        assert_eq!(gic.state.lock().unmasked, vec![27]);
        assert!(vgic.irq_config(1, 27).unwrap().enabled);
        assert!(!vgic.irq_config(0, 27).unwrap().enabled);
        assert_eq!(
            VGicRedistDevice
                .read(&ctx, GICR_STRIDE + GICR_ISENABLER0, &word_read())
                .unwrap(),
            1 << 27
        );

        VGicRedistDevice
            .write(&ctx, GICR_STRIDE + GICR_ICENABLER0, 1 << 27, &word_write())
            .unwrap();
        assert_eq!(gic.state.lock().masked, vec![27]);
        assert!(!vgic.irq_config(1, 27).unwrap().enabled);
    }

    #[test]
    fn test_vgic_redist_typer_last() {
        let vgic = VGic::new(32, 2);
        let gic = MockGic::new(4);
        let ctx = MmioContext { vgic: &vgic, vcpu_index: 0, gic: &gic };
        let dword = access(AccessSize::DoubleWord, false);

        let first = VGicRedistDevice.read(&ctx, GICR_TYPER, &dword).unwrap();
        let last = VGicRedistDevice
            .read(&ctx, GICR_STRIDE + GICR_TYPER, &dword)
            .unwrap();
        assert_eq!(first & (1 << 4), 0);
        assert_eq!(last & (1 << 4), 1 << 4);
        assert_eq!(last >> 32, 1);
    }

    #[test]
    fn test_vcpu_state_machine() {
        let table = VCpuTable::new();
        let id = table.allocate().unwrap();
        let vcpu = table.get(id).unwrap();
        assert_eq!(vcpu.state(), VCpuState::Allocated);

        let res = vcpu.transition_state(VCpuState::Ready, VCpuState::Running);
        assert_eq!(res.err(), Some(AxError::BadState));
        assert_eq!(vcpu.state(), VCpuState::Allocated);

        vcpu.transition_state(VCpuState::Allocated, VCpuState::Ready)
            .unwrap();
        vcpu.transition_state(VCpuState::Ready, VCpuState::Running)
            .unwrap();
        assert_eq!(vcpu.state(), VCpuState::Running);
        assert_eq!(table.release(id).err(), Some(AxError::BadState));
    }

    #[test]
    fn test_vcpu_failed_block_keeps_state() {
        let table = VCpuTable::new();
        let vcpu = table.get(table.allocate().unwrap()).unwrap();
        let res: AxResult<()> =
            vcpu.with_state_transition(VCpuState::Allocated, VCpuState::Ready, || {
                Err(AxError::InvalidInput)
            });
        assert_eq!(res.err(), Some(AxError::InvalidInput));
        assert_eq!(vcpu.state(), VCpuState::Allocated);
    }

    #[test]
    fn test_vcpu_slot_exhaustion() {
        let table = VCpuTable::new();
        let ids: Vec<VCpuId> = (0..NCPU).map(|_| table.allocate().unwrap()).collect();
        assert_eq!(ids, (0..NCPU).map(VCpuId).collect::<Vec<_>>());
        assert_eq!(table.allocate().err(), Some(AxError::ResourceBusy));

        table.release(ids[2]).unwrap();
        assert_eq!(table.get(ids[2]).unwrap().state(), VCpuState::Unused);
        assert_eq!(table.allocate().unwrap(), ids[2]);
    }

    #[test]
    fn test_vcpu_create_seeds_context() {
        let table = VCpuTable::new();
        let setup = VCpuSetup {
            vm_id: 3,
            index: 0,
            entry: GuestPhysAddr::from(GUEST_ENTRY),
            dtb_addr: GuestPhysAddr::from(GUEST_DTB),
            cntfrq: 62_500_000,
            vmcr: 0x2,
        };
        let boot = table.get(table.create(&setup).unwrap()).unwrap();
        let ctx = boot.context();
        assert_eq!(ctx.frame.elr, GUEST_ENTRY as u64);
        assert_eq!(ctx.frame.spsr, 0x3c5);
        assert_eq!(ctx.frame.x[0], GUEST_DTB as u64);
        assert_eq!(ctx.sys.mpidr_el1, 0);
        assert_eq!(ctx.sys.midr_el1, GUEST_MIDR);
        assert_eq!(ctx.sys.cntfrq_el0, 62_500_000);
        assert_eq!(ctx.gic, GicContext { vmcr: 0x2, sre_el1: 1 });
        assert_eq!(boot.vm_id(), Some(3));
        assert!(boot.is_bsp());

        let secondary = table
            .get(
                table
                    .create(&VCpuSetup {
                        index: 1,
                        entry: GuestPhysAddr::from(0),
                        ..setup
                    })
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(secondary.context().frame.x[0], 0);
        assert_eq!(secondary.context().sys.mpidr_el1, 1);
        assert!(!secondary.is_bsp());
    }

    #[test]
    fn test_trap_frame_zero_register() {
        let mut frame = TrapFrame::default();
        frame.set_gpr(31, 0x1234);
        assert_eq!(frame.gpr(31), 0);
        frame.set_gpr(30, 0x1234);
        assert_eq!(frame.gpr(30), 0x1234);
        frame.elr = 0x8000;
        frame.advance_pc();
        assert_eq!(frame.elr, 0x8004);
    }

    #[test]
    fn test_access_size() {
        assert_eq!(AccessSize::from_sas(0), AccessSize::Byte);
        assert_eq!(AccessSize::from_sas(3), AccessSize::DoubleWord);
        assert_eq!(AccessSize::HalfWord.truncate(0x1234_5678), 0x5678);
        assert_eq!(AccessSize::DoubleWord.truncate(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_percpu_lifecycle() {
        let mut percpu = AxPerCpu::<MockArchPerCpu>::new_uninit();
        assert!(!percpu.is_enabled());
        percpu.init(2).unwrap();
        assert_eq!(percpu.init(2).err(), Some(AxError::BadState));
        assert_eq!(percpu.cpu_id(), 2);
        percpu.hardware_enable().unwrap();
        assert!(percpu.is_enabled());
        percpu.hardware_disable().unwrap();
        assert!(!percpu.is_enabled());
        assert_eq!(percpu.current_vcpu(), None);
    }

    #[test]
    fn test_create_guest_vm() {
        let hv = TestHypervisor::new(MockGic::new(4));
        let mut config = test_config(1);
        config.dtb = Some(GuestImage::new("test-dtb", &GUEST_DTB_BLOB));
        let vm = hv.create_guest_vm(&config).unwrap();

        let leaves = vm.stage2().lock().leaf_entries();
        let normal: Vec<usize> = leaves
            .iter()
            .filter(|(_, pte)| pte.attr() == Some(MemAttr::Normal))
            .map(|(ipa, _)| ipa.as_usize())
            .collect();
        let device: Vec<usize> = leaves
            .iter()
            .filter(|(_, pte)| pte.attr() == Some(MemAttr::Device))
            .map(|(ipa, _)| ipa.as_usize())
            .collect();
        assert_eq!(normal, (0..8).map(|i| GUEST_ENTRY + i * PAGE).collect::<Vec<_>>());
        assert_eq!(device, vec![PL011_BASE]);

        let mut stage2 = vm.stage2().lock();
        let image = stage2.translate(GuestPhysAddr::from(GUEST_ENTRY)).unwrap();
        let loaded = unsafe { core::slice::from_raw_parts(MockHal::phys_to_virt(image).as_ptr(), 16) };
        assert_eq!(loaded, &GUEST_IMAGE[..16]);
        let dtb = stage2.translate(GuestPhysAddr::from(GUEST_DTB)).unwrap();
        let dtb = unsafe { core::slice::from_raw_parts(MockHal::phys_to_virt(dtb).as_ptr(), 8) };
        assert_eq!(dtb, &GUEST_DTB_BLOB);
        drop(stage2);

        assert_eq!(vm.ncpu(), 1);
        assert_eq!(vm.vgic().nspis(), 32);
        assert_eq!(vm.with_mmio_regions(|regions| regions.len()), 2);
        let boot = hv.vcpus().get(vm.vcpu_id(0).unwrap()).unwrap();
        assert_eq!(boot.state(), VCpuState::Ready);
        assert_eq!(boot.context().frame.x[0], GUEST_DTB as u64);
        assert_eq!(hv.vm(vm.id()).unwrap().name(), "test-guest");
    }

    #[test]
    fn test_create_guest_vm_secondaries_wait() {
        let hv = TestHypervisor::new(MockGic::new(4));
        let vm = hv.create_guest_vm(&test_config(2)).unwrap();
        let secondary = hv.vcpus().get(vm.vcpu_id(1).unwrap()).unwrap();
        assert_eq!(secondary.state(), VCpuState::Allocated);
        assert_eq!(secondary.index(), 1);
        assert_eq!(vm.vcpu_ids().len(), 2);
    }

    #[test]
    fn test_create_guest_vm_validation() {
        let hv = TestHypervisor::new(MockGic::new(4));

        let mut no_image = test_config(1);
        no_image.image = None;
        assert_eq!(hv.create_guest_vm(&no_image).err(), Some(AxError::InvalidInput));

        assert_eq!(
            hv.create_guest_vm(&test_config(0)).err(),
            Some(AxError::InvalidInput)
        );
        assert_eq!(
            hv.create_guest_vm(&test_config(NCPU + 1)).err(),
            Some(AxError::InvalidInput)
        );

        let mut unaligned = test_config(1);
        unaligned.entry = GuestPhysAddr::from(GUEST_ENTRY + 0x10);
        assert_eq!(hv.create_guest_vm(&unaligned).err(), Some(AxError::InvalidInput));

        // Nothing leaked into the slot table.
        assert!(hv.vcpus().iter().all(|vcpu| vcpu.state() == VCpuState::Unused));
    }

    #[test]
    fn test_create_guest_vm_exhausts_slots() {
        let hv = TestHypervisor::new(MockGic::new(4));
        hv.create_guest_vm(&test_config(NCPU - 1)).unwrap();
        assert_eq!(
            hv.create_guest_vm(&test_config(2)).err(),
            Some(AxError::ResourceBusy)
        );
        // The partially built VM returned its slot.
        assert_eq!(hv.vcpus().get(VCpuId(NCPU - 1)).unwrap().state(), VCpuState::Unused);
    }

    #[test]
    fn test_create_guest_vm_out_of_memory_releases_slots() {
        let hv = TestHypervisor::new(MockGic::new(4));
        // Enough for the root table and part of the first guest page walk.
        PAGE_BUDGET.with(|budget| budget.set(Some(6)));
        let res = hv.create_guest_vm(&test_config(NCPU));
        PAGE_BUDGET.with(|budget| budget.set(None));
        assert_eq!(res.err(), Some(AxError::NoMemory));
        assert!(hv.vcpus().iter().all(|vcpu| vcpu.state() == VCpuState::Unused));
        assert!(hv.vcpus().iter().all(|vcpu| vcpu.vm_id().is_none()));
        assert_eq!(hv.vm(0).err(), Some(AxError::NotFound));

        let vm = hv.create_guest_vm(&test_config(1)).unwrap();
        assert_eq!(
            hv.vcpus().get(vm.vcpu_id(0).unwrap()).unwrap().state(),
            VCpuState::Ready
        );
    }

    #[test]
    fn test_create_guest_vm_dtb_outside_ram_releases_slots() {
        let hv = TestHypervisor::new(MockGic::new(4));
        let mut config = test_config(2);
        config.dtb = Some(GuestImage::new("test-dtb", &GUEST_DTB_BLOB));
        config.dtb_addr = GuestPhysAddr::from(GUEST_ENTRY + GUEST_RAM);
        assert_eq!(hv.create_guest_vm(&config).err(), Some(AxError::NotFound));
        assert!(hv.vcpus().iter().all(|vcpu| vcpu.state() == VCpuState::Unused));

        hv.create_guest_vm(&test_config(2)).unwrap();
    }

    #[test]
    fn test_resume_world_switch_order() {
        let (hv, vm, percpu) = running_guest(1);
        let arch = percpu.arch_checked();
        assert_eq!(
            arch.calls,
            vec![
                "set_current_context",
                "install_stage2",
                "flush_guest_tlb",
                "restore_sysregs",
                "enter_guest"
            ]
        );
        assert_eq!(arch.vttbr, vm.vttbr());
        assert_eq!(percpu.current_vcpu(), Some(VCpuId(0)));
        assert_eq!(hv.gic().state.lock().percpu_init, vec![0]);
        assert_eq!(
            hv.gic().state.lock().restored,
            vec![GicContext { vmcr: 0x2, sre_el1: 1 }]
        );
        assert_eq!(hv.vcpus().get(VCpuId(0)).unwrap().state(), VCpuState::Running);
    }

    #[test]
    fn test_resume_requires_ready() {
        let (hv, _vm, mut percpu) = running_guest(2);
        // Running already.
        assert_eq!(
            hv.resume(&mut percpu, VCpuId(0)).err(),
            Some(AxError::BadState)
        );
        // Still waiting for CPU_ON.
        assert_eq!(
            hv.resume(&mut percpu, VCpuId(1)).err(),
            Some(AxError::BadState)
        );
        assert_eq!(hv.vcpus().get(VCpuId(1)).unwrap().state(), VCpuState::Allocated);

        // Never allocated.
        assert_eq!(
            hv.resume(&mut percpu, VCpuId(NCPU - 1)).err(),
            Some(AxError::BadState)
        );
        assert_eq!(hv.vcpus().get(VCpuId(NCPU - 1)).unwrap().state(), VCpuState::Unused);
    }

    #[test]
    fn test_trap_without_running_vcpu() {
        let hv = TestHypervisor::new(MockGic::new(4));
        hv.create_guest_vm(&test_config(1)).unwrap();
        let mut percpu = AxPerCpu::<MockArchPerCpu>::new_uninit();
        hv.init_percpu(&mut percpu, 0).unwrap();
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, hvc(0)).err(),
            Some(AxError::BadState)
        );
    }

    #[test]
    fn test_hvc_psci_version_keeps_pc() {
        let (hv, _vm, mut percpu) = running_guest(1);
        set_guest_gpr(&hv, 0, PSCI_VERSION as u64);

        hv.handle_sync_exception(&mut percpu, hvc(0)).unwrap();
        let frame = guest_frame(&hv, 0);
        assert_eq!(frame.x[0], FIRMWARE_PSCI_VERSION);
        assert_eq!(frame.elr, GUEST_ENTRY as u64);
        assert!(firmware_calls().contains(&(PSCI_VERSION, 0, 0)));
    }

    #[test]
    fn test_smc_advances_pc() {
        let (hv, _vm, mut percpu) = running_guest(1);
        set_guest_gpr(&hv, 0, PSCI_FEATURES as u64);
        set_guest_gpr(&hv, 1, 0xdead);

        hv.handle_sync_exception(&mut percpu, smc(0)).unwrap();
        let frame = guest_frame(&hv, 0);
        assert_eq!(frame.x[0], ret(PSCI_SUCCESS));
        assert_eq!(frame.elr, GUEST_ENTRY as u64 + 4);
    }

    #[test]
    fn test_psci_system_off_not_supported() {
        let (hv, _vm, mut percpu) = running_guest(1);
        set_guest_gpr(&hv, 0, PSCI_SYSTEM_OFF as u64);
        hv.handle_sync_exception(&mut percpu, hvc(0)).unwrap();
        assert_eq!(guest_frame(&hv, 0).x[0], ret(PSCI_NOT_SUPPORTED));
    }

    #[test]
    fn test_unknown_calls_fail() {
        let (hv, _vm, mut percpu) = running_guest(1);
        set_guest_gpr(&hv, 0, PSCI_VERSION as u64);
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, hvc(1)).err(),
            Some(AxError::Unsupported)
        );

        set_guest_gpr(&hv, 0, 0x8400_00ff);
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, smc(0)).err(),
            Some(AxError::Unsupported)
        );
        assert_eq!(guest_frame(&hv, 0).elr, GUEST_ENTRY as u64);
    }

    #[test]
    fn test_psci_cpu_on() {
        let (hv, vm, mut percpu) = running_guest(2);
        let cpu_on = |target: u64| {
            set_guest_gpr(&hv, 0, PSCI_CPU_ON_64 as u64);
            set_guest_gpr(&hv, 1, target);
            set_guest_gpr(&hv, 2, 0x8030_0000);
            set_guest_gpr(&hv, 3, 0xabc);
        };

        cpu_on(1);
        hv.handle_sync_exception(&mut percpu, hvc(0)).unwrap();
        assert_eq!(guest_frame(&hv, 0).x[0], ret(PSCI_SUCCESS));

        let target = hv.vcpus().get(vm.vcpu_id(1).unwrap()).unwrap();
        assert_eq!(target.state(), VCpuState::Ready);
        assert_eq!(target.context().frame.elr, 0x8030_0000);
        assert_eq!(target.context().frame.x[0], 0xabc);
        assert!(firmware_calls().contains(&(PSCI_CPU_ON_64, 1, SECONDARY_ENTRY as u64)));

        // Powering on twice, or powering on oneself, reports the core as on.
        cpu_on(1);
        hv.handle_sync_exception(&mut percpu, hvc(0)).unwrap();
        assert_eq!(guest_frame(&hv, 0).x[0], ret(PSCI_ALREADY_ON));
        cpu_on(0);
        hv.handle_sync_exception(&mut percpu, hvc(0)).unwrap();
        assert_eq!(guest_frame(&hv, 0).x[0], ret(PSCI_ALREADY_ON));

        cpu_on(5);
        hv.handle_sync_exception(&mut percpu, hvc(0)).unwrap();
        assert_eq!(guest_frame(&hv, 0).x[0], ret(PSCI_INVALID_PARAMETERS));
    }

    #[test]
    fn test_secondary_start_after_cpu_on() {
        let (hv, _vm, mut percpu) = running_guest(2);
        set_guest_gpr(&hv, 0, PSCI_CPU_ON_64 as u64);
        set_guest_gpr(&hv, 1, 1);
        set_guest_gpr(&hv, 2, 0x8030_0000);
        hv.handle_sync_exception(&mut percpu, hvc(0)).unwrap();

        // The woken core runs the slot matching its id.
        let mut secondary = AxPerCpu::<MockArchPerCpu>::new_uninit();
        hv.init_percpu(&mut secondary, 1).unwrap();
        hv.start_vcpu(&mut secondary).unwrap();
        assert_eq!(secondary.current_vcpu(), Some(VCpuId(1)));
        assert_eq!(hv.vcpus().get(VCpuId(1)).unwrap().state(), VCpuState::Running);
    }

    #[test]
    fn test_sgi_register_forwarded() {
        let (hv, _vm, mut percpu) = running_guest(1);
        let sgir = (1 << 40) | (3 << 24) | 0b10;
        set_guest_gpr(&hv, 5, sgir);

        let trap = sysreg(SysRegAddr::ICC_SGI1R_EL1, 5, false);
        hv.handle_sync_exception(&mut percpu, trap).unwrap();
        assert_eq!(hv.gic().state.lock().sgis, vec![sgir]);
        assert_eq!(guest_frame(&hv, 0).elr, GUEST_ENTRY as u64 + 4);
    }

    #[test]
    fn test_other_system_registers_unsupported() {
        let (hv, _vm, mut percpu) = running_guest(1);
        // ICC_SGI1R_EL1 is write-only.
        let read_sgi = sysreg(SysRegAddr::ICC_SGI1R_EL1, 5, true);
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, read_sgi).err(),
            Some(AxError::Unsupported)
        );
        // CNTP_CTL_EL0
        let timer = sysreg(SysRegAddr::new(3, 3, 14, 2, 1), 1, false);
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, timer).err(),
            Some(AxError::Unsupported)
        );
        assert!(hv.gic().state.lock().sgis.is_empty());
    }

    #[test]
    fn test_data_abort_into_vgic() {
        let (hv, vm, mut percpu) = running_guest(1);
        set_guest_gpr(&hv, 3, 0x2);

        let write_ctlr = data_abort(GICD_BASE + GICD_CTLR, true, 2, 3);
        hv.handle_sync_exception(&mut percpu, write_ctlr).unwrap();
        assert!(vm.vgic().dist().enabled());
        assert_eq!(guest_frame(&hv, 0).elr, GUEST_ENTRY as u64 + 4);

        let read_typer = data_abort(GICD_BASE + GICD_TYPER, false, 2, 7);
        hv.handle_sync_exception(&mut percpu, read_typer).unwrap();
        assert_eq!(guest_frame(&hv, 0).x[7], 0x1);
        assert_eq!(guest_frame(&hv, 0).elr, GUEST_ENTRY as u64 + 8);
    }

    #[test]
    fn test_data_abort_read_into_zero_register() {
        let (hv, _vm, mut percpu) = running_guest(1);
        let before = guest_frame(&hv, 0);
        let trap = data_abort(GICD_BASE + GICD_TYPER, false, 2, 31);
        hv.handle_sync_exception(&mut percpu, trap).unwrap();
        let after = guest_frame(&hv, 0);
        assert_eq!(after.x, before.x);
        assert_eq!(after.elr, before.elr + 4);
    }

    #[test]
    fn test_data_abort_without_syndrome() {
        let (hv, _vm, mut percpu) = running_guest(1);
        let mut trap = data_abort(GICD_BASE, true, 2, 3);
        trap.esr &= !(1 << 24);
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, trap).err(),
            Some(AxError::InvalidData)
        );
        assert_eq!(guest_frame(&hv, 0).elr, GUEST_ENTRY as u64);
    }

    #[test]
    fn test_data_abort_unmapped_region() {
        let (hv, _vm, mut percpu) = running_guest(1);
        let trap = data_abort(0x0a00_0000, false, 2, 1);
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, trap).err(),
            Some(AxError::NotFound)
        );
    }

    #[test]
    fn test_unknown_exception_class() {
        let (hv, _vm, mut percpu) = running_guest(1);
        // Trapped WFI.
        let trap = TrapSyndrome::new(esr(0x01, 0), 0, 0);
        assert_eq!(
            trap.decode().unwrap(),
            AxVCpuExitReason::Unknown { ec: 0x01, iss: 0 }
        );
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, trap).err(),
            Some(AxError::Unsupported)
        );
        assert_eq!(guest_frame(&hv, 0).elr, GUEST_ENTRY as u64);
    }

    #[test]
    fn test_syndrome_fault_ipa() {
        let trap = data_abort(0x0808_0abc, true, 1, 4);
        assert_eq!(trap.fault_ipa(), GuestPhysAddr::from(0x0808_0abc));
        assert_eq!(
            trap.decode().unwrap(),
            AxVCpuExitReason::MmioWrite {
                addr: GuestPhysAddr::from(0x0808_0abc),
                width: AccessSize::HalfWord,
                reg: 4,
            }
        );
    }

    struct TagDevice {
        tag: u64,
        writes: Mutex<Vec<(usize, u64)>>,
    }

    impl TagDevice {
        fn new(tag: u64) -> Arc<Self> {
            Arc::new(Self {
                tag,
                writes: Mutex::new(Vec::new()),
            })
        }
    }

    impl VirtMmioDevice for TagDevice {
        fn name(&self) -> &str {
            "tag"
        }

        fn read(&self, _ctx: &MmioContext, _offset: usize, _access: &MmioAccess) -> AxResult<u64> {
            Ok(self.tag)
        }

        fn write(
            &self,
            _ctx: &MmioContext,
            offset: usize,
            val: u64,
            _access: &MmioAccess,
        ) -> AxResult {
            self.writes.lock().push((offset, val));
            Ok(())
        }
    }

    struct WriteOnlyDevice;

    impl VirtMmioDevice for WriteOnlyDevice {
        fn name(&self) -> &str {
            "write-only"
        }

        fn write(&self, _ctx: &MmioContext, _offset: usize, _val: u64, _access: &MmioAccess) -> AxResult {
            Ok(())
        }
    }

    #[test]
    fn test_mmio_latest_registration_wins() {
        let (hv, vm, mut percpu) = running_guest(1);
        let base = GuestPhysAddr::from(0x0a00_0000);
        let old = TagDevice::new(0x11);
        let new = TagDevice::new(0x22);
        vm.register_mmio_trap(base, 0x1000, old.clone()).unwrap();
        vm.register_mmio_trap(base + 0x800, 0x1000, new.clone())
            .unwrap();

        // Only the older region covers the low half.
        hv.handle_sync_exception(&mut percpu, data_abort(0x0a00_0010, false, 3, 2))
            .unwrap();
        assert_eq!(guest_frame(&hv, 0).x[2], 0x11);
        hv.handle_sync_exception(&mut percpu, data_abort(0x0a00_0810, false, 3, 2))
            .unwrap();
        assert_eq!(guest_frame(&hv, 0).x[2], 0x22);

        set_guest_gpr(&hv, 9, 0x1234_5678);
        hv.handle_sync_exception(&mut percpu, data_abort(0x0a00_0900, true, 0, 9))
            .unwrap();
        assert_eq!(*new.writes.lock(), vec![(0x100, 0x78)]);
        assert!(old.writes.lock().is_empty());
    }

    #[test]
    fn test_mmio_read_truncated() {
        let (hv, vm, mut percpu) = running_guest(1);
        vm.register_mmio_trap(GuestPhysAddr::from(0x0a00_0000), 0x1000, TagDevice::new(0xaabb_ccdd))
            .unwrap();
        hv.handle_sync_exception(&mut percpu, data_abort(0x0a00_0000, false, 1, 6))
            .unwrap();
        assert_eq!(guest_frame(&hv, 0).x[6], 0xccdd);
    }

    #[test]
    fn test_mmio_missing_direction() {
        let (hv, vm, mut percpu) = running_guest(1);
        vm.register_mmio_trap(GuestPhysAddr::from(0x0a00_0000), 0x1000, Arc::new(WriteOnlyDevice))
            .unwrap();
        assert_eq!(
            vm.register_mmio_trap(GuestPhysAddr::from(0x0b00_0000), 0, Arc::new(WriteOnlyDevice))
                .err(),
            Some(AxError::InvalidInput)
        );

        hv.handle_sync_exception(&mut percpu, data_abort(0x0a00_0000, true, 2, 1))
            .unwrap();
        assert_eq!(
            hv.handle_sync_exception(&mut percpu, data_abort(0x0a00_0000, false, 2, 1))
                .err(),
            Some(AxError::Unsupported)
        );
    }

    #[test]
    fn test_irq_forwarded_to_guest() {
        let (hv, vm, mut percpu) = running_guest(1);
        hv.gic().state.lock().pending.push(33);

        hv.handle_irq(&mut percpu).unwrap();
        let state = hv.gic().state.lock();
        assert_eq!(state.eoi, vec![33]);
        assert_eq!(state.lrs[0], make_list_register(33, 33));
        drop(state);
        assert_eq!(vm.vgic().cpu(0).unwrap().used_lr(), 0b1);
    }

    #[test]
    fn test_irq_spurious_ignored() {
        let (hv, vm, mut percpu) = running_guest(1);
        hv.handle_irq(&mut percpu).unwrap();
        assert!(hv.gic().state.lock().eoi.is_empty());
        assert_eq!(vm.vgic().cpu(0).unwrap().used_lr(), 0);
    }

    #[test]
    fn test_irq_reclaims_before_inject() {
        let (hv, vm, mut percpu) = running_guest(1);
        hv.gic().state.lock().pending.extend([32, 33, 34, 35, 36]);
        for _ in 0..4 {
            hv.handle_irq(&mut percpu).unwrap();
        }
        assert_eq!(vm.vgic().cpu(0).unwrap().used_lr(), 0b1111);

        // No list register drained: the fifth interrupt cannot be presented.
        assert_eq!(hv.handle_irq(&mut percpu).err(), Some(AxError::ResourceBusy));

        // The guest handled the interrupt in LR2.
        hv.gic().state.lock().pending.push(37);
        hv.gic().state.lock().lrs[2] = 0;
        hv.handle_irq(&mut percpu).unwrap();
        assert_eq!(hv.gic().state.lock().lrs[2], make_list_register(37, 37));
        assert_eq!(vm.vgic().cpu(0).unwrap().used_lr(), 0b1111);
    }
}
