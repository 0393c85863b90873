use crate::{HostPhysAddr, HostVirtAddr};

/// The interfaces which the underlying platform (boot code and allocators) must implement.
pub trait AxHyperHal {
    /// Allocates one zeroed, 4K-aligned physical frame.
    ///
    /// # Returns
    ///
    /// * `Option<HostPhysAddr>` - The frame, or `None` when physical memory is exhausted.
    fn alloc_page() -> Option<HostPhysAddr>;

    /// Returns a frame obtained from [`AxHyperHal::alloc_page`] to the allocator.
    fn free_page(paddr: HostPhysAddr);

    /// Converts a host physical address to a host virtual address the hypervisor can
    /// dereference. The hypervisor runs identity mapped, so this is the identity by default.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    /// Frequency of the system counter (`CNTFRQ_EL0`), copied into every vCPU.
    fn timer_frequency() -> u64;

    /// Issues an SMC to the secure monitor and returns `x0`.
    fn firmware_call(function: u32, arg0: u64, arg1: u64) -> u64;

    /// Physical address where a core woken through the firmware starts executing
    /// hypervisor code.
    fn secondary_entry() -> HostPhysAddr;
}
