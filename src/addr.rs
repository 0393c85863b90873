/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;
/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;

memory_addr::def_usize_addr! {
    /// Guest physical address (an IPA in Arm terms).
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}
