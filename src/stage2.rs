use alloc::vec::Vec;
use core::fmt;
use core::marker::PhantomData;

use axerrno::{ax_err, ax_err_type, AxResult};
use memory_addr::{is_aligned_4k, PAGE_SIZE_4K};
use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::{AxHyperHal, GuestPhysAddr, HostPhysAddr};

/// Number of descriptors in one 4K translation table.
const ENTRY_COUNT: usize = 512;

/// Levels of the walk. Level 3 holds the page descriptors.
const LEAF_LEVEL: usize = 3;

/// Output address bits [47:12] of a descriptor.
const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

register_bitfields![u64,
    /// Stage-2 translation table descriptor (4K granule).
    pub S2PTE [
        VALID OFFSET(0) NUMBITS(1) [],
        /// Table descriptor at levels 0..2, page descriptor at level 3.
        TABLE OFFSET(1) NUMBITS(1) [],
        ATTR_INDX OFFSET(2) NUMBITS(3) [
            Device = 0,
            Normal = 1
        ],
        S2AP OFFSET(6) NUMBITS(2) [
            None = 0,
            ReadOnly = 1,
            WriteOnly = 2,
            ReadWrite = 3
        ],
        SH OFFSET(8) NUMBITS(2) [],
        AF OFFSET(10) NUMBITS(1) [],
        OUTPUT_ADDR OFFSET(12) NUMBITS(36) []
    ],

    /// Virtualization Translation Control Register.
    pub VTCR_EL2 [
        T0SZ OFFSET(0) NUMBITS(6) [],
        SL0 OFFSET(6) NUMBITS(2) [],
        SH0 OFFSET(12) NUMBITS(2) [],
        TG0 OFFSET(14) NUMBITS(2) [
            Granule4K = 0
        ],
        PS OFFSET(16) NUMBITS(3) [],
        NSW OFFSET(29) NUMBITS(1) [],
        NSA OFFSET(30) NUMBITS(1) []
    ],

    /// Hypervisor Configuration Register, only the bits this hypervisor sets.
    pub HCR_EL2 [
        VM OFFSET(0) NUMBITS(1) [],
        FMO OFFSET(3) NUMBITS(1) [],
        IMO OFFSET(4) NUMBITS(1) [],
        TSC OFFSET(19) NUMBITS(1) [],
        RW OFFSET(31) NUMBITS(1) []
    ]
];

/// The memory attribute profile selected by a leaf descriptor.
///
/// The numeric value is the `MAIR_EL2` attribute index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAttr {
    /// Device-nGnRnE: no gathering, no reordering, no early write acknowledgement.
    Device = 0,
    /// Normal memory, inner/outer non-cacheable.
    Normal = 1,
}

impl MemAttr {
    /// The `MAIR_EL2` attribute byte programmed at this profile's index.
    pub const fn mair_attr(self) -> u64 {
        match self {
            MemAttr::Device => 0x00,
            MemAttr::Normal => 0x44,
        }
    }
}

/// `VTCR_EL2` value: 44-bit IPA space, walk starting at level 0, 4K granule,
/// 44-bit output addresses, non-secure tables.
pub fn vtcr_value() -> u64 {
    (VTCR_EL2::T0SZ.val(20)
        + VTCR_EL2::SL0.val(2)
        + VTCR_EL2::SH0.val(0)
        + VTCR_EL2::TG0::Granule4K
        + VTCR_EL2::PS.val(4)
        + VTCR_EL2::NSW::SET
        + VTCR_EL2::NSA::SET)
        .value
}

/// `MAIR_EL2` value holding the device and normal profiles.
pub fn mair_value() -> u64 {
    [MemAttr::Device, MemAttr::Normal]
        .iter()
        .fold(0, |mair, attr| mair | (attr.mair_attr() << (8 * (*attr as u64))))
}

/// `HCR_EL2` value: stage-2 enabled, physical IRQ and FIQ routed to EL2 (which also
/// turns on virtual interrupt signalling from the list registers), EL1 is AArch64,
/// SMC traps to EL2.
pub fn hcr_value() -> u64 {
    (HCR_EL2::VM::SET
        + HCR_EL2::FMO::SET
        + HCR_EL2::IMO::SET
        + HCR_EL2::TSC::SET
        + HCR_EL2::RW::SET)
        .value
}

/// A raw stage-2 descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Stage2Pte(u64);

impl Stage2Pte {
    pub const fn empty() -> Self {
        Self(0)
    }

    fn new_table(paddr: HostPhysAddr) -> Self {
        Self(
            (S2PTE::VALID::SET + S2PTE::TABLE::SET).value
                | (paddr.as_usize() as u64 & PTE_ADDR_MASK),
        )
    }

    fn new_page(paddr: HostPhysAddr, attr: MemAttr) -> Self {
        let attr_indx = match attr {
            MemAttr::Device => S2PTE::ATTR_INDX::Device,
            MemAttr::Normal => S2PTE::ATTR_INDX::Normal,
        };
        Self(
            (S2PTE::VALID::SET
                + S2PTE::TABLE::SET
                + attr_indx
                + S2PTE::S2AP::ReadWrite
                + S2PTE::AF::SET)
                .value
                | (paddr.as_usize() as u64 & PTE_ADDR_MASK),
        )
    }

    fn reg(&self) -> LocalRegisterCopy<u64, S2PTE::Register> {
        LocalRegisterCopy::new(self.0)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.reg().is_set(S2PTE::VALID)
    }

    /// Valid descriptor pointing at a next-level table (or a page, at level 3).
    fn is_table(&self) -> bool {
        self.is_valid() && self.reg().is_set(S2PTE::TABLE)
    }

    /// Whether the access flag is set. Every page descriptor written by
    /// [`Stage2PageTable::map`] carries it.
    pub fn is_accessed(&self) -> bool {
        self.reg().is_set(S2PTE::AF)
    }

    pub fn paddr(&self) -> HostPhysAddr {
        HostPhysAddr::from((self.0 & PTE_ADDR_MASK) as usize)
    }

    pub fn attr(&self) -> Option<MemAttr> {
        match self.reg().read(S2PTE::ATTR_INDX) {
            0 => Some(MemAttr::Device),
            1 => Some(MemAttr::Normal),
            _ => None,
        }
    }

    /// Raw `S2AP` access permission bits.
    pub fn access_permission(&self) -> u64 {
        self.reg().read(S2PTE::S2AP)
    }

    fn clear(&mut self) {
        self.0 = 0
    }
}

impl fmt::Debug for Stage2Pte {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Stage2Pte")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("paddr", &self.paddr())
            .field("attr", &self.attr())
            .field("accessed", &self.is_accessed())
            .finish()
    }
}

/// Index into the table at `level` for `ipa`.
const fn table_index(ipa: usize, level: usize) -> usize {
    (ipa >> (39 - level * 9)) & (ENTRY_COUNT - 1)
}

/// A 4-level stage-2 translation table mapping guest-physical to host-physical memory.
///
/// Intermediate tables are created lazily on the first mapping under them and are never
/// reclaimed: unmapping releases leaf frames only.
pub struct Stage2PageTable<H: AxHyperHal> {
    root: HostPhysAddr,
    _phantom: PhantomData<H>,
}

impl<H: AxHyperHal> Stage2PageTable<H> {
    /// Allocates an empty level-0 table.
    pub fn new() -> AxResult<Self> {
        let root = H::alloc_page()
            .ok_or_else(|| ax_err_type!(NoMemory, "unable to allocate the stage-2 root table"))?;
        Ok(Self {
            root,
            _phantom: PhantomData,
        })
    }

    /// Physical address of the level-0 table.
    pub const fn root_paddr(&self) -> HostPhysAddr {
        self.root
    }

    /// `VTTBR_EL2` value for this table, tagged with `vmid`.
    pub fn vttbr(&self, vmid: u16) -> u64 {
        ((vmid as u64) << 48) | (self.root.as_usize() as u64 & PTE_ADDR_MASK)
    }

    #[allow(clippy::mut_from_ref)]
    fn table_of<'a>(&self, paddr: HostPhysAddr) -> &'a mut [Stage2Pte; ENTRY_COUNT] {
        // SAFETY: `paddr` is a table frame allocated by this page table, and the
        // hypervisor's view of it stays mapped for the table's lifetime.
        unsafe { &mut *(H::phys_to_virt(paddr).as_mut_ptr() as *mut [Stage2Pte; ENTRY_COUNT]) }
    }

    /// Descends levels 0..2 and returns the level-3 descriptor for `ipa`.
    ///
    /// Missing intermediate tables are allocated when `alloc` is set, otherwise the walk
    /// stops with `Ok(None)`.
    pub fn walk(&mut self, ipa: GuestPhysAddr, alloc: bool) -> AxResult<Option<&mut Stage2Pte>> {
        let ipa = ipa.as_usize();
        let mut table = self.table_of(self.root);
        for level in 0..LEAF_LEVEL {
            let pte = &mut table[table_index(ipa, level)];
            let next = if pte.is_table() {
                pte.paddr()
            } else if alloc {
                let frame = H::alloc_page().ok_or_else(|| {
                    ax_err_type!(NoMemory, "unable to allocate a stage-2 table page")
                })?;
                *pte = Stage2Pte::new_table(frame);
                frame
            } else {
                return Ok(None);
            };
            table = self.table_of(next);
        }
        Ok(Some(&mut table[table_index(ipa, LEAF_LEVEL)]))
    }

    /// Maps `[ipa, ipa + size)` to `[hpa, hpa + size)` with read/write access.
    pub fn map(
        &mut self,
        ipa: GuestPhysAddr,
        hpa: HostPhysAddr,
        size: usize,
        attr: MemAttr,
    ) -> AxResult {
        if !is_aligned_4k(ipa.as_usize()) || !is_aligned_4k(hpa.as_usize()) || !is_aligned_4k(size) {
            return ax_err!(
                InvalidInput,
                "stage-2 mapping requires page aligned addresses and size"
            );
        }
        trace!("stage-2 map {:?} -> {:?} size {:#x} {:?}", ipa, hpa, size, attr);

        for off in (0..size).step_by(PAGE_SIZE_4K) {
            let page_ipa = ipa + off;
            let pte = self
                .walk(page_ipa, true)?
                .ok_or_else(|| ax_err_type!(BadState, "stage-2 walk with allocation failed"))?;
            if pte.is_accessed() {
                error!("{:?} is already mapped to {:?}", page_ipa, pte.paddr());
                return ax_err!(AlreadyExists, "stage-2 page is already mapped");
            }
            *pte = Stage2Pte::new_page(hpa + off, attr);
        }
        Ok(())
    }

    /// Unmaps `[ipa, ipa + size)` and returns every mapped frame to the allocator.
    pub fn unmap(&mut self, ipa: GuestPhysAddr, size: usize) -> AxResult {
        if !is_aligned_4k(ipa.as_usize()) || !is_aligned_4k(size) {
            return ax_err!(
                InvalidInput,
                "stage-2 unmapping requires page aligned address and size"
            );
        }

        for off in (0..size).step_by(PAGE_SIZE_4K) {
            let page_ipa = ipa + off;
            match self.walk(page_ipa, false)? {
                Some(pte) if pte.bits() != 0 => {
                    H::free_page(pte.paddr());
                    pte.clear();
                }
                _ => {
                    error!("{:?} is not mapped", page_ipa);
                    return ax_err!(NotFound, "stage-2 page is already unmapped");
                }
            }
        }
        Ok(())
    }

    /// Host physical address backing `ipa`, if mapped.
    pub fn translate(&mut self, ipa: GuestPhysAddr) -> Option<HostPhysAddr> {
        let offset = ipa.as_usize() & (PAGE_SIZE_4K - 1);
        match self.walk(ipa, false) {
            Ok(Some(pte)) if pte.is_valid() => Some(pte.paddr() + offset),
            _ => None,
        }
    }

    /// Copies `data` into guest memory starting at `ipa`. Every touched page must
    /// already be mapped.
    pub fn copy_to_guest(&mut self, ipa: GuestPhysAddr, data: &[u8]) -> AxResult {
        let mut copied = 0;
        while copied < data.len() {
            let cur = ipa + copied;
            let hpa = self.translate(cur).ok_or_else(|| {
                ax_err_type!(NotFound, "copy to unmapped guest physical memory")
            })?;
            let in_page = PAGE_SIZE_4K - (cur.as_usize() & (PAGE_SIZE_4K - 1));
            let len = in_page.min(data.len() - copied);
            // SAFETY: `hpa..hpa + len` stays inside one frame owned by this guest.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[copied..].as_ptr(),
                    H::phys_to_virt(hpa).as_mut_ptr(),
                    len,
                );
            }
            copied += len;
        }
        Ok(())
    }

    /// Every valid page descriptor together with the guest address it maps.
    pub fn leaf_entries(&self) -> Vec<(GuestPhysAddr, Stage2Pte)> {
        let mut leaves = Vec::new();
        self.collect_leaves(self.root, 0, 0, &mut leaves);
        leaves
    }

    fn collect_leaves(
        &self,
        table: HostPhysAddr,
        level: usize,
        base: usize,
        leaves: &mut Vec<(GuestPhysAddr, Stage2Pte)>,
    ) {
        let shift = 39 - level * 9;
        for (i, pte) in self.table_of(table).iter().enumerate() {
            if !pte.is_valid() {
                continue;
            }
            let ipa = base | (i << shift);
            if level == LEAF_LEVEL {
                leaves.push((GuestPhysAddr::from(ipa), *pte));
            } else if pte.is_table() {
                self.collect_leaves(pte.paddr(), level + 1, ipa, leaves);
            }
        }
    }
}
