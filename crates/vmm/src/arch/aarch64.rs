//! AArch64 (EL1, 4KB granule, 48-bit VA) implementation of the
//! architecture surface.
//!
//! Descriptor bits follow the VMSAv8-64 long format: VALID/TABLE, MAIR
//! attribute index, shareability, AP bits, access flag, and the split
//! UXN/PXN execute-never bits that carry the user/kernel execute policy.

use core::arch::asm;

use crate::{PhysAddr, Protection, VirtAddr};

use super::EntryKind;

/// Page size in bytes (4 KiB granule).
pub const PAGE_SIZE: usize = 4096;

/// Number of translation table levels.
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Entries per translation table. One table occupies exactly one page.
pub const ENTRY_COUNT: usize = 512;

/// Maximum physical address width in bits.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum virtual address width in bits.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// First address past the user (lower) half.
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// Where user stacks top out (exclusive).
pub const USER_STACK_TOP: usize = 0x0000_7FFF_FFFF_E000;

/// Returns the translation table index of `address` at `level`.
///
/// Level 0 is the deepest level (the one holding page descriptors); each
/// level uses 9 bits of the address.
///
/// # Panics
///
/// Panics if `level` is out of range.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range");
    let shift = 12 + level * 9;
    (address >> shift) & (ENTRY_COUNT - 1)
}

/// Validates a physical address against the maximum physical width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates that a virtual address is canonical (bits 48-63 sign-extended
/// from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Sign-extends bit 47 through the upper bits.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if addr & (1 << (MAX_VIRTUAL_BITS - 1)) != 0 {
        addr | !((1 << MAX_VIRTUAL_BITS) - 1)
    } else {
        addr & ((1 << MAX_VIRTUAL_BITS) - 1)
    }
}

/// An AArch64 translation table descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const VALID: usize = 1 << 0;
    /// Table descriptor at levels above 0; page descriptor at level 0.
    const TABLE: usize = 1 << 1;

    /// MAIR attribute index field (bits 4:2).
    const ATTR_NORMAL: usize = 0 << 2;
    const ATTR_DEVICE: usize = 1 << 2;

    /// EL0 access (AP[1]).
    const USER: usize = 1 << 6;
    /// Read-only (AP[2]).
    const READ_ONLY: usize = 1 << 7;

    /// Shareability (bits 9:8).
    const SH_NONE: usize = 0 << 8;
    const SH_INNER: usize = 3 << 8;

    /// Access flag; set up front so no access-flag faults are taken.
    const ACCESS: usize = 1 << 10;

    /// Privileged execute never.
    const PXN: usize = 1 << 53;
    /// Unprivileged execute never.
    const UXN: usize = 1 << 54;

    const ADDRESS_MASK: usize = 0x0000_FFFF_FFFF_F000;

    /// An absent descriptor.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A table descriptor pointing at the next level.
    pub fn table(next: PhysAddr) -> Self {
        debug_assert!(next.is_aligned(PAGE_SIZE));
        Self((next.as_usize() & Self::ADDRESS_MASK) | Self::VALID | Self::TABLE)
    }

    /// A page descriptor mapping `frame` with the given protection.
    ///
    /// Device mappings are clamped: device MAIR index, outer-shareable off,
    /// and both execute-never bits, whatever the caller asked for. Normal
    /// mappings get exactly one execute side: user mappings are always PXN,
    /// kernel mappings always UXN.
    pub fn leaf(frame: PhysAddr, prot: Protection) -> Self {
        debug_assert!(frame.is_aligned(PAGE_SIZE));
        let mut bits =
            (frame.as_usize() & Self::ADDRESS_MASK) | Self::VALID | Self::TABLE | Self::ACCESS;

        if prot.is_device() {
            bits |= Self::ATTR_DEVICE | Self::SH_NONE | Self::UXN | Self::PXN;
        } else {
            bits |= Self::ATTR_NORMAL | Self::SH_INNER;
            if prot.is_user() {
                bits |= Self::PXN;
                if !prot.contains(Protection::EXEC) {
                    bits |= Self::UXN;
                }
            } else {
                bits |= Self::UXN;
                if !prot.contains(Protection::EXEC) {
                    bits |= Self::PXN;
                }
            }
        }

        if prot.is_user() {
            bits |= Self::USER;
        }
        if !prot.contains(Protection::WRITE) {
            bits |= Self::READ_ONLY;
        }

        Self(bits)
    }

    /// Decodes the descriptor as seen at `level`.
    ///
    /// Bit 1 means "table" above level 0 and "page" at level 0; a valid
    /// descriptor with bit 1 clear above level 0 is a block mapping, which
    /// decodes as a leaf and is rejected by the engine during walks.
    pub fn kind(self, level: usize) -> EntryKind {
        if !self.is_present() {
            return EntryKind::Empty;
        }
        let phys = PhysAddr::new(self.0 & Self::ADDRESS_MASK);
        if level > 0 && self.0 & Self::TABLE != 0 {
            EntryKind::Table(phys)
        } else {
            EntryKind::Leaf(phys)
        }
    }

    /// Returns whether the descriptor is valid.
    pub const fn is_present(self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Returns the physical address stored in a valid descriptor.
    pub fn phys(self) -> Option<PhysAddr> {
        if self.is_present() {
            Some(PhysAddr::new(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    /// Clears the descriptor.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw descriptor word.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Rebuilds a descriptor from a raw word.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self::empty()
    }
}

/// Programs MAIR_EL1 and TCR_EL1 for 4KB granules and 48-bit address
/// spaces on both TTBRs.
///
/// MAIR index 0 is normal write-back memory, index 1 is device nGnRnE,
/// index 2 is normal non-cacheable.
pub fn configure_attributes() {
    let mair: u64 = 0xFF | (0x44 << 16);

    let tcr: u64 = (16 << 0)        // T0SZ: 48-bit VA for TTBR0
        | (16 << 16)                // T1SZ: 48-bit VA for TTBR1
        | (0 << 14)                 // TG0: 4KB granule
        | (2 << 30)                 // TG1: 4KB granule
        | (1 << 8) | (1 << 10)      // IRGN0/ORGN0: write-back
        | (3 << 12)                 // SH0: inner shareable
        | (1 << 24) | (1 << 26)     // IRGN1/ORGN1: write-back
        | (3 << 28)                 // SH1: inner shareable
        | (5 << 32); // IPS: 48-bit output address

    unsafe {
        asm!(
            "msr mair_el1, {mair}",
            "msr tcr_el1, {tcr}",
            "isb",
            mair = in(reg) mair,
            tcr = in(reg) tcr,
            options(nostack, preserves_flags)
        );
    }
}

/// Loads `root` into TTBR0_EL1, switching the active address space.
///
/// # Safety
///
/// The caller must ensure the root table is live, maps the kernel, and maps
/// the currently executing code.
pub unsafe fn load_root(root: PhysAddr) {
    unsafe {
        asm!(
            "msr ttbr0_el1, {root}",
            "isb",
            root = in(reg) root.as_usize() as u64,
            options(nostack, preserves_flags)
        );
    }
}

/// Turns on the MMU together with the data and instruction caches.
///
/// # Safety
///
/// The active root must already cover the executing instruction stream
/// (identity or offset mapping); otherwise the next fetch faults with no
/// way back.
pub unsafe fn enable_translation() {
    unsafe {
        asm!(
            "dsb sy",
            "isb",
            "mrs {tmp}, sctlr_el1",
            "orr {tmp}, {tmp}, #0x1",    // M: MMU enable
            "orr {tmp}, {tmp}, #0x4",    // C: data cache
            "orr {tmp}, {tmp}, #0x1000", // I: instruction cache
            "msr sctlr_el1, {tmp}",
            "isb",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidates all stage-1 EL1 TLB entries.
pub fn flush_tlb_all() {
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags)
        );
    }
}

/// Invalidates TLB entries for the page containing `virt`.
pub fn flush_tlb_page(virt: VirtAddr) {
    let page = (virt.as_usize() >> 12) as u64;
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vale1is, {page}",
            "dsb ish",
            "isb",
            page = in(reg) page,
            options(nostack, preserves_flags)
        );
    }
}
