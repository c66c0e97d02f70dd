//! The page table engine: walking, mapping, and tearing down the radix
//! tree of translation tables.
//!
//! Tables are ordinary page frames drawn from a [`FrameAllocator`] — never
//! heap objects — because teardown must hand every one of them back. All
//! access to table memory goes through the [`AddressTranslator`].

use core::ptr::NonNull;

use crate::addr::AddressTranslator;
use crate::arch::{self, EntryKind, PageEntry};
use crate::frames::{FrameAllocator, zero_frame};
use crate::{Fault, PhysAddr, Protection, VirtAddr};

/// One level of the translation hierarchy: an array of entries filling
/// exactly one page frame.
#[repr(C)]
pub struct PageTable {
    entries: [PageEntry; arch::ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == arch::PAGE_SIZE);

impl PageTable {
    /// Returns the entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    /// Returns the number of entries in the table.
    pub const fn len(&self) -> usize {
        arch::ENTRY_COUNT
    }
}

/// Translates a table's physical address into a dereferenceable pointer.
fn table_ptr(table: PhysAddr) -> *mut PageTable {
    AddressTranslator::current().phys_to_ptr(table.as_usize())
}

/// Allocates and zeroes one table frame.
fn alloc_table(frames: &mut dyn FrameAllocator) -> Result<PhysAddr, Fault> {
    let frame = frames.alloc_page().ok_or(Fault::OutOfMemory)?;
    zero_frame(frame);
    Ok(frame)
}

/// Descends the hierarchy from `root` to the leaf slot for `virt`.
///
/// With `create`, absent intermediate levels are allocated and installed;
/// without it, an absent level is `Fault::NotMapped`. A leaf entry at an
/// intermediate level (a block mapping this engine does not create) is
/// `Fault::Malformed`, never misread as a table pointer.
fn walk(
    root: PhysAddr,
    virt: VirtAddr,
    mut create: Option<&mut dyn FrameAllocator>,
) -> Result<NonNull<PageEntry>, Fault> {
    let mut table = root;
    for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
        let index = virt.page_index(level);
        // SAFETY: `table` is the root of a live hierarchy or was installed
        // by an earlier iteration; the translator makes it addressable.
        let entry = unsafe { (*table_ptr(table)).entry_mut(index) };
        table = match entry.kind(level) {
            EntryKind::Table(next) => next,
            EntryKind::Leaf(_) => return Err(Fault::Malformed),
            EntryKind::Empty => match create.as_deref_mut() {
                Some(frames) => {
                    let next = alloc_table(frames)?;
                    *entry = PageEntry::table(next);
                    next
                }
                None => return Err(Fault::NotMapped),
            },
        };
    }

    let index = virt.page_index(0);
    // SAFETY: As above.
    let entry = unsafe { (*table_ptr(table)).entry_mut(index) };
    Ok(NonNull::from(entry))
}

/// Frees every table frame and leaf frame reachable from `table`, whose
/// entries are interpreted at `level`.
fn free_subtree(table: PhysAddr, level: usize, frames: &mut dyn FrameAllocator) {
    for index in 0..arch::ENTRY_COUNT {
        // SAFETY: The subtree is owned by the caller and no longer live.
        let entry = unsafe { (*table_ptr(table)).entry(index) };
        match entry.kind(level) {
            EntryKind::Empty => {}
            EntryKind::Table(next) => {
                free_subtree(next, level - 1, frames);
                frames.free_page(next);
            }
            EntryKind::Leaf(frame) => frames.free_page(frame),
        }
    }
}

/// A translation hierarchy rooted at one top-level table.
///
/// The engine does not own frame lifetimes beyond the tables themselves:
/// `unmap_one` reports which frame was mapped and the caller decides
/// whether to free it.
pub struct PageTables {
    root: PhysAddr,
}

impl PageTables {
    /// Allocates an empty hierarchy: one zeroed root table.
    pub fn new(frames: &mut dyn FrameAllocator) -> Result<Self, Fault> {
        let root = alloc_table(frames)?;
        Ok(Self { root })
    }

    /// Wraps an existing root table.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a live, well-formed root
    /// table, and the caller must not create aliasing mutable hierarchies.
    pub unsafe fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    /// Returns the physical address of the root table.
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Returns the raw word of the root entry at `index` (diagnostics).
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn root_entry_raw(&self, index: usize) -> usize {
        // SAFETY: The root is live for as long as `self` exists.
        unsafe { (*table_ptr(self.root)).entry(index).raw() }
    }

    /// Copies the kernel (upper) half of `kernel`'s root table into this
    /// root, entry by entry.
    ///
    /// This aliases the kernel's intermediate tables rather than copying
    /// them: there is exactly one set of kernel page tables, referenced
    /// from every address space.
    pub(crate) fn copy_kernel_half_from(&mut self, kernel: &PageTables) {
        for index in arch::ENTRY_COUNT / 2..arch::ENTRY_COUNT {
            let raw = kernel.root_entry_raw(index);
            // SAFETY: Both roots are live; the ranges do not overlap.
            unsafe {
                *(*table_ptr(self.root)).entry_mut(index) = PageEntry::from_raw(raw);
            }
        }
    }

    /// Maps the page at `virt` to the frame at `phys`.
    ///
    /// Fails with [`Fault::AlreadyMapped`] if the page is occupied; the
    /// existing mapping is never overwritten ("map" is not "remap").
    ///
    /// # Panics
    ///
    /// Panics if `virt` or `phys` is not page-aligned.
    pub fn map_one(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        prot: Protection,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), Fault> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );
        assert!(
            phys.is_aligned(arch::PAGE_SIZE),
            "physical address must be page-aligned"
        );

        let slot = walk(self.root, virt, Some(frames))?;
        // SAFETY: `walk` returns a slot inside a live table.
        let entry = unsafe { &mut *slot.as_ptr() };
        if entry.is_present() {
            return Err(Fault::AlreadyMapped);
        }
        *entry = PageEntry::leaf(phys, prot);
        arch::flush_tlb_page(virt);
        Ok(())
    }

    /// Unmaps the page at `virt`, returning the frame it mapped.
    ///
    /// # Panics
    ///
    /// Panics if `virt` is not page-aligned.
    pub fn unmap_one(&mut self, virt: VirtAddr) -> Result<PhysAddr, Fault> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );

        let slot = walk(self.root, virt, None)?;
        // SAFETY: `walk` returns a slot inside a live table.
        let entry = unsafe { &mut *slot.as_ptr() };
        let phys = entry.phys().ok_or(Fault::NotMapped)?;
        entry.clear();
        arch::flush_tlb_page(virt);
        Ok(phys)
    }

    /// Translates `virt` to its physical address, including the page
    /// offset, or `None` if not mapped.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let slot = walk(self.root, virt, None).ok()?;
        // SAFETY: `walk` returns a slot inside a live table.
        let entry = unsafe { *slot.as_ptr() };
        let frame = entry.phys()?;
        Some(PhysAddr::new(frame.as_usize() | virt.page_offset()))
    }

    /// Maps `size` bytes from `virt` to `phys`, page by page in increasing
    /// address order.
    ///
    /// All-or-nothing: on the first failure everything this call already
    /// mapped is unmapped again (in the same increasing order), so a failed
    /// call leaves no partial mapping behind — including when the very
    /// first page fails and there is nothing to roll back.
    pub fn map_range(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        size: usize,
        prot: Protection,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), Fault> {
        let virt = virt.align_down(arch::PAGE_SIZE);
        let phys = phys.align_down(arch::PAGE_SIZE);
        let size = (size + arch::PAGE_SIZE - 1) & !(arch::PAGE_SIZE - 1);

        let mut offset = 0;
        while offset < size {
            if let Err(fault) = self.map_one(virt + offset, phys + offset, prot, frames) {
                if offset > 0 {
                    self.unmap_range(virt, offset)
                        .expect("rollback over a freshly mapped prefix");
                }
                return Err(fault);
            }
            offset += arch::PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmaps `size` bytes from `virt`, page by page in increasing address
    /// order.
    ///
    /// Strict: an unmapped page in the range is an error, reported rather
    /// than skipped. Pages before it are left unmapped.
    pub fn unmap_range(&mut self, virt: VirtAddr, size: usize) -> Result<(), Fault> {
        let virt = virt.align_down(arch::PAGE_SIZE);
        let size = (size + arch::PAGE_SIZE - 1) & !(arch::PAGE_SIZE - 1);

        let mut offset = 0;
        while offset < size {
            self.unmap_one(virt + offset)?;
            offset += arch::PAGE_SIZE;
        }
        Ok(())
    }

    /// Frees the entire user (lower) half: every intermediate table frame
    /// at every level and every still-mapped leaf frame go back to the
    /// allocator, and the root's user entries are cleared.
    ///
    /// The hierarchy must not be the active one.
    pub(crate) fn release_user_half(&mut self, frames: &mut dyn FrameAllocator) {
        let top = arch::PAGE_TABLE_LEVELS - 1;
        for index in 0..arch::ENTRY_COUNT / 2 {
            // SAFETY: The root is live and owned by `self`.
            let entry = unsafe { (*table_ptr(self.root)).entry(index) };
            match entry.kind(top) {
                EntryKind::Empty => continue,
                EntryKind::Table(next) => {
                    free_subtree(next, top - 1, frames);
                    frames.free_page(next);
                }
                EntryKind::Leaf(frame) => frames.free_page(frame),
            }
            // SAFETY: As above.
            unsafe { (*table_ptr(self.root)).entry_mut(index).clear() };
        }
        arch::flush_tlb_all();
    }
}

/// Resolves `virt` through the currently loaded root, the way the hardware
/// walker would: consulting the emulated TLB first and filling it on a
/// miss. Emulation builds only.
#[cfg(any(test, feature = "software-emulation"))]
pub fn probe_current(virt: VirtAddr) -> Option<PhysAddr> {
    let root = arch::current_root()?;
    let page = virt.as_usize() / arch::PAGE_SIZE;
    if let Some(frame) = arch::tlb_lookup(root, page) {
        return Some(PhysAddr::new(frame | virt.page_offset()));
    }
    // SAFETY: The loaded root is live by the `load_root` contract.
    let tables = unsafe { PageTables::from_root(root) };
    let phys = tables.translate(virt)?;
    arch::tlb_fill(root, page, phys.align_down(arch::PAGE_SIZE).as_usize());
    Some(phys)
}

/// Reads a value through the currently loaded root. Emulation builds only.
#[cfg(any(test, feature = "software-emulation"))]
pub fn read_current<T: Copy>(virt: VirtAddr) -> Option<T> {
    let phys = probe_current(virt)?;
    let ptr = AddressTranslator::current().phys_to_ptr::<T>(phys.as_usize());
    // SAFETY: The translation came from a live mapping; the emulated
    // buffer gives no alignment guarantees, so read unaligned.
    Some(unsafe { core::ptr::read_unaligned(ptr) })
}

/// Writes a value through the currently loaded root. Emulation builds only.
#[cfg(any(test, feature = "software-emulation"))]
pub fn write_current<T>(virt: VirtAddr, value: T) -> Result<(), Fault> {
    let phys = probe_current(virt).ok_or(Fault::NotMapped)?;
    let ptr = AddressTranslator::current().phys_to_ptr::<T>(phys.as_usize());
    // SAFETY: As in `read_current`.
    unsafe { core::ptr::write_unaligned(ptr, value) };
    Ok(())
}
