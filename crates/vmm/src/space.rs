//! Per-process address spaces.
//!
//! An [`AddressSpace`] owns the user (lower) half of one translation
//! hierarchy plus the VMA records describing it. The kernel (upper) half is
//! aliased from the kernel's root table at creation time and is never
//! mutated through a process root.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::frames::{FrameAllocator, zero_frame};
use crate::kernel_space::KernelSpace;
use crate::paging::PageTables;
use crate::{Fault, PhysAddr, Protection, VirtAddr, Vma, arch};

/// An address space shared by the threads of one process.
///
/// The last owner to drop its reference triggers teardown via
/// [`AddressSpace::release`].
pub type SharedSpace = Arc<Mutex<AddressSpace>>;

/// One process's virtual memory: a translation hierarchy and the list of
/// mapped user areas.
pub struct AddressSpace {
    tables: PageTables,
    vmas: Vec<Vma>,
}

impl AddressSpace {
    /// Creates a fresh address space: an empty user half and the kernel's
    /// upper half aliased in, so kernel code and data stay visible whatever
    /// space is active.
    pub fn new(kernel: &KernelSpace, frames: &mut dyn FrameAllocator) -> Result<Self, Fault> {
        let mut tables = PageTables::new(frames)?;
        tables.copy_kernel_half_from(kernel.tables());
        Ok(Self {
            tables,
            vmas: Vec::new(),
        })
    }

    /// Wraps the space for sharing between threads.
    pub fn into_shared(self) -> SharedSpace {
        Arc::new(Mutex::new(self))
    }

    /// Returns the physical address of the root table.
    pub fn root(&self) -> PhysAddr {
        self.tables.root()
    }

    /// Returns the raw word of the root entry at `index` (diagnostics).
    pub fn root_entry_raw(&self, index: usize) -> usize {
        self.tables.root_entry_raw(index)
    }

    /// Returns the mapped user areas.
    pub fn vmas(&self) -> &[Vma] {
        &self.vmas
    }

    /// Maps `size` bytes of fresh, zeroed memory at `virt` for user mode.
    ///
    /// Registers one VMA covering the page-aligned span, then backs every
    /// page with a frame from the allocator. `USER` is implied. On any
    /// failure the call unwinds completely: every frame it allocated is
    /// freed, every page it mapped is unmapped, and the VMA is dropped.
    pub fn map_user_range(
        &mut self,
        virt: VirtAddr,
        size: usize,
        prot: Protection,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), Fault> {
        if size == 0 {
            return Ok(());
        }

        let start = virt.align_down(arch::PAGE_SIZE);
        let end = (virt.as_usize() + size + arch::PAGE_SIZE - 1) & !(arch::PAGE_SIZE - 1);
        if end > arch::USER_SPACE_END {
            return Err(Fault::InvalidAddress);
        }

        let vma = Vma::new(start, end - start.as_usize(), prot | Protection::USER);
        if self.vmas.iter().any(|existing| existing.overlaps(&vma)) {
            return Err(Fault::AlreadyMapped);
        }

        let prot = prot | Protection::USER;
        let mut mapped = 0;
        for page in vma.pages() {
            let result = match frames.alloc_page() {
                None => Err(Fault::OutOfMemory),
                Some(frame) => {
                    zero_frame(frame);
                    match self.tables.map_one(page, frame, prot, frames) {
                        Ok(()) => Ok(()),
                        Err(fault) => {
                            frames.free_page(frame);
                            Err(fault)
                        }
                    }
                }
            };

            if let Err(fault) = result {
                // Unwind this call's work: unmap and free the prefix.
                for unwind in vma.pages().take(mapped) {
                    let frame = self
                        .tables
                        .unmap_one(unwind)
                        .expect("rollback over a freshly mapped prefix");
                    frames.free_page(frame);
                }
                return Err(fault);
            }
            mapped += 1;
        }

        self.vmas.push(vma);
        Ok(())
    }

    /// Returns the VMA containing `addr`, if any. Linear scan.
    pub fn find_vma(&self, addr: VirtAddr) -> Option<&Vma> {
        self.vmas.iter().find(|vma| vma.contains(addr))
    }

    /// Translates `addr` through this space's tables.
    pub fn translate(&self, addr: VirtAddr) -> Option<PhysAddr> {
        self.tables.translate(addr)
    }

    /// Makes this the active address space: loads the root table and
    /// flushes the TLB.
    ///
    /// Safe by construction: every space carries the kernel upper half from
    /// birth, so kernel code keeps executing across the switch.
    pub fn activate(&self) {
        // SAFETY: The root is live and maps the kernel half.
        unsafe { arch::load_root(self.tables.root()) };
        arch::flush_tlb_all();
    }

    /// Destroys the space, returning every user-half table frame, every
    /// mapped user frame, and the root frame to the allocator.
    ///
    /// The space must not be the active one. Consuming `self` is what makes
    /// use-after-destroy unrepresentable.
    pub fn destroy(mut self, frames: &mut dyn FrameAllocator) {
        self.tables.release_user_half(frames);
        frames.free_page(self.tables.root());
        log::debug!("address space destroyed ({} vmas)", self.vmas.len());
    }

    /// Drops one reference to a shared space, tearing it down if this was
    /// the last owner.
    pub fn release(shared: SharedSpace, frames: &mut dyn FrameAllocator) {
        if let Ok(mutex) = Arc::try_unwrap(shared) {
            mutex.into_inner().destroy(frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AddressTranslator;
    use crate::frames::EmulatedFrames;
    use crate::kernel_space::{BootMap, MemoryRegion};
    use crate::paging::{read_current, write_current};

    fn setup() -> (KernelSpace, EmulatedFrames) {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        }
        let mut frames = EmulatedFrames::new();
        let map = BootMap {
            normal: &[MemoryRegion::new(PhysAddr::new(0), 4 * arch::PAGE_SIZE)],
            device: &[],
        };
        let kernel = KernelSpace::bootstrap(&map, direct_map_offset(), &mut frames);
        (kernel, frames)
    }

    fn direct_map_offset() -> usize {
        arch::canonicalize_virtual(arch::USER_SPACE_END)
    }

    fn user_page(n: usize) -> VirtAddr {
        VirtAddr::new(n * arch::PAGE_SIZE)
    }

    #[test]
    fn upper_half_matches_kernel_at_creation() {
        let (kernel, mut frames) = setup();
        let space = AddressSpace::new(&kernel, &mut frames).unwrap();

        for index in arch::ENTRY_COUNT / 2..arch::ENTRY_COUNT {
            assert_eq!(
                space.root_entry_raw(index),
                kernel.root_entry_raw(index),
                "kernel half diverges at entry {index}"
            );
        }
        // The user half starts empty.
        for index in 0..arch::ENTRY_COUNT / 2 {
            assert_eq!(space.root_entry_raw(index), 0);
        }
    }

    #[test]
    fn upper_half_survives_user_mutations() {
        let (kernel, mut frames) = setup();
        let mut space = AddressSpace::new(&kernel, &mut frames).unwrap();

        space
            .map_user_range(
                user_page(4),
                2 * arch::PAGE_SIZE,
                Protection::WRITE,
                &mut frames,
            )
            .unwrap();

        for index in arch::ENTRY_COUNT / 2..arch::ENTRY_COUNT {
            assert_eq!(space.root_entry_raw(index), kernel.root_entry_raw(index));
        }
    }

    #[test]
    fn map_user_range_scenario() {
        let (kernel, mut frames) = setup();
        let mut space = AddressSpace::new(&kernel, &mut frames).unwrap();
        let base = user_page(16);

        space
            .map_user_range(base, arch::PAGE_SIZE, Protection::WRITE, &mut frames)
            .unwrap();

        let frame = space.translate(base).expect("page should be mapped");
        assert!(frame.is_aligned(arch::PAGE_SIZE));

        space.activate();
        write_current::<u32>(base, 0xDEAD_BEEF).unwrap();
        assert_eq!(read_current::<u32>(base), Some(0xDEAD_BEEF));

        // Overlapping registration fails as a whole.
        let overlap = space.map_user_range(base, arch::PAGE_SIZE, Protection::WRITE, &mut frames);
        assert_eq!(overlap, Err(Fault::AlreadyMapped));
    }

    #[test]
    fn map_user_range_rejects_kernel_addresses() {
        let (kernel, mut frames) = setup();
        let mut space = AddressSpace::new(&kernel, &mut frames).unwrap();

        // The last user page is fine; one past it is not.
        let last = VirtAddr::new(arch::USER_SPACE_END - arch::PAGE_SIZE);
        assert_eq!(
            space.map_user_range(last, 2 * arch::PAGE_SIZE, Protection::WRITE, &mut frames),
            Err(Fault::InvalidAddress)
        );
        assert_eq!(
            space.map_user_range(last, arch::PAGE_SIZE, Protection::WRITE, &mut frames),
            Ok(())
        );
    }

    #[test]
    fn map_user_range_unwinds_on_exhaustion() {
        let (kernel, mut frames) = setup();
        let mut space = AddressSpace::new(&kernel, &mut frames).unwrap();
        let before = frames.outstanding();

        // Enough budget for the first page's tables and frame, not the rest.
        frames.fail_after(3);
        let result = space.map_user_range(
            user_page(0),
            4 * arch::PAGE_SIZE,
            Protection::WRITE,
            &mut frames,
        );
        assert_eq!(result, Err(Fault::OutOfMemory));

        for n in 0..4 {
            assert_eq!(space.translate(user_page(n)), None);
        }
        assert!(space.vmas().is_empty());
        assert!(space.find_vma(user_page(0)).is_none());
        // Leaf frames came back; only intermediate tables may remain.
        assert!(frames.outstanding() <= before + 2);
    }

    #[test]
    fn find_vma_scans_linearly() {
        let (kernel, mut frames) = setup();
        let mut space = AddressSpace::new(&kernel, &mut frames).unwrap();

        space
            .map_user_range(user_page(2), arch::PAGE_SIZE, Protection::WRITE, &mut frames)
            .unwrap();
        space
            .map_user_range(
                user_page(8),
                2 * arch::PAGE_SIZE,
                Protection::WRITE | Protection::EXEC,
                &mut frames,
            )
            .unwrap();

        let hit = space.find_vma(user_page(9)).expect("vma should exist");
        assert_eq!(hit.start(), user_page(8));
        assert_eq!(hit.len(), 2 * arch::PAGE_SIZE);
        assert!(hit.prot().contains(Protection::USER));
        assert!(space.find_vma(user_page(4)).is_none());
    }

    #[test]
    fn destroy_returns_every_frame_to_the_allocator() {
        let (kernel, mut frames) = setup();
        let baseline = frames.outstanding();

        let mut space = AddressSpace::new(&kernel, &mut frames).unwrap();
        space
            .map_user_range(
                user_page(0),
                3 * arch::PAGE_SIZE,
                Protection::WRITE,
                &mut frames,
            )
            .unwrap();
        space
            .map_user_range(user_page(32), arch::PAGE_SIZE, Protection::WRITE, &mut frames)
            .unwrap();
        assert!(frames.outstanding() > baseline);

        space.destroy(&mut frames);
        assert_eq!(frames.outstanding(), baseline);
    }

    #[test]
    fn two_spaces_are_isolated_at_the_same_address() {
        let (kernel, mut frames) = setup();
        let addr = user_page(20);

        let mut a = AddressSpace::new(&kernel, &mut frames).unwrap();
        let mut b = AddressSpace::new(&kernel, &mut frames).unwrap();
        a.map_user_range(addr, arch::PAGE_SIZE, Protection::WRITE, &mut frames)
            .unwrap();
        b.map_user_range(addr, arch::PAGE_SIZE, Protection::WRITE, &mut frames)
            .unwrap();
        assert_ne!(a.translate(addr), b.translate(addr));

        a.activate();
        write_current::<u32>(addr, 0xAAAA_1111).unwrap();
        b.activate();
        write_current::<u32>(addr, 0xBBBB_2222).unwrap();

        a.activate();
        assert_eq!(read_current::<u32>(addr), Some(0xAAAA_1111));
        b.activate();
        assert_eq!(read_current::<u32>(addr), Some(0xBBBB_2222));
    }

    #[test]
    fn activation_succeeds_only_for_the_active_space() {
        let (kernel, mut frames) = setup();
        let addr = user_page(24);

        let mut a = AddressSpace::new(&kernel, &mut frames).unwrap();
        let b = AddressSpace::new(&kernel, &mut frames).unwrap();
        a.map_user_range(addr, arch::PAGE_SIZE, Protection::WRITE, &mut frames)
            .unwrap();

        a.activate();
        assert!(read_current::<u32>(addr).is_some());
        b.activate();
        // The same virtual address resolves to nothing in B.
        assert_eq!(read_current::<u32>(addr), None);
    }

    #[test]
    fn release_tears_down_only_the_last_reference() {
        let (kernel, mut frames) = setup();
        let baseline = frames.outstanding();

        let space = AddressSpace::new(&kernel, &mut frames).unwrap().into_shared();
        let second = Arc::clone(&space);

        AddressSpace::release(space, &mut frames);
        // Still alive: `second` holds it.
        assert!(frames.outstanding() > baseline);

        AddressSpace::release(second, &mut frames);
        assert_eq!(frames.outstanding(), baseline);
    }
}
