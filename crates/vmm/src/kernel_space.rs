//! The kernel's own address space, built once at boot.
//!
//! Bootstrap runs before any process exists: configure the memory
//! attribute registers, cover RAM with an identity map (the code enabling
//! translation must already be mapped when it flips the switch) and with
//! the direct map at the given upper-half offset, map the device MMIO
//! windows as device memory, and only then load the root and enable
//! translation. Nothing here is recoverable: a failure during bootstrap is
//! a failure to have a kernel, and panics.
//!
//! The resulting [`KernelSpace`] is an explicitly owned object — the boot
//! sequence holds it and lends it to every address space constructor. It
//! is deliberately not a hidden global, so tests can build independent
//! kernel-table fixtures.

use crate::frames::FrameAllocator;
use crate::paging::PageTables;
use crate::{Fault, PhysAddr, Protection, VirtAddr, arch};

/// A contiguous range of physical memory handed over by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: PhysAddr,
    size: usize,
}

impl MemoryRegion {
    /// Creates a region covering `[base, base + size)`.
    pub const fn new(base: PhysAddr, size: usize) -> Self {
        Self { base, size }
    }

    /// Returns the base address of the region.
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// Returns the size of the region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// The physical memory layout the kernel maps at boot: normal RAM plus
/// device MMIO windows.
pub struct BootMap<'a> {
    /// Usable RAM, mapped cacheable.
    pub normal: &'a [MemoryRegion],
    /// Device MMIO windows, mapped non-cacheable and never executable.
    pub device: &'a [MemoryRegion],
}

/// The kernel's address space: the one set of kernel page tables that
/// every process's upper half aliases.
pub struct KernelSpace {
    tables: PageTables,
    direct_map_offset: usize,
}

impl KernelSpace {
    /// Builds the kernel mappings. Fatal on any failure.
    ///
    /// # Panics
    ///
    /// Panics if the frame allocator runs dry or a mapping conflicts;
    /// there is no fallback path at this point in boot.
    pub fn bootstrap(
        map: &BootMap<'_>,
        direct_map_offset: usize,
        frames: &mut dyn FrameAllocator,
    ) -> Self {
        arch::configure_attributes();

        let mut tables = match PageTables::new(frames) {
            Ok(tables) => tables,
            Err(fault) => panic!("failed to allocate the kernel root table: {fault}"),
        };

        for region in map.normal {
            Self::map_window(
                &mut tables,
                region,
                direct_map_offset,
                Protection::WRITE | Protection::EXEC,
                frames,
            );
        }
        for window in map.device {
            Self::map_window(
                &mut tables,
                window,
                direct_map_offset,
                Protection::WRITE | Protection::DEVICE,
                frames,
            );
        }

        log::info!(
            "kernel space ready: {} RAM regions, {} device windows, direct map at {:#x}",
            map.normal.len(),
            map.device.len(),
            direct_map_offset,
        );

        Self {
            tables,
            direct_map_offset,
        }
    }

    /// Maps one physical window both 1:1 and at the direct-map offset.
    fn map_window(
        tables: &mut PageTables,
        region: &MemoryRegion,
        direct_map_offset: usize,
        prot: Protection,
        frames: &mut dyn FrameAllocator,
    ) {
        let identity = VirtAddr::new(region.base().as_usize());
        if let Err(fault) = tables.map_range(identity, region.base(), region.size(), prot, frames) {
            log::error!("identity mapping of {region:?} failed: {fault}");
            panic!("kernel bootstrap mapping failed: {fault}");
        }

        let direct = VirtAddr::new(direct_map_offset + region.base().as_usize());
        if let Err(fault) = tables.map_range(direct, region.base(), region.size(), prot, frames) {
            log::error!("direct mapping of {region:?} failed: {fault}");
            panic!("kernel bootstrap mapping failed: {fault}");
        }
    }

    /// Loads the kernel root and turns translation on.
    ///
    /// # Safety
    ///
    /// One-time boot operation. The identity mapping built by `bootstrap`
    /// must cover the currently executing code, and nothing may rely on
    /// mappings outside the boot map from this point on.
    pub unsafe fn install(&self) {
        // SAFETY: Upheld by the caller; bootstrap covered RAM 1:1.
        unsafe {
            arch::load_root(self.tables.root());
            arch::enable_translation();
        }
        arch::flush_tlb_all();
        log::info!("translation enabled, kernel root {}", self.tables.root());
    }

    /// Returns the physical address of the kernel root table.
    pub fn root(&self) -> PhysAddr {
        self.tables.root()
    }

    /// Returns the direct-map offset chosen at bootstrap.
    pub const fn direct_map_offset(&self) -> usize {
        self.direct_map_offset
    }

    /// Returns the raw word of the root entry at `index` (diagnostics).
    pub fn root_entry_raw(&self, index: usize) -> usize {
        self.tables.root_entry_raw(index)
    }

    /// Translates a kernel virtual address, or `None` if not mapped.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.tables.translate(virt)
    }

    /// Maps one additional page into the kernel space after boot.
    ///
    /// Only the boot path mutates kernel mappings, and only before
    /// multitasking begins; the shared upper half is read-only afterwards.
    pub fn map_one(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        prot: Protection,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), Fault> {
        self.tables.map_one(virt, phys, prot, frames)
    }

    pub(crate) fn tables(&self) -> &PageTables {
        &self.tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AddressTranslator;
    use crate::arch::{EntryKind, PageEntry};
    use crate::frames::EmulatedFrames;
    use crate::paging::PageTable;

    fn setup() -> EmulatedFrames {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        }
        EmulatedFrames::new()
    }

    fn offset() -> usize {
        arch::canonicalize_virtual(arch::USER_SPACE_END)
    }

    /// Walks to the leaf entry for `virt` by hand.
    fn leaf_entry(root: PhysAddr, virt: VirtAddr) -> Option<PageEntry> {
        let translator = AddressTranslator::current();
        let mut table = root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = unsafe {
                (*translator.phys_to_ptr::<PageTable>(table.as_usize())).entry(virt.page_index(level))
            };
            match entry.kind(level) {
                EntryKind::Table(next) => table = next,
                _ => return None,
            }
        }
        let entry = unsafe {
            (*translator.phys_to_ptr::<PageTable>(table.as_usize())).entry(virt.page_index(0))
        };
        entry.is_present().then_some(entry)
    }

    #[test]
    fn ram_is_identity_and_direct_mapped() {
        let mut frames = setup();
        let map = BootMap {
            normal: &[MemoryRegion::new(PhysAddr::new(0), 4 * arch::PAGE_SIZE)],
            device: &[],
        };
        let kernel = KernelSpace::bootstrap(&map, offset(), &mut frames);

        for n in 0..4 {
            let phys = PhysAddr::new(n * arch::PAGE_SIZE);
            let identity = VirtAddr::new(phys.as_usize());
            let direct = VirtAddr::new(offset() + phys.as_usize());
            assert_eq!(kernel.translate(identity), Some(phys));
            assert_eq!(kernel.translate(direct), Some(phys));
        }
        assert_eq!(
            kernel.translate(VirtAddr::new(4 * arch::PAGE_SIZE)),
            None
        );
    }

    #[test]
    fn device_windows_are_clamped() {
        let mut frames = setup();
        let window = MemoryRegion::new(PhysAddr::new(8 * arch::PAGE_SIZE), arch::PAGE_SIZE);
        let map = BootMap {
            normal: &[MemoryRegion::new(PhysAddr::new(0), arch::PAGE_SIZE)],
            device: &[window],
        };
        let kernel = KernelSpace::bootstrap(&map, offset(), &mut frames);

        let virt = VirtAddr::new(window.base().as_usize());
        let entry = leaf_entry(kernel.root(), virt).expect("device window should be mapped");
        assert!(entry.is_device());
        assert!(entry.is_no_execute());
        assert!(entry.is_writable());
        assert!(!entry.is_user());

        // Normal RAM stays cacheable and executable for the kernel image.
        let ram = leaf_entry(kernel.root(), VirtAddr::new(0)).expect("ram should be mapped");
        assert!(!ram.is_device());
        assert!(!ram.is_no_execute());
    }

    #[test]
    fn install_loads_the_kernel_root() {
        let mut frames = setup();
        let map = BootMap {
            normal: &[MemoryRegion::new(PhysAddr::new(0), arch::PAGE_SIZE)],
            device: &[],
        };
        let kernel = KernelSpace::bootstrap(&map, offset(), &mut frames);

        let before = arch::activation_count();
        // SAFETY: Software model; nothing actually switches.
        unsafe { kernel.install() };
        assert_eq!(arch::current_root(), Some(kernel.root()));
        assert_eq!(arch::activation_count(), before + 1);
    }
}
