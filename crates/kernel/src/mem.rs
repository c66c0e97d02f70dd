//! Boot memory plumbing: Limine requests, the boot memory map, and the
//! early frame pool.

use limine::memory_map::{Entry, EntryType};
use limine::request::{ExecutableAddressRequest, HhdmRequest, MemoryMapRequest};
use vmm::{AddressTranslator, BootFrameAllocator, MemoryRegion, PhysAddr};

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HIGHER_HALF_DIRECT_MAP: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static EXECUTABLE_ADDRESS: ExecutableAddressRequest = ExecutableAddressRequest::new();

unsafe extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Maximum number of regions collected from the boot memory map.
pub const MAX_REGIONS: usize = 64;

/// Installs the direct-map translator at Limine's higher-half offset and
/// returns that offset.
pub fn init_translator() -> usize {
    let offset = HIGHER_HALF_DIRECT_MAP
        .get_response()
        .expect("higher-half direct map request should have been answered")
        .offset() as usize;
    AddressTranslator::set_current(AddressTranslator::hardware(offset));
    offset
}

fn entries() -> &'static [&'static Entry] {
    MEMORY_MAP_REQUEST
        .get_response()
        .expect("memory map request should have been answered")
        .entries()
}

/// Collects the boot memory map into normal and device regions.
///
/// Usable RAM, bootloader-reclaimable memory (the boot stack lives there),
/// and the kernel image region must all stay mapped across the switch to
/// our own tables; the framebuffer is the one device window the bootloader
/// hands us.
pub fn boot_map(
    normal: &mut [MemoryRegion; MAX_REGIONS],
    device: &mut [MemoryRegion; MAX_REGIONS],
) -> (usize, usize) {
    let mut normal_count = 0;
    let mut device_count = 0;
    for entry in entries() {
        let region = MemoryRegion::new(PhysAddr::new(entry.base as usize), entry.length as usize);
        match entry.entry_type {
            EntryType::USABLE
            | EntryType::BOOTLOADER_RECLAIMABLE
            | EntryType::EXECUTABLE_AND_MODULES => {
                if normal_count < MAX_REGIONS {
                    normal[normal_count] = region;
                    normal_count += 1;
                }
            }
            EntryType::FRAMEBUFFER => {
                if device_count < MAX_REGIONS {
                    device[device_count] = region;
                    device_count += 1;
                }
            }
            _ => {}
        }
    }
    (normal_count, device_count)
}

/// Builds the early frame pool over the largest usable region.
pub fn boot_frame_allocator() -> BootFrameAllocator {
    let largest = entries()
        .iter()
        .filter(|entry| entry.entry_type == EntryType::USABLE)
        .max_by_key(|entry| entry.length)
        .expect("boot memory map should contain usable memory");
    log::debug!(
        "early frame pool: {:#x} + {:#x}",
        largest.base,
        largest.length
    );
    BootFrameAllocator::new(PhysAddr::new(largest.base as usize), largest.length as usize)
}

/// Returns the kernel image's physical base, virtual base, and size.
pub fn kernel_image() -> (usize, usize, usize) {
    let response = EXECUTABLE_ADDRESS
        .get_response()
        .expect("executable address request should have been answered");
    // SAFETY: The linker script defines both symbols; only their addresses
    // are taken.
    let size = unsafe {
        ((&raw const __kernel_end) as usize) - ((&raw const __kernel_start) as usize)
    };
    (
        response.physical_base() as usize,
        response.virtual_base() as usize,
        size,
    )
}
