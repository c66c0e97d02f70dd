// cSpell:ignore kmain kenter

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod console;
mod heap;
mod mem;
mod serial;

use limine::BaseRevision;
use vmm::{
    AddressSpace, AddressTranslator, BootMap, FrameAllocator, KernelSpace, MemoryRegion, PAGE_SIZE,
    PhysAddr, Protection, Scheduler, VirtAddr,
};

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(4);

/// The architecture entry point named by the linker script; the bootloader
/// jumps here with the MMU already on and its own page tables loaded.
#[unsafe(no_mangle)]
pub extern "C" fn kenter() -> ! {
    kmain()
}

pub fn kmain() -> ! {
    assert!(BASE_REVISION.is_supported());

    let console = console::Console::init();
    serial::init(console);
    log::info!("vega kernel booting");

    let direct_map_offset = mem::init_translator();
    let mut boot_frames = mem::boot_frame_allocator();

    let mut normal = [MemoryRegion::new(PhysAddr::new(0), 0); mem::MAX_REGIONS];
    let mut device = [MemoryRegion::new(PhysAddr::new(0), 0); mem::MAX_REGIONS];
    let (normal_count, device_count) = mem::boot_map(&mut normal, &mut device);

    let map = BootMap {
        normal: &normal[..normal_count],
        device: &device[..device_count],
    };
    let mut kernel = KernelSpace::bootstrap(&map, direct_map_offset, &mut boot_frames);

    // The image runs at its link address in the upper half, not inside the
    // direct map; map it explicitly so execution survives the root switch
    // and every process inherits it.
    let (phys_base, virt_base, size) = mem::kernel_image();
    let mut offset = 0;
    while offset < size {
        kernel
            .map_one(
                VirtAddr::new(virt_base + offset),
                PhysAddr::new(phys_base + offset),
                Protection::WRITE | Protection::EXEC,
                &mut boot_frames,
            )
            .expect("kernel image mapping");
        offset += PAGE_SIZE;
    }

    // SAFETY: The boot map covers the executing image, the boot stack, and
    // the direct map; this is the one-time switch onto our own tables.
    unsafe { kernel.install() };
    log::info!("kernel heap: {} bytes used", heap::used());

    demo_isolation(&kernel, &mut boot_frames);

    log::info!("boot complete");
    halt()
}

/// Smoke test of the process memory path: two address spaces map the same
/// virtual page to different frames, and a context switch flips which data
/// the address shows.
fn demo_isolation(kernel: &KernelSpace, frames: &mut dyn FrameAllocator) {
    let addr = VirtAddr::new(0x0040_0000);

    let space_a = user_space_with_pattern(kernel, frames, addr, 0xAAAA_5555);
    let space_b = user_space_with_pattern(kernel, frames, addr, 0xBBBB_6666);

    let mut sched = Scheduler::new();
    let a = sched.spawn(Some(space_a));
    let b = sched.spawn(Some(space_b));

    assert_eq!(sched.schedule(), a);
    // SAFETY: `addr` is mapped readable in the active space.
    let seen_a = unsafe { core::ptr::read_volatile(addr.as_usize() as *const u32) };

    assert_eq!(sched.schedule(), b);
    // SAFETY: As above.
    let seen_b = unsafe { core::ptr::read_volatile(addr.as_usize() as *const u32) };

    assert_eq!(seen_a, 0xAAAA_5555, "space A shows foreign data");
    assert_eq!(seen_b, 0xBBBB_6666, "space B shows foreign data");
    log::info!("address space isolation verified at {addr}");
}

fn user_space_with_pattern(
    kernel: &KernelSpace,
    frames: &mut dyn FrameAllocator,
    addr: VirtAddr,
    pattern: u32,
) -> vmm::SharedSpace {
    let mut space = AddressSpace::new(kernel, frames).expect("address space");
    space
        .map_user_range(addr, PAGE_SIZE, Protection::WRITE, frames)
        .expect("user mapping");

    let phys = space.translate(addr).expect("freshly mapped page");
    let ptr = AddressTranslator::current().phys_to_ptr::<u32>(phys.as_usize());
    // SAFETY: The frame was just allocated for this space; we write it
    // through the direct map before the space ever runs.
    unsafe { core::ptr::write_volatile(ptr, pattern) };

    space.into_shared()
}

/// Parks the CPU.
pub fn halt() -> ! {
    loop {
        #[cfg(target_arch = "x86_64")]
        x86_64::instructions::hlt();
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}
