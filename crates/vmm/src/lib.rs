#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Vega Virtual Memory Manager (VMM)
//!
//! The memory core of the Vega kernel: translation between physical and
//! virtual addresses, multi-level page table management, per-process
//! address spaces, and the pieces that consume them — the context-switch
//! integration and the executable loader.
//!
//! - Physical frames come from an external physical memory manager,
//!   consumed through the [`FrameAllocator`] trait.
//! - Architecture specifics (x86_64, aarch64) live behind a build-time
//!   selected module; tests run against a software scale model with
//!   emulated memory, an emulated current root, and an emulated TLB.
//! - Every fallible operation returns a typed [`Fault`]; the only
//!   panicking path is the one-time kernel bootstrap.

extern crate alloc;

mod addr;
mod arch;
mod fault;
mod frames;
mod kernel_space;
mod loader;
mod paging;
mod prot;
mod sched;
mod space;
mod vma;

pub use addr::{AddressTranslator, PhysAddr, VirtAddr};
pub use fault::{Fault, ImageError};
#[cfg(any(test, feature = "software-emulation"))]
pub use frames::EmulatedFrames;
pub use frames::{BootFrameAllocator, FrameAllocator};
pub use kernel_space::{BootMap, KernelSpace, MemoryRegion};
pub use loader::{Image, LoadedImage, Segment, load};
#[cfg(any(test, feature = "software-emulation"))]
pub use paging::{probe_current, read_current, write_current};
pub use paging::{PageTable, PageTables};
pub use prot::Protection;
pub use sched::{Scheduler, Task, TaskId, TaskState};
pub use space::{AddressSpace, SharedSpace};
pub use vma::Vma;

pub use arch::{PAGE_SIZE, PAGE_TABLE_LEVELS, USER_SPACE_END, USER_STACK_TOP};
