//! Physical and virtual address types, and the translation between them.
//!
//! `PhysAddr` and `VirtAddr` are opaque newtypes that are never
//! interchangeable; crossing between the two goes through the
//! [`AddressTranslator`], the injected "physical address to accessible
//! pointer" dependency the page table engine walks tables with.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Converts physical addresses into pointers the kernel can dereference.
///
/// - `Hardware`: the kernel's direct map of physical memory at a fixed
///   virtual offset.
/// - `Emulated`: a host-memory buffer standing in for RAM when testing.
pub enum AddressTranslator {
    /// Direct-map translation at a fixed offset.
    Hardware { direct_map_offset: usize },
    /// Simulated physical memory for tests and host-side development.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

/// Global address translator, installed once during kernel initialization.
///
/// In test/software-emulation builds this is thread-local so every test owns
/// an independent emulated memory fixture.
#[cfg(not(any(test, feature = "software-emulation")))]
static TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

impl AddressTranslator {
    /// Creates a direct-map translator with the given offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates an emulated translator backed by `size` bytes of host memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Installs the global translator. Must be called exactly once.
    ///
    /// # Panics
    ///
    /// Panics if a translator has already been installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if TRANSLATOR.get().is_some() {
                panic!("address translator already installed");
            }
            TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        TRANSLATOR.with(|slot| {
            if slot.get().is_some() {
                panic!("address translator already installed");
            }
            slot.call_once(|| translator);
        });
    }

    /// Returns the installed translator.
    ///
    /// # Panics
    ///
    /// Panics if [`AddressTranslator::set_current`] has not been called.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            TRANSLATOR
                .get()
                .expect("address translator not installed; call AddressTranslator::set_current first")
        }

        #[cfg(any(test, feature = "software-emulation"))]
        TRANSLATOR.with(|slot| {
            // SAFETY: The reference is leaked to 'static. The thread-local is
            // written once (spin::Once) and lives as long as the thread, and
            // each thread owns its own instance.
            unsafe {
                &*(slot.get().expect(
                    "address translator not installed; call AddressTranslator::set_current first",
                ) as *const AddressTranslator)
            }
        })
    }

    /// Returns the installed translator, or `None` before installation.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        TRANSLATOR.with(|slot| {
            slot.get().map(|translator| {
                // SAFETY: Same reasoning as `current`.
                unsafe { &*(translator as *const AddressTranslator) }
            })
        })
    }

    /// Translates a physical address to a dereferenceable address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.translate(phys) as usize,
        }
    }

    /// Translates a dereferenceable address back to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.offset_of(virt as *const u8),
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    /// Carves a block out of the emulated memory (test builds only).
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        match self {
            Self::Hardware { .. } => panic!("cannot allocate from the hardware translator"),
            Self::Emulated(memory) => memory.allocate(size, align),
        }
    }
}

/// Generates the structure and methods shared by both address types.
macro_rules! impl_addr_common {
    ($name:ident) => {
        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks whether the address is aligned to `align`.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Rounds the address down to a multiple of `align`.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Rounds the address up to a multiple of `align`.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl_addr_common!(PhysAddr);

impl PhysAddr {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's physical address
    /// width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }
}

/// A virtual memory address.
///
/// Only meaningful relative to an address space (or the kernel's fixed
/// space); this type is never dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl_addr_common!(VirtAddr);

impl VirtAddr {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns the offset of the address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the page table index for this address at the given level.
    ///
    /// Level 0 is the deepest level (the one holding leaf entries); higher
    /// levels are closer to the root.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Returns true if the address lies in the user (lower) half.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < arch::USER_SPACE_END
    }
}
