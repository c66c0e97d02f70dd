//! Error taxonomy for the virtual memory manager.

use core::fmt;

/// Errors reported by the page table engine and the address space manager.
///
/// Every fallible operation in this crate returns one of these; callers
/// (scheduler, loader, process creation) are expected to handle them. The
/// only panicking path is the one-time kernel bootstrap, where failure is
/// unrecoverable by definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The physical frame allocator is exhausted.
    OutOfMemory,
    /// A map operation targeted a virtual page that is already mapped.
    /// The existing mapping is left untouched.
    AlreadyMapped,
    /// An unmap/translate/walk targeted a virtual page with no mapping.
    NotMapped,
    /// A table entry encodes something the engine cannot interpret, such as
    /// a large-page leaf at a level that should only hold tables.
    Malformed,
    /// The virtual address lies outside the caller's permitted half of the
    /// address space.
    InvalidAddress,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Fault::OutOfMemory => "out of physical memory",
            Fault::AlreadyMapped => "virtual page already mapped",
            Fault::NotMapped => "virtual page not mapped",
            Fault::Malformed => "malformed page table entry",
            Fault::InvalidAddress => "address outside the permitted range",
        };
        f.write_str(message)
    }
}

/// Errors produced while parsing an executable image.
///
/// Malformed input must never panic the kernel; the loader reports it and
/// process creation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// The file does not start with the ELF magic bytes.
    BadMagic,
    /// Not a 64-bit image.
    UnsupportedClass,
    /// Not an `ET_EXEC` executable.
    UnsupportedType,
    /// A header or segment lies beyond the end of the file.
    Truncated,
    /// A loadable segment or the entry point falls outside user space.
    BadSegment,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ImageError::BadMagic => "not an ELF image",
            ImageError::UnsupportedClass => "not a 64-bit ELF image",
            ImageError::UnsupportedType => "not an executable ELF image",
            ImageError::Truncated => "image is truncated",
            ImageError::BadSegment => "segment outside user address space",
        };
        f.write_str(message)
    }
}
