//! Architecture-independent mapping permissions.

use bitflags::bitflags;

bitflags! {
    /// Protection attributes for a mapping. Readability is implicit: every
    /// present mapping is readable.
    ///
    /// Two invariants are enforced when these bits are encoded into hardware
    /// entries, not left to caller discipline:
    ///
    /// - `DEVICE` mappings are always non-cacheable/strongly-ordered and
    ///   never executable, regardless of `EXEC`.
    /// - A mapping belongs to exactly one privilege domain: user mappings
    ///   are never privileged-executable, kernel mappings are never
    ///   user-executable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// The mapping is writable.
        const WRITE = 1 << 0;
        /// The mapping is executable (ignored for device memory).
        const EXEC = 1 << 1;
        /// The mapping is accessible from user mode.
        const USER = 1 << 2;
        /// The mapping covers device MMIO rather than normal memory.
        const DEVICE = 1 << 3;
    }
}

impl Protection {
    /// Returns true if the mapping belongs to user mode.
    pub fn is_user(self) -> bool {
        self.contains(Protection::USER)
    }

    /// Returns true if the mapping covers device memory.
    pub fn is_device(self) -> bool {
        self.contains(Protection::DEVICE)
    }
}
