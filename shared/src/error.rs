//! Recoverable error taxonomy of the memory stack.
//!
//! Invariant violations (double map, double free, refcounting a free frame)
//! are not errors: they panic, and the kernel's panic handler halts the CPU.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryError {
    /// An allocator chain was exhausted.
    OutOfMemory,
    /// The target virtual page already holds a live mapping.
    AlreadyMapped,
    /// The operation needs a mapping that is not there.
    NotMapped,
    /// The object to create already exists.
    Exists,
    /// The object to operate on was not found.
    NotFound,
    /// The resource is held by someone else.
    Busy,
    /// The arguments do not make sense.
    Invalid,
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            MemoryError::OutOfMemory => "out of memory",
            MemoryError::AlreadyMapped => "already mapped",
            MemoryError::NotMapped => "not mapped",
            MemoryError::Exists => "already exists",
            MemoryError::NotFound => "not found",
            MemoryError::Busy => "busy",
            MemoryError::Invalid => "invalid argument",
        };
        f.write_str(msg)
    }
}
