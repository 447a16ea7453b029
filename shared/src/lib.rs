//! Architecture-independent core of the Silicium memory-management stack.
//!
//! Everything in this crate is written against the [`paging::AddressSpace`]
//! seam so the whole allocator stack (frame table, vmalloc carver, slub
//! object pools, kmalloc front end, memory contexts) runs unchanged on the
//! real self-mirroring page tables and on the simulated backend used by the
//! hosted test suite.

#![no_std]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod error;
pub mod memory;
pub mod paging;
