//! Infrastructure layer - Storage adapters and local caching

pub(crate) mod fs_util;
pub mod memory;

pub use memory::MemoryStore;
