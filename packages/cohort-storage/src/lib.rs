//! cohort-storage - Store adapter contract for cohort datasets
//!
//! ## Core Principles
//!
//! 1. **Port first**: datasets only reach storage through [`DataStore`]
//! 2. **References, not copies**: items are listed as descriptors and pulled on demand
//! 3. **Declared capabilities**: stores without quality/header introspection say so
//!    instead of failing per call
//! 4. **Scoped caching**: local cache slots are exclusive and never left half-written
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cohort_storage::{CachingStore, LocalCache, MemoryStore, DataStore};
//!
//! let store = CachingStore::new(MemoryStore::new("/tmp/scratch"), LocalCache::new("/tmp/cache")?);
//! for leaf in store.list_rows("my-study", &["subject".into()])? {
//!     println!("{:?}", leaf.path);
//! }
//! ```

pub mod cache;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use cache::{CacheSlot, CacheStats, CachingStore, LocalCache};
pub use domain::{
    DataStore, ItemEntry, ItemKind, ItemValue, LeafEntry, ProvenanceRecord, Quality, RowLocator,
    StoreCapabilities,
};
pub use infrastructure::MemoryStore;
