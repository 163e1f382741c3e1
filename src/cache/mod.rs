//! The object cache and the resource descriptors that describe what it
//! holds.
//!
//! - Entries are keyed by normalized href and carry their own TTL
//! - Staleness is evaluated lazily against the session clock
//! - Alternative links and dependency edges let invalidation reach related
//!   entries

mod object_cache;
mod traits;

pub use object_cache::{CacheEntry, ObjectCache, PatchOperation};
pub use traits::{DescriptorRegistry, RelationDescriptor, Resource, ResourceDescriptor};
