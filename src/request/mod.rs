//! Request lifecycle tracking: deduplication, completion and explicit
//! invalidation.

mod entry;
mod tracker;

pub use entry::{RequestEntry, RequestId, RequestOptions, ResponseInfo, Transition};
pub use tracker::RequestTracker;
