//! Remote-resource cache and request-state engine for HAL/REST APIs.
//!
//! A [`Session`] ties together the object cache, the request tracker and the
//! builder that hands out [`RemoteData`] streams. Consumers ask for resources
//! by href; requests are deduplicated per key, responses are cached with a
//! TTL and stale reads re-validate in the background.

pub mod builder;
pub mod cache;
pub mod clock;
pub mod config;
pub mod event;
pub mod hal;
pub mod logging;
pub mod remote;
pub mod request;
pub mod service;
pub mod session;
pub mod transport;

pub use builder::{LinkHandle, RemoteDataBuilder};
pub use cache::{ObjectCache, Resource, ResourceDescriptor};
pub use config::Config;
pub use remote::{PaginatedList, RemoteData, RemoteDataStreamExt, RequestState};
pub use request::{RequestId, RequestOptions, RequestTracker};
pub use service::{DataService, FindListOptions};
pub use session::Session;
