//! Value types consumed by the rest of the application: request states,
//! `RemoteData` snapshots, paginated lists and the operators over them.

pub mod operators;
mod paginated_list;
mod remote_data;
mod state;

pub use operators::RemoteDataStreamExt;
pub use paginated_list::{PageInfo, PaginatedList};
pub use remote_data::RemoteData;
pub use state::RequestState;
