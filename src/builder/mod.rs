//! Consumer-facing construction of `RemoteData` streams and lazy link
//! handles.

mod link;
mod remote_data_build;

pub use link::LinkHandle;
pub use remote_data_build::{failed_stream, json_decoder, list_decoder, Decoder, RemoteDataBuilder};
