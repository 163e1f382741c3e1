//! Composable transformations over streams of `RemoteData` snapshots.
//!
//! Use these instead of checking lifecycle flags by hand. Each operator
//! states which transitions it waits for.

use futures::future::ready;
use futures::stream::{BoxStream, Stream, StreamExt};

use super::paginated_list::PaginatedList;
use super::remote_data::RemoteData;

/// Emit the first snapshot that has completed (success or failure), then stop
/// observing the source.
pub fn first_completed<T, S>(source: S) -> BoxStream<'static, RemoteData<T>>
where
  S: Stream<Item = RemoteData<T>> + Send + 'static,
  T: Send + 'static,
{
  source.filter(|rd| ready(rd.has_completed())).take(1).boxed()
}

/// Emit the first succeeded snapshot, then stop. Never emits for failures;
/// use `first_completed` when the failure matters.
pub fn first_succeeded<T, S>(source: S) -> BoxStream<'static, RemoteData<T>>
where
  S: Stream<Item = RemoteData<T>> + Send + 'static,
  T: Send + 'static,
{
  all_succeeded(source).take(1).boxed()
}

/// Emit every succeeded snapshot as it arrives.
pub fn all_succeeded<T, S>(source: S) -> BoxStream<'static, RemoteData<T>>
where
  S: Stream<Item = RemoteData<T>> + Send + 'static,
  T: Send + 'static,
{
  source
    .filter(|rd| ready(rd.has_succeeded() == Some(true)))
    .boxed()
}

/// Project each snapshot to its payload.
///
/// Chain this after `first_succeeded` or `all_succeeded`: on an unfiltered
/// source, loading and failed snapshots come through as `None`.
pub fn payloads<T, S>(source: S) -> BoxStream<'static, Option<T>>
where
  S: Stream<Item = RemoteData<T>> + Send + 'static,
  T: Send + 'static,
{
  source.map(RemoteData::into_payload).boxed()
}

/// Project paginated snapshots to the items of their current page. No
/// cross-page aggregation happens.
pub fn page_items<T, S>(source: S) -> BoxStream<'static, Vec<T>>
where
  S: Stream<Item = RemoteData<PaginatedList<T>>> + Send + 'static,
  T: Send + 'static,
{
  source
    .map(|rd| rd.into_payload().map(|list| list.page).unwrap_or_default())
    .boxed()
}

/// Call `on_stale` for every stale snapshot that passes through, when
/// `should_re_request` is set. Snapshots are forwarded unchanged.
pub fn re_request_on_stale<T, S, F>(
  source: S,
  should_re_request: bool,
  mut on_stale: F,
) -> BoxStream<'static, RemoteData<T>>
where
  S: Stream<Item = RemoteData<T>> + Send + 'static,
  T: Send + 'static,
  F: FnMut() + Send + 'static,
{
  source
    .inspect(move |rd| {
      if should_re_request && rd.is_stale() {
        on_stale();
      }
    })
    .boxed()
}

/// Method-call form of the operators above.
pub trait RemoteDataStreamExt<T: Send + 'static>:
  Stream<Item = RemoteData<T>> + Sized + Send + 'static
{
  fn first_completed(self) -> BoxStream<'static, RemoteData<T>> {
    first_completed(self)
  }

  fn first_succeeded(self) -> BoxStream<'static, RemoteData<T>> {
    first_succeeded(self)
  }

  fn all_succeeded(self) -> BoxStream<'static, RemoteData<T>> {
    all_succeeded(self)
  }

  fn payloads(self) -> BoxStream<'static, Option<T>> {
    payloads(self)
  }
}

impl<T, S> RemoteDataStreamExt<T> for S
where
  T: Send + 'static,
  S: Stream<Item = RemoteData<T>> + Send + 'static,
{
}
