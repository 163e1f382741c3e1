//! Builds `RemoteData` streams out of tracker and cache state.
//!
//! Each stream owns an observer holding a cursor into the followed request's
//! transition history. On every change notification the observer re-reads
//! tracker and cache, emits the transitions it has not seen yet, then the
//! current snapshot if it differs from the last one emitted.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{ready, Future};
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{DescriptorRegistry, ObjectCache};
use crate::clock::Clock;
use crate::event::ChangeFeed;
use crate::hal::{expand_template, normalize_key};
use crate::remote::{PaginatedList, RemoteData, RequestState};
use crate::request::{RequestEntry, RequestId, RequestOptions, RequestTracker};
use crate::transport::RestRequest;

/// Turns a raw payload into the consumer's type.
pub type Decoder<T> = Arc<dyn Fn(Value) -> Result<T> + Send + Sync>;

pub fn json_decoder<T: DeserializeOwned>() -> Decoder<T> {
  Arc::new(|value: Value| {
    serde_json::from_value(value).map_err(|e| eyre!("Failed to decode payload: {}", e))
  })
}

pub fn list_decoder<T: DeserializeOwned>() -> Decoder<PaginatedList<T>> {
  Arc::new(|value: Value| PaginatedList::from_hal(&value))
}

/// A stream holding a single terminal `Error` snapshot.
pub fn failed_stream<T: Send + 'static>(
  message: impl Into<String>,
  at: DateTime<Utc>,
) -> BoxStream<'static, RemoteData<T>> {
  stream::once(ready(RemoteData::failed(message, None, at))).boxed()
}

/// Entry point for consumers: hands out `RemoteData` streams by key, URI
/// template or request id.
#[derive(Clone)]
pub struct RemoteDataBuilder {
  tracker: Arc<RequestTracker>,
  cache: Arc<ObjectCache>,
  registry: Arc<DescriptorRegistry>,
  clock: Arc<dyn Clock>,
  feed: ChangeFeed,
  defaults: RequestOptions,
}

impl RemoteDataBuilder {
  pub fn new(
    tracker: Arc<RequestTracker>,
    registry: Arc<DescriptorRegistry>,
    clock: Arc<dyn Clock>,
    feed: ChangeFeed,
    defaults: RequestOptions,
  ) -> Self {
    let cache = Arc::clone(tracker.cache());
    Self {
      tracker,
      cache,
      registry,
      clock,
      feed,
      defaults,
    }
  }

  pub fn default_options(&self) -> RequestOptions {
    self.defaults.clone()
  }

  pub fn registry(&self) -> &DescriptorRegistry {
    &self.registry
  }

  pub fn tracker(&self) -> &Arc<RequestTracker> {
    &self.tracker
  }

  /// Observe a resource, sending a request unless a fresh cached copy may
  /// be used.
  pub fn from_key<T>(&self, href: &str, options: &RequestOptions) -> BoxStream<'static, RemoteData<T>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.observe_key(href, options, json_decoder(), true)
  }

  /// Like `from_key`, decoding the payload as a paginated collection.
  pub fn build_list<T>(
    &self,
    href: &str,
    options: &RequestOptions,
  ) -> BoxStream<'static, RemoteData<PaginatedList<T>>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.observe_key(href, options, list_decoder(), true)
  }

  /// Expand a HAL URI template and observe the result. A template that
  /// cannot be expanded yields a single `Error` snapshot and sends nothing.
  pub fn from_template<T>(
    &self,
    template: &str,
    params: &BTreeMap<String, String>,
    options: &RequestOptions,
  ) -> BoxStream<'static, RemoteData<T>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    match expand_template(template, params) {
      Ok(href) => self.from_key(&href, options),
      Err(e) => failed_stream(e.to_string(), self.clock.now()),
    }
  }

  /// Observe whatever the tracker and cache know about a key without
  /// sending anything.
  pub fn build_from_href<T>(&self, href: &str) -> BoxStream<'static, RemoteData<T>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    let options = RequestOptions {
      re_request_on_stale: false,
      ..self.defaults.clone()
    };
    self.observe_key(href, &options, json_decoder(), false)
  }

  /// Observe one request. Stale reads re-issue it when the defaults say so,
  /// and the stream then follows the newer request for the same key.
  pub fn build_from_request_id<T>(&self, id: RequestId) -> BoxStream<'static, RemoteData<T>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.observe_request(id, json_decoder())
  }

  /// Like `build_from_request_id`, holding back the first succeeded snapshot
  /// until `callback` has finished. The callback runs once.
  pub fn build_from_request_id_and_await<T, F, Fut>(
    &self,
    id: RequestId,
    callback: F,
  ) -> BoxStream<'static, RemoteData<T>>
  where
    T: DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut callback = Some(callback);
    self
      .build_from_request_id(id)
      .then(move |rd: RemoteData<T>| {
        let pending = if rd.has_succeeded() == Some(true) {
          callback.take().map(|f| f())
        } else {
          None
        };
        async move {
          if let Some(pending) = pending {
            pending.await;
          }
          rd
        }
      })
      .boxed()
  }

  /// One-shot snapshot of a key; `None` when nothing is known about it.
  pub fn current<T>(&self, href: &str) -> Option<RemoteData<T>>
  where
    T: DeserializeOwned,
  {
    let key = normalize_key(href).ok()?;
    let now = self.clock.now();
    let raw = match best_for_key(&self.tracker, &self.cache, &key, now) {
      Some(entry) => entry_snapshot(&self.cache, &entry, None, now, PayloadFrom::Key(&key)),
      None => cache_snapshot(&self.cache, &key, now)?,
    };
    Some(raw.try_map(|value| serde_json::from_value::<T>(value)))
  }

  pub(crate) fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub(crate) fn observe_key<T: Send + 'static>(
    &self,
    href: &str,
    options: &RequestOptions,
    decode: Decoder<T>,
    issue: bool,
  ) -> BoxStream<'static, RemoteData<T>> {
    let key = match normalize_key(href) {
      Ok(key) => key,
      Err(e) => return failed_stream(e.to_string(), self.clock.now()),
    };
    let request = RestRequest::get(href.trim());

    let mut observer = self.observer(
      Target::Key {
        key: key.clone(),
        request: request.clone(),
      },
      options.clone(),
      decode,
    );

    let use_cache = options.use_cached_version_if_available && !self.cache.is_stale(&key);
    if issue && !use_cache {
      if let Err(e) = self.tracker.ensure(request, options) {
        return failed_stream(e.to_string(), self.clock.now());
      }
    } else if use_cache {
      debug!(key = %key, "Serving from cache");
    }

    observer.prime();
    observer.into_stream()
  }

  fn observe_request<T: Send + 'static>(
    &self,
    id: RequestId,
    decode: Decoder<T>,
  ) -> BoxStream<'static, RemoteData<T>> {
    let mut observer = self.observer(Target::Request(id), self.defaults.clone(), decode);
    observer.prime();
    observer.into_stream()
  }

  fn observer<T>(&self, target: Target, options: RequestOptions, decode: Decoder<T>) -> Observer<T> {
    // subscribe before reading any state so no change is missed
    let rx = self.feed.subscribe();
    Observer {
      target,
      tracker: Arc::clone(&self.tracker),
      cache: Arc::clone(&self.cache),
      clock: Arc::clone(&self.clock),
      rx,
      options,
      decode,
      subscribed_seq: self.tracker.current_seq(),
      cursor: None,
      last: None,
      queue: VecDeque::new(),
      revalidated_for: None,
      seen: false,
      finished: false,
    }
  }
}

// ============================================================================
// Snapshot construction
// ============================================================================

/// Where a snapshot's payload is read from.
enum PayloadFrom<'a> {
  /// The cache entry for an observed key
  Key(&'a str),
  /// Whatever the request itself produced
  Request,
}

/// Pick the request that best describes a key: between the key's latest
/// request and the one that wrote the cached entry, the non-stale one wins,
/// then the most recent.
fn best_for_key(
  tracker: &RequestTracker,
  cache: &ObjectCache,
  key: &str,
  now: DateTime<Utc>,
) -> Option<RequestEntry> {
  let latest = tracker.latest_for_key(key);
  let writer = cache
    .get(key)
    .and_then(|cached| cached.request_id)
    .and_then(|id| tracker.get(id));

  match (latest, writer) {
    (Some(a), Some(b)) if a.id != b.id => {
      let (a_stale, b_stale) = (a.state_at(now).is_stale(), b.state_at(now).is_stale());
      if a_stale != b_stale {
        Some(if a_stale { b } else { a })
      } else if b.seq > a.seq {
        Some(b)
      } else {
        Some(a)
      }
    }
    (Some(a), _) => Some(a),
    (None, writer) => writer,
  }
}

fn entry_snapshot(
  cache: &ObjectCache,
  entry: &RequestEntry,
  index: Option<usize>,
  now: DateTime<Utc>,
  from: PayloadFrom<'_>,
) -> RemoteData<Value> {
  let (mut state, last_updated) = match index.and_then(|i| entry.transitions.get(i)) {
    Some(transition) => (transition.state, transition.at),
    None => (entry.state_at(now), entry.last_updated()),
  };

  let cached = match from {
    PayloadFrom::Key(key) => cache.get(key),
    PayloadFrom::Request => entry
      .response
      .as_ref()
      .and_then(|r| r.payload_link.as_deref())
      .and_then(|link| cache.get(link)),
  };
  if state == RequestState::Success && cached.as_ref().map_or(false, |c| c.marked_stale) {
    state = RequestState::SuccessStale;
  }

  let response = entry.response.as_ref().filter(|_| state.has_completed());
  let payload = match response {
    Some(r) if state.has_succeeded() && r.status_code != Some(204) => cached
      .map(|c| c.payload)
      .or_else(|| r.uncacheable.clone()),
    _ => None,
  };

  RemoteData::new(
    response.map(|r| r.time_completed),
    Some(entry.ms_to_live),
    last_updated,
    state,
    response.and_then(|r| r.error_message.clone()),
    payload,
    response.and_then(|r| r.status_code),
  )
}

/// A snapshot for a key that is only known to the cache.
fn cache_snapshot(cache: &ObjectCache, key: &str, now: DateTime<Utc>) -> Option<RemoteData<Value>> {
  let cached = cache.get(key)?;
  let state = if cached.is_stale_at(now) {
    RequestState::SuccessStale
  } else {
    RequestState::Success
  };
  Some(RemoteData::new(
    Some(cached.time_added),
    Some(cached.ms_to_live),
    cached.time_added,
    state,
    None,
    Some(cached.payload),
    Some(200),
  ))
}

// ============================================================================
// Observer
// ============================================================================

enum Target {
  Key { key: String, request: RestRequest },
  Request(RequestId),
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
  id: RequestId,
  next: usize,
}

type Fingerprint = (
  Option<RequestId>,
  RequestState,
  Option<u16>,
  Option<String>,
  Option<Value>,
);

struct Observer<T> {
  target: Target,
  tracker: Arc<RequestTracker>,
  cache: Arc<ObjectCache>,
  clock: Arc<dyn Clock>,
  rx: watch::Receiver<u64>,
  options: RequestOptions,
  decode: Decoder<T>,
  /// Requests with a higher `seq` were created after this observer
  subscribed_seq: u64,
  cursor: Option<Cursor>,
  last: Option<Fingerprint>,
  queue: VecDeque<RemoteData<T>>,
  /// Followed request (None: cache only) that was already re-requested
  revalidated_for: Option<Option<RequestId>>,
  seen: bool,
  finished: bool,
}

impl<T: Send + 'static> Observer<T> {
  /// Place the cursor on the request being followed right now, so that
  /// transitions happening before the first poll are still emitted.
  fn prime(&mut self) {
    let now = self.clock.now();
    if let Some(entry) = self.followed(now) {
      self.cursor = Some(self.start_cursor(&entry));
    }
  }

  fn start_cursor(&self, entry: &RequestEntry) -> Cursor {
    let next = if entry.seq > self.subscribed_seq {
      0
    } else {
      entry.transitions.len().saturating_sub(1)
    };
    Cursor { id: entry.id, next }
  }

  fn followed(&self, now: DateTime<Utc>) -> Option<RequestEntry> {
    match &self.target {
      Target::Key { key, .. } => best_for_key(&self.tracker, &self.cache, key, now),
      Target::Request(id) => {
        let entry = self.tracker.get(*id)?;
        if entry.request.method.is_read() {
          if let Some(newer) = self.tracker.latest_for_key(&entry.key) {
            if newer.seq > entry.seq {
              return Some(newer);
            }
          }
        }
        Some(entry)
      }
    }
  }

  fn into_stream(self) -> BoxStream<'static, RemoteData<T>> {
    stream::unfold(self, |mut observer| async move {
      loop {
        if let Some(item) = observer.queue.pop_front() {
          return Some((item, observer));
        }
        if observer.finished {
          return None;
        }

        observer.rx.borrow_and_update();
        observer.refresh();

        if observer.queue.is_empty() && !observer.finished && observer.rx.changed().await.is_err() {
          return None;
        }
      }
    })
    .boxed()
  }

  fn refresh(&mut self) {
    let now = self.clock.now();
    let entry = self.followed(now);

    if let Target::Request(id) = &self.target {
      if entry.is_none() {
        if !self.seen {
          self.queue.push_back(RemoteData::failed(
            format!("Unknown request {}", id),
            None,
            now,
          ));
        }
        self.finished = true;
        return;
      }
      self.seen = true;
    }

    let current = match entry {
      Some(entry) => self.emit_transitions(&entry, now),
      None => {
        let snapshot = match &self.target {
          Target::Key { key, .. } => cache_snapshot(&self.cache, key, now),
          Target::Request(_) => None,
        };
        snapshot.map(|snapshot| {
          let state = snapshot.state();
          self.push(None, snapshot);
          state
        })
      }
    };

    if let Some(state) = current {
      if state.is_stale() && self.options.re_request_on_stale {
        self.revalidate();
      }
    }
  }

  /// Emit unseen transitions of `entry`, then its current snapshot. Returns
  /// the current state.
  fn emit_transitions(&mut self, entry: &RequestEntry, now: DateTime<Utc>) -> Option<RequestState> {
    let cursor = match self.cursor {
      Some(cursor) if cursor.id == entry.id => cursor,
      _ => self.start_cursor(entry),
    };

    let len = entry.transitions.len();
    for index in cursor.next..len.saturating_sub(1) {
      let snapshot = entry_snapshot(&self.cache, entry, Some(index), now, self.payload_from());
      self.push(Some(entry.id), snapshot);
    }

    let snapshot = entry_snapshot(&self.cache, entry, None, now, self.payload_from());
    let state = snapshot.state();
    self.push(Some(entry.id), snapshot);
    self.cursor = Some(Cursor {
      id: entry.id,
      next: len,
    });
    Some(state)
  }

  fn payload_from(&self) -> PayloadFrom<'_> {
    match &self.target {
      Target::Key { key, .. } => PayloadFrom::Key(key),
      Target::Request(_) => PayloadFrom::Request,
    }
  }

  /// Queue a snapshot unless it looks exactly like the previous one.
  fn push(&mut self, id: Option<RequestId>, snapshot: RemoteData<Value>) {
    let fingerprint: Fingerprint = (
      id,
      snapshot.state(),
      snapshot.status_code(),
      snapshot.error_message().map(str::to_string),
      snapshot.payload().cloned(),
    );
    if self.last.as_ref() == Some(&fingerprint) {
      return;
    }
    self.last = Some(fingerprint);

    let decode = Arc::clone(&self.decode);
    self.queue.push_back(snapshot.try_map(|value| decode(value)));
  }

  /// Re-issue the followed request once per stale request.
  fn revalidate(&mut self) {
    let followed = self.last.as_ref().and_then(|f| f.0);
    if self.revalidated_for == Some(followed) {
      return;
    }
    self.revalidated_for = Some(followed);

    let request = match &self.target {
      Target::Key { request, .. } => Some(request.clone()),
      Target::Request(_) => followed
        .and_then(|id| self.tracker.get(id))
        .map(|entry| entry.request)
        .filter(|request| request.method.is_read()),
    };
    let Some(request) = request else {
      return;
    };

    debug!(href = %request.href, "Re-requesting stale resource");
    let options = self.options.clone().bypass_cache();
    if let Err(e) = self.tracker.ensure(request, &options) {
      warn!("Failed to re-request stale resource: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::config::Config;
  use crate::remote::RemoteDataStreamExt;
  use crate::session::Session;
  use crate::transport::mock::MockTransport;
  use chrono::Duration;
  use serde::Deserialize;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::time::Duration as StdDuration;

  #[derive(Debug, Clone, PartialEq, Deserialize)]
  struct Item {
    id: u32,
  }

  fn item(id: u32) -> Value {
    json!({ "id": id, "type": "item", "_links": { "self": { "href": format!("items/{}", id) } } })
  }

  fn session() -> (Session, MockTransport, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let transport = MockTransport::new();
    let mut config = Config::for_url("https://rest.api/server/api");
    config.cache.ms_to_live = 1000;
    let session = Session::with_clock(&config, Arc::new(transport.clone()), clock.clone());
    (session, transport, clock)
  }

  async fn collect<T: Send + 'static>(
    stream: BoxStream<'static, RemoteData<T>>,
    n: usize,
  ) -> Vec<RemoteData<T>> {
    tokio::time::timeout(StdDuration::from_secs(2), stream.take(n).collect::<Vec<_>>())
      .await
      .expect("stream stalled")
  }

  fn states<T>(snapshots: &[RemoteData<T>]) -> Vec<RequestState> {
    snapshots.iter().map(|rd| rd.state()).collect()
  }

  #[tokio::test]
  async fn test_from_key_emits_every_transition() {
    let (session, transport, _) = session();
    transport.respond_json("items/1", 200, item(1));

    let stream = session
      .builder()
      .from_key::<Item>("items/1", &session.default_options());
    let out = collect(stream, 3).await;

    assert_eq!(
      states(&out),
      vec![
        RequestState::RequestPending,
        RequestState::ResponsePending,
        RequestState::Success
      ]
    );
    assert_eq!(out[0].payload(), None);
    assert_eq!(out[2].payload(), Some(&Item { id: 1 }));
    assert_eq!(out[2].status_code(), Some(200));
    assert_eq!(out[2].ms_to_live(), Some(Duration::milliseconds(1000)));
  }

  #[tokio::test]
  async fn test_concurrent_reads_share_one_call() {
    let (session, transport, _) = session();
    transport.respond_json("items/1", 200, item(1));
    let options = session.default_options();

    let first = session.builder().from_key::<Item>("items/1", &options);
    let second = session.builder().from_key::<Item>("items/1", &options);

    let (a, b) = futures::join!(
      collect(first.first_completed(), 1),
      collect(second.first_completed(), 1)
    );
    assert_eq!(transport.calls(), 1);
    assert_eq!(a, b);
    assert_eq!(a[0].payload(), Some(&Item { id: 1 }));
  }

  #[tokio::test]
  async fn test_not_found_is_a_known_failure() {
    let (session, transport, _) = session();
    let stream = session
      .builder()
      .from_key::<Item>("items/404", &session.default_options());
    let out = collect(stream.first_completed(), 1).await;

    let rd = &out[0];
    assert!(rd.is_error());
    assert_eq!(rd.status_code(), Some(404));
    assert_eq!(rd.payload(), None);
    assert_eq!(rd.has_failed(), Some(true));
    assert_eq!(rd.has_succeeded(), Some(false));
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test]
  async fn test_ttl_boundary_through_current() {
    let (session, _, clock) = session();
    session
      .cache()
      .put("items/1", item(1), Duration::milliseconds(1000), clock.now());

    let builder = session.builder();
    clock.advance(Duration::milliseconds(999));
    assert!(builder.current::<Item>("items/1").unwrap().is_success());

    clock.advance(Duration::milliseconds(1));
    let rd = builder.current::<Item>("items/1").unwrap();
    assert!(rd.is_success_stale());
    assert_eq!(rd.payload(), Some(&Item { id: 1 }));

    assert!(builder.current::<Item>("items/2").is_none());
  }

  #[tokio::test]
  async fn test_fresh_cache_is_served_without_a_call() {
    let (session, transport, clock) = session();
    session
      .cache()
      .put("items/1", item(1), Duration::milliseconds(1000), clock.now());

    let stream = session
      .builder()
      .from_key::<Item>("items/1", &session.default_options());
    let out = collect(stream, 1).await;
    assert!(out[0].is_success());
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test]
  async fn test_stale_read_revalidates_in_background() {
    let (session, transport, clock) = session();
    transport.respond_json("items/1", 200, item(1));

    let mut stream = session
      .builder()
      .from_key::<Item>("items/1", &session.default_options());
    let mut seen = Vec::new();
    for _ in 0..3 {
      seen.push(stream.next().await.unwrap());
    }
    assert!(seen[2].is_success());

    clock.advance(Duration::milliseconds(1000));
    session.feed().notify();

    let out = collect(stream, 4).await;
    assert_eq!(
      states(&out),
      vec![
        RequestState::SuccessStale,
        RequestState::RequestPending,
        RequestState::ResponsePending,
        RequestState::Success
      ]
    );
    // the stale snapshot still carries the old payload
    assert_eq!(out[0].payload(), Some(&Item { id: 1 }));
    assert_eq!(transport.calls(), 2);
  }

  #[tokio::test]
  async fn test_no_revalidation_when_disabled() {
    let (session, transport, clock) = session();
    transport.respond_json("items/1", 200, item(1));
    let options = RequestOptions {
      re_request_on_stale: false,
      ..session.default_options()
    };

    let mut stream = session.builder().from_key::<Item>("items/1", &options);
    for _ in 0..3 {
      stream.next().await.unwrap();
    }
    clock.advance(Duration::milliseconds(1000));
    session.feed().notify();

    let rd = stream.next().await.unwrap();
    assert!(rd.is_success_stale());
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test]
  async fn test_pagination_partial_last_page() {
    let (session, transport, _) = session();
    let items: Vec<Value> = (21..=25).map(item).collect();
    transport.respond_json(
      "items?page=2&size=10",
      200,
      json!({
        "_links": { "self": { "href": "items?page=2&size=10" } },
        "_embedded": { "items": items },
        "page": { "size": 10, "totalElements": 25, "totalPages": 3, "number": 2 }
      }),
    );

    let service = session.service("items");
    let stream = service.find_all::<Item>(
      &crate::service::FindListOptions::page(3, 10),
      &session.default_options(),
    );
    let out = collect(stream.first_succeeded(), 1).await;
    let list = out[0].payload().unwrap();

    assert_eq!(list.page.len(), 5);
    assert_eq!(list.page_info.current_page, 3);
    assert_eq!(list.page_info.total_elements, 25);
    assert!(list.is_last_page());
    // embedded items were cached on their own
    assert!(session.cache().get("items/23").is_some());
  }

  #[tokio::test]
  async fn test_substring_invalidation() {
    let (session, transport, _) = session();
    for href in ["core/items/1", "core/items/2", "core/people/1"] {
      transport.respond_json(
        href,
        200,
        json!({ "id": 1, "_links": { "self": { "href": href } } }),
      );
    }

    let builder = session.builder();
    for href in ["core/items/1", "core/items/2", "core/people/1"] {
      let stream = builder.from_key::<Item>(href, &session.default_options());
      collect(stream.first_succeeded(), 1).await;
    }

    assert_eq!(session.tracker().set_stale_by_substring("core/items"), 2);
    assert!(builder.current::<Item>("core/items/1").unwrap().is_success_stale());
    assert!(builder.current::<Item>("core/items/2").unwrap().is_success_stale());
    assert!(builder.current::<Item>("core/people/1").unwrap().is_success());
  }

  #[tokio::test]
  async fn test_item_ttl_of_one_minute() {
    let (session, transport, clock) = session();
    transport.respond_json(
      "items/42",
      200,
      json!({ "id": 42, "title": "X", "_links": { "self": { "href": "items/42" } } }),
    );
    let options = RequestOptions {
      ms_to_live: Some(Duration::milliseconds(60_000)),
      ..session.default_options()
    };

    let stream = session.builder().from_key::<Value>("items/42", &options);
    collect(stream.first_succeeded(), 1).await;

    clock.advance(Duration::milliseconds(30_000));
    let rd = session.builder().current::<Value>("items/42").unwrap();
    assert_eq!(rd.state(), RequestState::Success);
    assert_eq!(rd.payload().unwrap()["title"], "X");

    clock.advance(Duration::milliseconds(40_000));
    let rd = session.builder().current::<Value>("items/42").unwrap();
    assert_eq!(rd.state(), RequestState::SuccessStale);
    assert_eq!(rd.payload().unwrap()["title"], "X");
  }

  #[tokio::test]
  async fn test_find_all_first_and_last_page() {
    let (session, transport, _) = session();
    let first: Vec<Value> = (1..=20).map(item).collect();
    let last: Vec<Value> = (41..=45).map(item).collect();
    transport.respond_json(
      "items?page=0&size=20",
      200,
      json!({
        "_links": { "self": { "href": "items?page=0&size=20" } },
        "_embedded": { "items": first },
        "page": { "size": 20, "totalElements": 45, "totalPages": 3, "number": 0 }
      }),
    );
    transport.respond_json(
      "items?page=2&size=20",
      200,
      json!({
        "_links": { "self": { "href": "items?page=2&size=20" } },
        "_embedded": { "items": last },
        "page": { "size": 20, "totalElements": 45, "totalPages": 3, "number": 2 }
      }),
    );
    let service = session.service("items");
    let options = session.default_options();

    let out = collect(
      service
        .find_all::<Item>(&crate::service::FindListOptions::page(1, 20), &options)
        .first_succeeded(),
      1,
    )
    .await;
    let list = out[0].payload().unwrap();
    assert_eq!(list.page_info.current_page, 1);
    assert_eq!(list.page_info.elements_per_page, 20);
    assert_eq!(list.page_info.total_elements, 45);
    assert_eq!(list.page.len(), 20);

    let out = collect(
      service
        .find_all::<Item>(&crate::service::FindListOptions::page(3, 20), &options)
        .first_succeeded(),
      1,
    )
    .await;
    let list = out[0].payload().unwrap();
    assert_eq!(list.page.len(), 5);
    assert_eq!(list.page_info.current_page, 3);
  }

  #[tokio::test]
  async fn test_stale_by_substring_reaches_collection_key() {
    let (session, transport, _) = session();
    transport.respond_json(
      "items/",
      200,
      json!({
        "_links": { "self": { "href": "items/" } },
        "_embedded": { "items": [item(42)] }
      }),
    );
    transport.respond_json(
      "collections/7",
      200,
      json!({ "id": 7, "_links": { "self": { "href": "collections/7" } } }),
    );

    let builder = session.builder();
    for href in ["items/", "collections/7"] {
      let stream = builder.from_key::<Value>(href, &session.default_options());
      collect(stream.first_succeeded(), 1).await;
    }
    assert!(builder.current::<Value>("items/42").unwrap().is_success());

    session.tracker().set_stale_by_substring("items/");

    assert!(builder.current::<Value>("items/").unwrap().is_success_stale());
    assert!(builder.current::<Value>("items/42").unwrap().is_success_stale());
    assert!(builder.current::<Value>("collections/7").unwrap().is_success());
    assert!(session.cache().is_stale("items/"));
    assert!(!session.cache().is_stale("collections/7"));
  }

  #[tokio::test]
  async fn test_read_after_cache_removal_fetches_again() {
    let (session, transport, _) = session();
    transport.respond_json("items/1", 200, item(1));
    let builder = session.builder();

    let stream = builder.from_key::<Item>("items/1", &session.default_options());
    collect(stream.first_succeeded(), 1).await;
    assert!(session.cache().remove("items/1"));

    let stream = builder.from_key::<Item>("items/1", &session.default_options());
    let out = collect(stream.first_completed(), 1).await;
    assert!(out[0].is_success());
    assert_eq!(out[0].payload(), Some(&Item { id: 1 }));
    assert_eq!(transport.calls_to("items/1"), 2);
  }

  #[tokio::test]
  async fn test_template_missing_parameter_fails_without_call() {
    let (session, transport, _) = session();
    let stream = session.builder().from_template::<Item>(
      "items/{id}{?embed}",
      &BTreeMap::new(),
      &session.default_options(),
    );
    let out = collect(stream, 2).await;

    assert_eq!(out.len(), 1);
    assert!(out[0].is_error());
    assert!(out[0].error_message().unwrap().contains("'id'"));
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test]
  async fn test_template_expands_and_fetches() {
    let (session, transport, _) = session();
    transport.respond_json("items/7", 200, item(7));

    let mut params = BTreeMap::new();
    params.insert("id".to_string(), "7".to_string());
    let stream = session.builder().from_template::<Item>(
      "items/{id}{?embed}",
      &params,
      &session.default_options(),
    );
    let out = collect(stream.first_succeeded(), 1).await;
    assert_eq!(out[0].payload(), Some(&Item { id: 7 }));
  }

  #[tokio::test]
  async fn test_build_from_href_observes_without_sending() {
    let (session, transport, _) = session();
    transport.respond_json("items/1", 200, item(1));

    let observed = session.builder().build_from_href::<Item>("items/1");
    tokio::time::sleep(StdDuration::from_millis(20)).await;
    assert_eq!(transport.calls(), 0);

    let loaded = session
      .builder()
      .from_key::<Item>("items/1", &session.default_options());
    collect(loaded.first_succeeded(), 1).await;

    let out = collect(observed.first_succeeded(), 1).await;
    assert_eq!(out[0].payload(), Some(&Item { id: 1 }));
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test]
  async fn test_uncacheable_payload_is_kept_on_the_request() {
    let (session, transport, _) = session();
    transport.respond_json("stats", 200, json!({ "count": 3 }));

    let stream = session
      .builder()
      .from_key::<Value>("stats", &session.default_options());
    let out = collect(stream.first_succeeded(), 1).await;

    assert_eq!(out[0].payload(), Some(&json!({ "count": 3 })));
    assert!(session.cache().get("stats").is_none());
  }

  #[tokio::test]
  async fn test_decode_failure_becomes_error() {
    let (session, transport, _) = session();
    transport.respond_json(
      "items/1",
      200,
      json!({ "id": "not a number", "_links": { "self": { "href": "items/1" } } }),
    );

    let stream = session
      .builder()
      .from_key::<Item>("items/1", &session.default_options());
    let out = collect(stream.first_completed(), 1).await;
    assert!(out[0].is_error());
    assert_eq!(out[0].payload(), None);
    assert!(out[0].error_message().unwrap().contains("decode"));
  }

  #[tokio::test]
  async fn test_unknown_request_id() {
    let (session, _, _) = session();
    let stream = session.builder().build_from_request_id::<Item>(RequestId::new());
    let out = collect(stream, 2).await;

    assert_eq!(out.len(), 1);
    assert!(out[0].is_error());
  }

  #[tokio::test]
  async fn test_request_stream_ends_when_removed() {
    let (session, transport, _) = session();
    transport.hold();
    let id = session
      .tracker()
      .ensure(RestRequest::get("items/1"), &session.default_options())
      .unwrap();

    let mut stream = session.builder().build_from_request_id::<Item>(id);
    assert!(stream.next().await.unwrap().is_request_pending());

    session.tracker().remove(id);
    let rest = collect(stream, 5).await;
    assert!(rest.iter().all(|rd| rd.is_loading()));
    transport.release();
  }

  #[tokio::test]
  async fn test_build_from_request_id_and_await() {
    let (session, transport, _) = session();
    transport.respond_json("items/1", 200, item(1));
    let id = session
      .tracker()
      .ensure(RestRequest::get("items/1"), &session.default_options())
      .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let stream = session
      .builder()
      .build_from_request_id_and_await::<Item, _, _>(id, move || async move {
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        flag.store(true, Ordering::SeqCst);
      });

    let out = collect(stream.first_succeeded(), 1).await;
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(out[0].payload(), Some(&Item { id: 1 }));
  }
}
