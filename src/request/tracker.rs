//! The request tracker: one record per outgoing request, indexed by key.
//!
//! All bookkeeping happens under a single synchronous lock that is never held
//! across an await. Network calls run on spawned tasks and report back
//! through `complete`.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{RequestEntry, RequestId, RequestOptions, ResponseInfo};
use crate::cache::ObjectCache;
use crate::clock::Clock;
use crate::event::ChangeFeed;
use crate::hal::{embedded_resources, key_contains, normalize_key, self_href};
use crate::remote::RequestState;
use crate::transport::{RawResponse, RestRequest, Transport};

#[derive(Default)]
struct TrackerState {
  entries: HashMap<RequestId, RequestEntry>,
  /// key -> latest read request for that key
  by_key: HashMap<String, RequestId>,
  in_flight: HashMap<RequestId, JoinHandle<()>>,
  seq: u64,
}

/// Tracks request lifecycles and writes successful responses into the
/// object cache.
pub struct RequestTracker {
  state: Mutex<TrackerState>,
  transport: Arc<dyn Transport>,
  cache: Arc<ObjectCache>,
  clock: Arc<dyn Clock>,
  feed: ChangeFeed,
}

impl RequestTracker {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: Arc<ObjectCache>,
    clock: Arc<dyn Clock>,
    feed: ChangeFeed,
  ) -> Self {
    Self {
      state: Mutex::new(TrackerState::default()),
      transport,
      cache,
      clock,
      feed,
    }
  }

  fn lock(&self) -> MutexGuard<'_, TrackerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn cache(&self) -> &Arc<ObjectCache> {
    &self.cache
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  // ==========================================================================
  // Issuing
  // ==========================================================================

  /// Make sure a read for `request` is in flight or answered.
  ///
  /// Returns the pending request for the key when there is one. With
  /// `use_cached_version_if_available`, a fresh successful request whose
  /// payload is still cached is returned as well. Otherwise a new request is
  /// sent.
  pub fn ensure(self: &Arc<Self>, request: RestRequest, options: &RequestOptions) -> Result<RequestId> {
    let key = normalize_key(&request.href)?;
    let now = self.clock.now();

    let id = {
      let mut state = self.lock();
      if let Some(existing) = state.by_key.get(&key).and_then(|id| state.entries.get(id)) {
        if existing.is_pending() {
          debug!(key = %key, request_id = %existing.id, "Joining in-flight request");
          return Ok(existing.id);
        }
        if options.use_cached_version_if_available
          && existing.state_at(now) == RequestState::Success
          && self.result_available(existing)
        {
          debug!(key = %key, request_id = %existing.id, "Reusing fresh response");
          return Ok(existing.id);
        }
      }

      let id = self.track(&mut state, request, key.clone(), options, now);
      state.by_key.insert(key.clone(), id);
      id
    };

    info!(key = %key, request_id = %id, "Request issued");
    self.feed.notify();
    Ok(id)
  }

  /// Whether a completed request's payload can still be read. A payload that
  /// went into the cache is gone once the entry is removed.
  fn result_available(&self, entry: &RequestEntry) -> bool {
    match entry.response.as_ref().and_then(|r| r.payload_link.as_deref()) {
      Some(link) => self.cache.contains(link),
      None => true,
    }
  }

  /// Send a request without deduplication. Used for mutations; the key
  /// index keeps pointing at the latest read.
  pub fn send(self: &Arc<Self>, request: RestRequest, options: &RequestOptions) -> Result<RequestId> {
    let key = normalize_key(&request.href)?;
    let now = self.clock.now();
    let method = request.method;

    let id = {
      let mut state = self.lock();
      let id = self.track(&mut state, request, key.clone(), options, now);
      if method.is_read() {
        state.by_key.insert(key.clone(), id);
      }
      id
    };

    info!(key = %key, request_id = %id, %method, "Request sent");
    self.feed.notify();
    Ok(id)
  }

  fn track(
    self: &Arc<Self>,
    state: &mut TrackerState,
    request: RestRequest,
    key: String,
    options: &RequestOptions,
    now: DateTime<Utc>,
  ) -> RequestId {
    state.seq += 1;
    let id = RequestId::new();
    let entry = RequestEntry::new(
      id,
      state.seq,
      request.clone(),
      key,
      options,
      self.cache.default_ttl(),
      now,
    );
    state.entries.insert(id, entry);

    let tracker = Arc::clone(self);
    let handle = tokio::spawn(async move {
      let response = tracker.transport.send(request);
      tracker.mark_response_pending(id);
      let result = response.await;
      tracker.complete(id, result);
    });
    state.in_flight.insert(id, handle);

    id
  }

  fn mark_response_pending(&self, id: RequestId) {
    let now = self.clock.now();
    let advanced = {
      let mut state = self.lock();
      match state.entries.get_mut(&id) {
        Some(entry) if entry.recorded_state() == RequestState::RequestPending => {
          entry.push(RequestState::ResponsePending, now);
          true
        }
        _ => false,
      }
    };
    if advanced {
      self.feed.notify();
    }
  }

  // ==========================================================================
  // Completion
  // ==========================================================================

  /// Record the outcome of a request.
  ///
  /// Success writes the payload into the cache, unless the request is a read
  /// that a newer request for the same key has superseded. Failure never
  /// touches the cache. Outcomes for unknown (removed) requests are dropped.
  pub fn complete(&self, id: RequestId, result: Result<RawResponse>) {
    let now = self.clock.now();
    let mut state = self.lock();
    state.in_flight.remove(&id);

    let latest = state.entries.get(&id).map(|e| e.key.clone()).and_then(|key| state.by_key.get(&key).copied());
    let Some(entry) = state.entries.get_mut(&id) else {
      debug!(request_id = %id, "Dropping response for abandoned request");
      return;
    };
    if !entry.is_pending() {
      return;
    }

    let supersedable = entry.request.method.is_read();
    let may_write = !supersedable || latest == Some(id);
    if !may_write {
      debug!(key = %entry.key, request_id = %id, "Response superseded; cache left untouched");
    }

    let (new_state, info) = match result {
      Ok(response) if response.is_success() => {
        self.accept(entry, response, may_write, now)
      }
      Ok(response) => {
        let message = error_message(&response);
        warn!(key = %entry.key, request_id = %id, status = response.status, "Request failed: {}", message);
        (
          RequestState::Error,
          ResponseInfo {
            status_code: Some(response.status),
            error_message: Some(message),
            payload_link: None,
            uncacheable: None,
            time_completed: now,
          },
        )
      }
      Err(e) => {
        warn!(key = %entry.key, request_id = %id, "Request failed: {}", e);
        (
          RequestState::Error,
          ResponseInfo {
            status_code: None,
            error_message: Some(e.to_string()),
            payload_link: None,
            uncacheable: None,
            time_completed: now,
          },
        )
      }
    };

    info!(key = %entry.key, request_id = %id, state = %new_state, status = ?info.status_code, "Request completed");
    entry.response = Some(info);
    entry.push(new_state, now);
    drop(state);

    self.feed.notify();
  }

  fn accept(
    &self,
    entry: &RequestEntry,
    response: RawResponse,
    may_write: bool,
    now: DateTime<Utc>,
  ) -> (RequestState, ResponseInfo) {
    let mut info = ResponseInfo {
      status_code: Some(response.status),
      error_message: None,
      payload_link: None,
      uncacheable: None,
      time_completed: now,
    };

    if response.status == 204 || response.body.trim().is_empty() {
      return (RequestState::Success, info);
    }

    let document: Value = match serde_json::from_str(&response.body) {
      Ok(document) => document,
      Err(e) => {
        info.error_message = Some(format!("Failed to parse response body: {}", e));
        return (RequestState::Error, info);
      }
    };

    let link = self_href(&document).and_then(|href| normalize_key(href).ok());
    match link {
      Some(link) => {
        if may_write {
          for embedded in embedded_resources(&document) {
            if let Some(href) = self_href(embedded) {
              self
                .cache
                .put_from_request(href, embedded.clone(), entry.ms_to_live, entry.id, None);
            }
          }
          let alias = (link != entry.key).then_some(entry.key.as_str());
          self
            .cache
            .put_from_request(&link, document, entry.ms_to_live, entry.id, alias);
        }
        info.payload_link = Some(link);
      }
      None => info.uncacheable = Some(document),
    }

    (RequestState::Success, info)
  }

  // ==========================================================================
  // Invalidation
  // ==========================================================================

  /// Mark every request for `key` stale, along with the cached entry.
  /// Idempotent; returns the number of requests that matched.
  pub fn set_stale_by_key(&self, key: &str) -> usize {
    let key = match normalize_key(key) {
      Ok(key) => key,
      Err(_) => return 0,
    };
    let matched = self.invalidate_where(|entry| entry.key == key);
    self.cache.mark_stale(&key);
    debug!(key = %key, matched, "Marked stale by key");
    matched
  }

  /// Mark every request whose key (or payload link) contains `pattern` stale,
  /// along with matching cache entries.
  pub fn set_stale_by_substring(&self, pattern: &str) -> usize {
    let matched = self.invalidate_where(|entry| {
      key_contains(&entry.key, pattern)
        || entry
          .response
          .as_ref()
          .and_then(|r| r.payload_link.as_deref())
          .map_or(false, |link| key_contains(link, pattern))
    });
    let cached = self.cache.mark_stale_by_substring(pattern);
    debug!(pattern, matched, cached, "Marked stale by substring");
    matched
  }

  /// Mark one request stale, along with the cache entry it wrote.
  pub fn set_stale_by_id(&self, id: RequestId) -> bool {
    let link = self.get(id).map(|e| {
      e.response
        .as_ref()
        .and_then(|r| r.payload_link.clone())
        .unwrap_or(e.key)
    });
    let matched = self.invalidate_where(|entry| entry.id == id) > 0;
    if let Some(link) = link {
      if self
        .cache
        .get(&link)
        .map_or(false, |cached| cached.request_id == Some(id))
      {
        self.cache.mark_stale(&link);
      }
    }
    matched
  }

  fn invalidate_where<F>(&self, predicate: F) -> usize
  where
    F: Fn(&RequestEntry) -> bool,
  {
    let now = self.clock.now();
    let (matched, changed) = {
      let mut state = self.lock();
      let mut matched = 0;
      let mut changed = false;
      for entry in state.entries.values_mut().filter(|e| predicate(e)) {
        matched += 1;
        changed |= entry.invalidate(now);
      }
      (matched, changed)
    };
    if changed {
      self.feed.notify();
    }
    matched
  }

  // ==========================================================================
  // Teardown
  // ==========================================================================

  /// Forget a request, abandoning its network call. Cached payloads stay.
  pub fn remove(&self, id: RequestId) -> bool {
    let removed = {
      let mut state = self.lock();
      if let Some(handle) = state.in_flight.remove(&id) {
        handle.abort();
      }
      match state.entries.remove(&id) {
        Some(entry) => {
          if state.by_key.get(&entry.key) == Some(&id) {
            state.by_key.remove(&entry.key);
          }
          true
        }
        None => false,
      }
    };
    if removed {
      debug!(request_id = %id, "Request removed");
      self.feed.notify();
    }
    removed
  }

  /// Forget every request.
  pub fn clear(&self) {
    {
      let mut state = self.lock();
      for (_, handle) in state.in_flight.drain() {
        handle.abort();
      }
      state.entries.clear();
      state.by_key.clear();
    }
    debug!("Request tracker cleared");
    self.feed.notify();
  }

  // ==========================================================================
  // Queries
  // ==========================================================================

  pub fn get(&self, id: RequestId) -> Option<RequestEntry> {
    self.lock().entries.get(&id).cloned()
  }

  /// The most recent read request for a key.
  pub fn latest_for_key(&self, key: &str) -> Option<RequestEntry> {
    let key = normalize_key(key).ok()?;
    let state = self.lock();
    state.by_key.get(&key).and_then(|id| state.entries.get(id)).cloned()
  }

  /// Insertion counter; requests created later have a higher `seq`.
  pub fn current_seq(&self) -> u64 {
    self.lock().seq
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }

  pub fn in_flight(&self) -> usize {
    self.lock().in_flight.len()
  }
}

/// The server's `message` field when the body has one, the reason phrase
/// otherwise.
fn error_message(response: &RawResponse) -> String {
  serde_json::from_str::<Value>(&response.body)
    .ok()
    .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
    .or_else(|| {
      reqwest::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(str::to_string)
    })
    .unwrap_or_else(|| format!("HTTP {}", response.status))
}
