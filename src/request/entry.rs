//! Tracked request records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::remote::RequestState;
use crate::transport::RestRequest;

/// Identifier of a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for RequestId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for RequestId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Per-call knobs, defaulted from the `cache` section of the config.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
  /// Reuse a fresh successful response for the same key instead of sending
  pub use_cached_version_if_available: bool,
  /// Re-issue the request in the background when a stale snapshot is read
  pub re_request_on_stale: bool,
  /// TTL for the response; the cache default when unset
  pub ms_to_live: Option<Duration>,
}

impl Default for RequestOptions {
  fn default() -> Self {
    Self {
      use_cached_version_if_available: true,
      re_request_on_stale: true,
      ms_to_live: None,
    }
  }
}

impl RequestOptions {
  /// Options that always hit the network.
  pub fn bypass_cache(mut self) -> Self {
    self.use_cached_version_if_available = false;
    self
  }
}

/// One step in a request's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
  pub state: RequestState,
  pub at: DateTime<Utc>,
}

/// Response metadata kept on the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseInfo {
  pub status_code: Option<u16>,
  pub error_message: Option<String>,
  /// Cache key of the payload when the response carried a self link
  pub payload_link: Option<String>,
  /// Body of a successful response without a self link
  pub uncacheable: Option<Value>,
  pub time_completed: DateTime<Utc>,
}

/// A tracked request and its transition history.
#[derive(Debug, Clone)]
pub struct RequestEntry {
  pub id: RequestId,
  /// Tracker-wide insertion order
  pub seq: u64,
  pub request: RestRequest,
  /// Normalized key of the request href
  pub key: String,
  pub transitions: Vec<Transition>,
  pub response: Option<ResponseInfo>,
  pub invalidated: bool,
  pub re_request_on_stale: bool,
  pub ms_to_live: Duration,
}

impl RequestEntry {
  pub(crate) fn new(
    id: RequestId,
    seq: u64,
    request: RestRequest,
    key: String,
    options: &RequestOptions,
    default_ttl: Duration,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id,
      seq,
      request,
      key,
      transitions: vec![Transition {
        state: RequestState::RequestPending,
        at: now,
      }],
      response: None,
      invalidated: false,
      re_request_on_stale: options.re_request_on_stale,
      ms_to_live: options.ms_to_live.unwrap_or(default_ttl),
    }
  }

  /// The last recorded state, without TTL evaluation.
  pub fn recorded_state(&self) -> RequestState {
    self
      .transitions
      .last()
      .map(|t| t.state)
      .unwrap_or(RequestState::RequestPending)
  }

  pub fn is_pending(&self) -> bool {
    self.recorded_state().is_loading()
  }

  pub fn last_updated(&self) -> DateTime<Utc> {
    self
      .transitions
      .last()
      .map(|t| t.at)
      .unwrap_or_else(Utc::now)
  }

  /// State as observed at `now`. A completed request turns stale once it was
  /// explicitly invalidated or its age reaches the TTL.
  pub fn state_at(&self, now: DateTime<Utc>) -> RequestState {
    let state = self.recorded_state();
    if !state.has_completed() || state.is_stale() {
      return state;
    }
    if self.invalidated || self.is_expired(now) {
      state.to_stale()
    } else {
      state
    }
  }

  fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self
      .response
      .as_ref()
      .map_or(false, |r| now - r.time_completed >= self.ms_to_live)
  }

  pub(crate) fn push(&mut self, state: RequestState, at: DateTime<Utc>) {
    self.transitions.push(Transition { state, at });
  }

  /// Mark explicitly stale, recording the stale transition once.
  pub(crate) fn invalidate(&mut self, at: DateTime<Utc>) -> bool {
    let state = self.recorded_state();
    self.invalidated = true;
    if state.has_completed() && !state.is_stale() {
      self.push(state.to_stale(), at);
      true
    } else {
      false
    }
  }
}
