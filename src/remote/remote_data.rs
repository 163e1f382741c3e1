//! Immutable snapshots of a remote resource.

use chrono::{DateTime, Duration, Utc};

use super::state::RequestState;

/// A point-in-time view of a remote resource: its request state, payload and
/// the bookkeeping needed to judge freshness.
///
/// Instances are never mutated; every change produces a new snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteData<T> {
  time_completed: Option<DateTime<Utc>>,
  ms_to_live: Option<Duration>,
  last_updated: DateTime<Utc>,
  state: RequestState,
  error_message: Option<String>,
  payload: Option<T>,
  status_code: Option<u16>,
}

impl<T> RemoteData<T> {
  pub fn new(
    time_completed: Option<DateTime<Utc>>,
    ms_to_live: Option<Duration>,
    last_updated: DateTime<Utc>,
    state: RequestState,
    error_message: Option<String>,
    payload: Option<T>,
    status_code: Option<u16>,
  ) -> Self {
    Self {
      time_completed,
      ms_to_live,
      last_updated,
      state,
      error_message,
      payload,
      status_code,
    }
  }

  /// A snapshot for a request that has not been answered yet.
  pub fn pending(last_updated: DateTime<Utc>) -> Self {
    Self::new(
      None,
      None,
      last_updated,
      RequestState::RequestPending,
      None,
      None,
      None,
    )
  }

  /// A successful snapshot completed at `at`.
  pub fn succeeded(payload: T, at: DateTime<Utc>) -> Self {
    Self::new(
      Some(at),
      None,
      at,
      RequestState::Success,
      None,
      Some(payload),
      Some(200),
    )
  }

  /// A failed snapshot completed at `at`.
  pub fn failed(message: impl Into<String>, status_code: Option<u16>, at: DateTime<Utc>) -> Self {
    Self::new(
      Some(at),
      None,
      at,
      RequestState::Error,
      Some(message.into()),
      None,
      status_code,
    )
  }

  pub fn time_completed(&self) -> Option<DateTime<Utc>> {
    self.time_completed
  }

  pub fn ms_to_live(&self) -> Option<Duration> {
    self.ms_to_live
  }

  pub fn last_updated(&self) -> DateTime<Utc> {
    self.last_updated
  }

  pub fn state(&self) -> RequestState {
    self.state
  }

  pub fn error_message(&self) -> Option<&str> {
    self.error_message.as_deref()
  }

  /// The payload, if any. Only meaningful once `has_succeeded()` is
  /// `Some(true)`; a completed snapshot may still carry no payload (204).
  pub fn payload(&self) -> Option<&T> {
    self.payload.as_ref()
  }

  pub fn into_payload(self) -> Option<T> {
    self.payload
  }

  pub fn status_code(&self) -> Option<u16> {
    self.status_code
  }

  pub fn is_request_pending(&self) -> bool {
    self.state.is_request_pending()
  }

  pub fn is_response_pending(&self) -> bool {
    self.state.is_response_pending()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_success_stale(&self) -> bool {
    self.state.is_success_stale()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn is_error_stale(&self) -> bool {
    self.state.is_error_stale()
  }

  pub fn is_stale(&self) -> bool {
    self.state.is_stale()
  }

  pub fn has_completed(&self) -> bool {
    self.state.has_completed()
  }

  /// `None` while loading, so "still loading" can never be mistaken for an
  /// answer.
  pub fn has_succeeded(&self) -> Option<bool> {
    if self.is_loading() {
      None
    } else {
      Some(self.state.has_succeeded())
    }
  }

  /// `None` while loading.
  pub fn has_failed(&self) -> Option<bool> {
    if self.is_loading() {
      None
    } else {
      Some(self.state.has_failed())
    }
  }

  /// The server answered 204. Independent of `state`.
  pub fn has_no_content(&self) -> bool {
    self.status_code == Some(204)
  }

  /// Project the payload into another type, keeping every other field.
  pub fn map<U, F>(self, f: F) -> RemoteData<U>
  where
    F: FnOnce(T) -> U,
  {
    RemoteData {
      time_completed: self.time_completed,
      ms_to_live: self.ms_to_live,
      last_updated: self.last_updated,
      state: self.state,
      error_message: self.error_message,
      payload: self.payload.map(f),
      status_code: self.status_code,
    }
  }

  /// Like `map`, but the projection may fail; a failure turns the snapshot
  /// into an `Error` carrying the message and no payload.
  pub fn try_map<U, E, F>(self, f: F) -> RemoteData<U>
  where
    F: FnOnce(T) -> Result<U, E>,
    E: std::fmt::Display,
  {
    let RemoteData {
      time_completed,
      ms_to_live,
      last_updated,
      state,
      error_message,
      payload,
      status_code,
    } = self;

    match payload.map(f) {
      Some(Err(e)) => RemoteData {
        time_completed,
        ms_to_live,
        last_updated,
        state: RequestState::Error,
        error_message: Some(e.to_string()),
        payload: None,
        status_code,
      },
      Some(Ok(value)) => RemoteData {
        time_completed,
        ms_to_live,
        last_updated,
        state,
        error_message,
        payload: Some(value),
        status_code,
      },
      None => RemoteData {
        time_completed,
        ms_to_live,
        last_updated,
        state,
        error_message,
        payload: None,
        status_code,
      },
    }
  }
}
