//! Lifecycle states of a tracked request.
//!
//! Every derivation here is a total function over the six states. "Nothing
//! known yet" is not a state: it is the absence of a snapshot.

use serde::{Deserialize, Serialize};

/// The state of a tracked request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
  /// Request recorded, transport not yet called
  RequestPending,
  /// Transport accepted the call, waiting for the response
  ResponsePending,
  /// Response received and usable
  Success,
  /// Successful response whose time to live has elapsed
  SuccessStale,
  /// Request failed
  Error,
  /// Failed response whose time to live has elapsed
  ErrorStale,
}

impl RequestState {
  pub fn is_request_pending(self) -> bool {
    matches!(self, RequestState::RequestPending)
  }

  pub fn is_response_pending(self) -> bool {
    matches!(self, RequestState::ResponsePending)
  }

  /// Either of the pending states.
  pub fn is_loading(self) -> bool {
    self.is_request_pending() || self.is_response_pending()
  }

  pub fn is_success(self) -> bool {
    matches!(self, RequestState::Success)
  }

  pub fn is_success_stale(self) -> bool {
    matches!(self, RequestState::SuccessStale)
  }

  pub fn is_error(self) -> bool {
    matches!(self, RequestState::Error)
  }

  pub fn is_error_stale(self) -> bool {
    matches!(self, RequestState::ErrorStale)
  }

  /// Either of the stale states.
  pub fn is_stale(self) -> bool {
    self.is_success_stale() || self.is_error_stale()
  }

  pub fn has_completed(self) -> bool {
    !self.is_loading()
  }

  /// True for `Success` and `SuccessStale`.
  pub fn has_succeeded(self) -> bool {
    self.is_success() || self.is_success_stale()
  }

  /// True for `Error` and `ErrorStale`.
  pub fn has_failed(self) -> bool {
    self.is_error() || self.is_error_stale()
  }

  /// The stale counterpart of a terminal state. Pending states have none and
  /// are returned unchanged.
  pub fn to_stale(self) -> Self {
    match self {
      RequestState::Success => RequestState::SuccessStale,
      RequestState::Error => RequestState::ErrorStale,
      other => other,
    }
  }
}

impl std::fmt::Display for RequestState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let label = match self {
      RequestState::RequestPending => "request pending",
      RequestState::ResponsePending => "response pending",
      RequestState::Success => "success",
      RequestState::SuccessStale => "success (stale)",
      RequestState::Error => "error",
      RequestState::ErrorStale => "error (stale)",
    };
    f.write_str(label)
  }
}
