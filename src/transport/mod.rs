//! The boundary to the network: a request goes in, a response or a failure
//! comes out.

pub mod http;
#[cfg(test)]
pub(crate) mod mock;

use color_eyre::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub use http::HttpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Only reads are deduplicated and cached.
  pub fn is_read(&self) -> bool {
    matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    };
    write!(f, "{}", s)
  }
}

/// A request handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
  pub method: Method,
  pub href: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Value>,
}

impl RestRequest {
  pub fn new(method: Method, href: impl Into<String>) -> Self {
    Self {
      method,
      href: href.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(href: impl Into<String>) -> Self {
    Self::new(Method::Get, href)
  }

  pub fn delete(href: impl Into<String>) -> Self {
    Self::new(Method::Delete, href)
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }
}

/// What came back over the wire, whatever the status.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: String,
}

impl RawResponse {
  pub fn new(status: u16, body: impl Into<String>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Sends requests. Non-2xx responses resolve to `Ok`; `Err` means no HTTP
/// response was obtained at all.
pub trait Transport: Send + Sync + 'static {
  fn send(&self, request: RestRequest) -> BoxFuture<'static, Result<RawResponse>>;
}
