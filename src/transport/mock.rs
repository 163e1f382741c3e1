//! Scripted transport for tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::{Method, RawResponse, RestRequest, Transport};

#[derive(Clone)]
enum Scripted {
  Respond(RawResponse),
  Fail(String),
}

/// Responds from a table keyed by `(method, href)`. Responses can be held
/// back with `hold` until `release` is called.
#[derive(Clone)]
pub struct MockTransport {
  responses: Arc<Mutex<HashMap<(Method, String), Scripted>>>,
  calls: Arc<AtomicUsize>,
  log: Arc<Mutex<Vec<RestRequest>>>,
  gate: Arc<watch::Sender<bool>>,
}

impl MockTransport {
  pub fn new() -> Self {
    let (gate, _) = watch::channel(true);
    Self {
      responses: Arc::new(Mutex::new(HashMap::new())),
      calls: Arc::new(AtomicUsize::new(0)),
      log: Arc::new(Mutex::new(Vec::new())),
      gate: Arc::new(gate),
    }
  }

  fn script(&self, method: Method, href: &str, scripted: Scripted) {
    self
      .responses
      .lock()
      .unwrap()
      .insert((method, href.to_string()), scripted);
  }

  pub fn respond_json(&self, href: &str, status: u16, body: Value) {
    self.script(
      Method::Get,
      href,
      Scripted::Respond(RawResponse::new(status, body.to_string())),
    );
  }

  pub fn respond_raw(&self, method: Method, href: &str, status: u16, body: &str) {
    self.script(method, href, Scripted::Respond(RawResponse::new(status, body)));
  }

  pub fn fail(&self, href: &str, message: &str) {
    self.script(Method::Get, href, Scripted::Fail(message.to_string()));
  }

  /// Park every response until `release`.
  pub fn hold(&self) {
    self.gate.send_replace(false);
  }

  pub fn release(&self) {
    self.gate.send_replace(true);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn calls_to(&self, href: &str) -> usize {
    self
      .log
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.href == href)
      .count()
  }
}

impl Transport for MockTransport {
  fn send(&self, request: RestRequest) -> BoxFuture<'static, Result<RawResponse>> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.log.lock().unwrap().push(request.clone());
    let scripted = self
      .responses
      .lock()
      .unwrap()
      .get(&(request.method, request.href.clone()))
      .cloned();
    let mut gate = self.gate.subscribe();

    async move {
      gate
        .wait_for(|open| *open)
        .await
        .map_err(|e| eyre!("Mock gate closed: {}", e))?;
      match scripted {
        Some(Scripted::Respond(response)) => Ok(response),
        Some(Scripted::Fail(message)) => Err(eyre!(message)),
        None => Ok(RawResponse::new(404, r#"{"message":"Not Found"}"#)),
      }
    }
    .boxed()
  }
}
