//! The context every consumer receives: one cache, one tracker and one
//! builder sharing a clock and a change feed.

use std::sync::Arc;
use tracing::info;

use crate::builder::RemoteDataBuilder;
use crate::cache::{DescriptorRegistry, ObjectCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::event::ChangeFeed;
use crate::request::{RequestOptions, RequestTracker};
use crate::service::DataService;
use crate::transport::Transport;

pub struct Session {
  cache: Arc<ObjectCache>,
  tracker: Arc<RequestTracker>,
  builder: RemoteDataBuilder,
  feed: ChangeFeed,
}

impl Session {
  /// Start a session on the wall clock.
  pub fn start(config: &Config, transport: Arc<dyn Transport>) -> Self {
    Self::with_clock(config, transport, Arc::new(SystemClock))
  }

  pub fn with_clock(config: &Config, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
    let feed = ChangeFeed::new();
    let cache = Arc::new(ObjectCache::new(
      Arc::clone(&clock),
      feed.clone(),
      config.cache.ttl(),
    ));
    let tracker = Arc::new(RequestTracker::new(
      transport,
      Arc::clone(&cache),
      Arc::clone(&clock),
      feed.clone(),
    ));
    let registry: Arc<DescriptorRegistry> = Arc::new(config.registry());
    let builder = RemoteDataBuilder::new(
      Arc::clone(&tracker),
      registry,
      clock,
      feed.clone(),
      config.cache.request_options(),
    );

    info!(
      api = %config.api.url,
      ms_to_live = config.cache.ms_to_live,
      "Session started"
    );

    Self {
      cache,
      tracker,
      builder,
      feed,
    }
  }

  pub fn cache(&self) -> &Arc<ObjectCache> {
    &self.cache
  }

  pub fn tracker(&self) -> &Arc<RequestTracker> {
    &self.tracker
  }

  pub fn builder(&self) -> &RemoteDataBuilder {
    &self.builder
  }

  pub fn feed(&self) -> &ChangeFeed {
    &self.feed
  }

  pub fn default_options(&self) -> RequestOptions {
    self.builder.default_options()
  }

  /// A data service for one endpoint.
  pub fn service(&self, endpoint: impl Into<String>) -> DataService {
    DataService::new(self.builder.clone(), endpoint)
  }

  /// Abandon every in-flight request. Cached payloads are kept.
  pub fn shutdown(&self) {
    self.tracker.clear();
    info!("Session shut down");
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    self.tracker.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::mock::MockTransport;
  use serde_json::Value;

  #[tokio::test]
  async fn test_shutdown_abandons_requests_and_keeps_cache() {
    let transport = MockTransport::new();
    let mut config = Config::for_url("https://rest.api/server/api");
    config.cache.re_request_on_stale = false;
    let session = Session::start(&config, Arc::new(transport.clone()));
    assert!(!session.default_options().re_request_on_stale);

    session.cache().put(
      "items/1",
      serde_json::json!({ "id": 1 }),
      config.cache.ttl(),
      chrono::Utc::now(),
    );
    transport.hold();
    let _pending = session
      .builder()
      .from_key::<Value>("items/2", &session.default_options());
    assert_eq!(session.tracker().in_flight(), 1);

    session.shutdown();
    assert_eq!(session.tracker().in_flight(), 0);
    assert!(session.tracker().is_empty());
    assert!(session.cache().contains("items/1"));
    transport.release();
  }
}
