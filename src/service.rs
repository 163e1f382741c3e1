//! Generic data service for one REST endpoint.

use futures::future::join_all;
use futures::stream::{BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::builder::{failed_stream, RemoteDataBuilder};
use crate::remote::{PaginatedList, RemoteData, RemoteDataStreamExt};
use crate::request::RequestOptions;
use crate::transport::RestRequest;

/// Paging and sorting for list reads. `current_page` is 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindListOptions {
  pub current_page: Option<u32>,
  pub elements_per_page: Option<u32>,
  /// Sort expression as the API expects it, e.g. `name,ASC`
  pub sort: Option<String>,
  pub search_params: Vec<(String, String)>,
}

impl FindListOptions {
  pub fn page(current_page: u32, elements_per_page: u32) -> Self {
    Self {
      current_page: Some(current_page),
      elements_per_page: Some(elements_per_page),
      ..Self::default()
    }
  }
}

/// Reads, list reads, invalidation and deletes for one endpoint.
#[derive(Clone)]
pub struct DataService {
  builder: RemoteDataBuilder,
  endpoint: String,
}

impl DataService {
  pub fn new(builder: RemoteDataBuilder, endpoint: impl Into<String>) -> Self {
    Self {
      builder,
      endpoint: endpoint.into().trim_end_matches('/').to_string(),
    }
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// Append paging, sorting and search parameters to an href. Pages go out
  /// 0-based.
  pub fn build_href_from_find_options(&self, href: &str, options: &FindListOptions) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    for (name, value) in &options.search_params {
      query.append_pair(name, value);
    }
    if let Some(page) = options.current_page {
      query.append_pair("page", &page.saturating_sub(1).to_string());
    }
    if let Some(size) = options.elements_per_page {
      query.append_pair("size", &size.to_string());
    }
    if let Some(sort) = &options.sort {
      query.append_pair("sort", sort);
    }

    let query = query.finish();
    if query.is_empty() {
      href.to_string()
    } else if href.contains('?') {
      format!("{}&{}", href, query)
    } else {
      format!("{}?{}", href, query)
    }
  }

  pub fn find_by_href<T>(&self, href: &str, options: &RequestOptions) -> BoxStream<'static, RemoteData<T>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.builder.from_key(href, options)
  }

  pub fn find_by_id<T>(&self, id: &str, options: &RequestOptions) -> BoxStream<'static, RemoteData<T>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    if id.trim().is_empty() {
      return failed_stream("Cannot look up a resource without an id", self.builder.now());
    }
    self.find_by_href(&format!("{}/{}", self.endpoint, id), options)
  }

  pub fn find_list_by_href<T>(
    &self,
    href: &str,
    find: &FindListOptions,
    options: &RequestOptions,
  ) -> BoxStream<'static, RemoteData<PaginatedList<T>>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    let href = self.build_href_from_find_options(href, find);
    self.builder.build_list(&href, options)
  }

  pub fn find_all<T>(
    &self,
    find: &FindListOptions,
    options: &RequestOptions,
  ) -> BoxStream<'static, RemoteData<PaginatedList<T>>>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.find_list_by_href(&self.endpoint, find, options)
  }

  /// Mark `href` stale along with everything registered as depending on it,
  /// then forget those dependency edges. Returns the number of requests
  /// marked.
  pub fn invalidate_by_href(&self, href: &str) -> usize {
    let tracker = self.builder.tracker();
    let cache = tracker.cache();

    let mut marked = tracker.set_stale_by_key(href);
    for dependent in cache.dependents_of(href) {
      marked += tracker.set_stale_by_key(&dependent);
    }
    cache.remove_dependents(href);

    debug!(href, marked, "Invalidated by href");
    marked
  }

  /// Invalidating `depends_on` will also invalidate `href`.
  pub fn add_dependency(&self, href: &str, depends_on: &str) {
    self.builder.tracker().cache().add_dependency(href, depends_on);
  }

  /// Delete a resource. On success every key under this endpoint is marked
  /// stale.
  pub async fn delete_by_href(&self, href: &str) -> RemoteData<()> {
    let outcome = self.send_delete(href).await;
    if outcome.has_succeeded() == Some(true) {
      self.invalidate_endpoint();
    }
    outcome
  }

  /// Delete several resources concurrently. Each outcome is independent; the
  /// endpoint is invalidated once if any delete succeeded.
  pub async fn delete_all(&self, hrefs: &[String]) -> Vec<RemoteData<()>> {
    let outcomes = join_all(hrefs.iter().map(|href| self.send_delete(href))).await;
    if outcomes.iter().any(|o| o.has_succeeded() == Some(true)) {
      self.invalidate_endpoint();
    }
    outcomes
  }

  async fn send_delete(&self, href: &str) -> RemoteData<()> {
    let options = RequestOptions {
      re_request_on_stale: false,
      ..self.builder.default_options()
    };
    let id = match self.builder.tracker().send(RestRequest::delete(href), &options) {
      Ok(id) => id,
      Err(e) => return RemoteData::failed(e.to_string(), None, self.builder.now()),
    };

    let outcome = self
      .builder
      .build_from_request_id::<Value>(id)
      .first_completed()
      .next()
      .await;

    match outcome {
      Some(rd) => rd.map(|_| ()),
      None => RemoteData::failed(
        format!("Delete of {} was abandoned", href),
        None,
        self.builder.now(),
      ),
    }
  }

  fn invalidate_endpoint(&self) {
    let marked = self.builder.tracker().set_stale_by_substring(&self.endpoint);
    info!(endpoint = %self.endpoint, marked, "Endpoint invalidated");
  }
}
