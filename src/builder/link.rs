//! Lazy resolution of declared link relations.

use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::remote_data_build::{json_decoder, list_decoder, failed_stream, Decoder, RemoteDataBuilder};
use crate::cache::{RelationDescriptor, Resource, ResourceDescriptor};
use crate::hal::{self, HalLink};
use crate::remote::{PaginatedList, RemoteData};
use crate::request::RequestOptions;

/// A relation read off a payload. Nothing is fetched until `stream` is
/// called; every stream for the same href shares one request and the cached
/// result.
pub struct LinkHandle<T> {
  builder: RemoteDataBuilder,
  href: Result<String, String>,
  options: RequestOptions,
  decode: Decoder<T>,
}

impl<T: Send + 'static> LinkHandle<T> {
  /// The href the relation points at, when it could be resolved.
  pub fn href(&self) -> Option<&str> {
    self.href.as_deref().ok()
  }

  /// Why the relation cannot be followed, if it cannot.
  pub fn error(&self) -> Option<&str> {
    self.href.as_ref().err().map(String::as_str)
  }

  pub fn with_options(mut self, options: RequestOptions) -> Self {
    self.options = options;
    self
  }

  /// Resolve the relation through the builder.
  pub fn stream(&self) -> BoxStream<'static, RemoteData<T>> {
    match &self.href {
      Ok(href) => self
        .builder
        .observe_key(href, &self.options, self.decode.clone(), true),
      Err(message) => failed_stream(message.clone(), self.builder.now()),
    }
  }
}

impl RemoteDataBuilder {
  /// Handle for a single-resource relation declared on `R`.
  pub fn resolve_link<R, T>(&self, resource: &R, relation: &str) -> LinkHandle<T>
  where
    R: Resource,
    T: DeserializeOwned + Send + 'static,
  {
    let href = declared_href(&R::descriptor(), resource.links().get(relation), relation);
    self.link_handle(href, json_decoder())
  }

  /// Handle for a list relation declared on `R`.
  pub fn resolve_list_link<R, T>(
    &self,
    resource: &R,
    relation: &str,
  ) -> LinkHandle<PaginatedList<T>>
  where
    R: Resource,
    T: DeserializeOwned + Send + 'static,
  {
    let href = declared_href(&R::descriptor(), resource.links().get(relation), relation);
    self.link_handle(href, list_decoder())
  }

  /// Untyped variant: the payload's `type` field selects the descriptor from
  /// the registry.
  pub fn resolve_link_value(&self, payload: &Value, relation: &str) -> LinkHandle<Value> {
    let links = hal::links_of(payload);
    let href = match payload.get("type").and_then(Value::as_str) {
      Some(type_name) => match self.registry().get(type_name) {
        Some(descriptor) => declared_href(descriptor, links.get(relation), relation),
        None => Err(format!("Unknown resource type '{}'", type_name)),
      },
      None => Err("Payload has no 'type' field".to_string()),
    };
    self.link_handle(href, json_decoder())
  }

  /// The relation descriptor behind `relation` for an untyped payload.
  pub fn relation_of(&self, payload: &Value, relation: &str) -> Option<RelationDescriptor> {
    let type_name = payload.get("type").and_then(Value::as_str)?;
    self
      .registry()
      .get(type_name)?
      .find_relation(relation)
      .cloned()
  }

  fn link_handle<T>(&self, href: Result<String, String>, decode: Decoder<T>) -> LinkHandle<T> {
    LinkHandle {
      builder: self.clone(),
      href,
      options: self.default_options(),
      decode,
    }
  }
}

fn declared_href(
  descriptor: &ResourceDescriptor,
  link: Option<&HalLink>,
  relation: &str,
) -> Result<String, String> {
  if descriptor.find_relation(relation).is_none() {
    return Err(format!(
      "Relation '{}' is not declared on '{}'",
      relation, descriptor.type_name
    ));
  }
  let link = link.ok_or_else(|| {
    format!(
      "The '{}' resource has no '{}' link",
      descriptor.type_name, relation
    )
  })?;
  link.resolved_href().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::config::Config;
  use crate::hal::Links;
  use crate::remote::RemoteDataStreamExt;
  use crate::session::Session;
  use crate::transport::mock::MockTransport;
  use chrono::Utc;
  use futures::StreamExt;
  use serde::Deserialize;
  use serde_json::json;
  use std::sync::Arc;

  #[derive(Debug, Deserialize)]
  struct Item {
    #[serde(rename = "_links")]
    links: Links,
  }

  impl Resource for Item {
    fn descriptor() -> ResourceDescriptor {
      ResourceDescriptor::new("item")
        .relation(RelationDescriptor::one("owner", "person"))
        .relation(RelationDescriptor::list("bundles", "bundle"))
        .relation(RelationDescriptor::one("thumbnail", "bitstream"))
    }

    fn links(&self) -> &Links {
      &self.links
    }
  }

  #[derive(Debug, PartialEq, Deserialize)]
  struct Person {
    name: String,
  }

  fn session() -> (Session, MockTransport) {
    let transport = MockTransport::new();
    let mut config = Config::for_url("https://rest.api/server/api");
    config.resources.push(
      ResourceDescriptor::new("item").relation(RelationDescriptor::one("owner", "person")),
    );
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let session = Session::with_clock(&config, Arc::new(transport.clone()), clock);
    (session, transport)
  }

  fn item_payload() -> Value {
    json!({
      "type": "item",
      "_links": {
        "self": { "href": "items/1" },
        "owner": { "href": "people/9" },
        "bundles": { "href": "items/1/bundles{?page,size}", "templated": true }
      }
    })
  }

  fn person() -> Value {
    json!({ "name": "Ada", "_links": { "self": { "href": "people/9" } } })
  }

  #[tokio::test]
  async fn test_link_is_lazy_and_read_once() {
    let (session, transport) = session();
    transport.respond_json("people/9", 200, person());
    let item: Item = serde_json::from_value(item_payload()).unwrap();

    let handle = session.builder().resolve_link::<Item, Person>(&item, "owner");
    assert_eq!(handle.href(), Some("people/9"));
    assert_eq!(transport.calls(), 0);

    let first = handle.stream().first_succeeded().next().await.unwrap();
    let second = handle.stream().first_succeeded().next().await.unwrap();
    assert_eq!(first.payload(), Some(&Person { name: "Ada".into() }));
    assert_eq!(first.payload(), second.payload());
    assert_eq!(transport.calls(), 1);
  }

  #[tokio::test]
  async fn test_undeclared_relation_is_an_error() {
    let (session, transport) = session();
    let item: Item = serde_json::from_value(item_payload()).unwrap();

    let handle = session.builder().resolve_link::<Item, Person>(&item, "parent");
    assert!(handle.href().is_none());
    assert!(handle.error().unwrap().contains("not declared"));

    let rd = handle.stream().next().await.unwrap();
    assert!(rd.is_error());
    assert_eq!(transport.calls(), 0);
  }

  #[tokio::test]
  async fn test_absent_link_is_an_error() {
    let (session, _) = session();
    let item: Item = serde_json::from_value(item_payload()).unwrap();

    let handle = session.builder().resolve_link::<Item, Value>(&item, "thumbnail");
    let rd = handle.stream().next().await.unwrap();
    assert!(rd.is_error());
    assert!(rd.error_message().unwrap().contains("no 'thumbnail' link"));
  }

  #[tokio::test]
  async fn test_list_relation_with_template() {
    let (session, transport) = session();
    transport.respond_json(
      "items/1/bundles",
      200,
      json!({
        "_links": { "self": { "href": "items/1/bundles" } },
        "_embedded": { "bundles": [{ "name": "ORIGINAL" }] },
        "page": { "size": 20, "totalElements": 1, "totalPages": 1, "number": 0 }
      }),
    );
    let item: Item = serde_json::from_value(item_payload()).unwrap();

    let handle = session
      .builder()
      .resolve_list_link::<Item, Person>(&item, "bundles");
    assert_eq!(handle.href(), Some("items/1/bundles"));

    let rd = handle.stream().first_succeeded().next().await.unwrap();
    let list = rd.payload().unwrap();
    assert_eq!(list.page, vec![Person { name: "ORIGINAL".into() }]);
  }

  #[tokio::test]
  async fn test_untyped_link_uses_registry() {
    let (session, transport) = session();
    transport.respond_json("people/9", 200, person());
    let builder = session.builder();

    let handle = builder.resolve_link_value(&item_payload(), "owner");
    let rd = handle.stream().first_succeeded().next().await.unwrap();
    assert_eq!(rd.payload().unwrap()["name"], "Ada");
    assert!(builder.relation_of(&item_payload(), "owner").is_some());

    // declared on the typed descriptor only, not in the registry
    let handle = builder.resolve_link_value(&item_payload(), "bundles");
    assert!(handle.error().is_some());

    let handle = builder.resolve_link_value(&json!({ "type": "bitstream" }), "owner");
    assert!(handle.error().unwrap().contains("Unknown resource type"));
  }
}
