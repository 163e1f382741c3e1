//! HAL document helpers: links, embedded resources, key normalization and
//! URI templates.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use url::{form_urlencoded, Url};

/// Query parameters that select embedded projections and never change which
/// resource a URL names.
const PROJECTION_PARAMS: &[&str] = &["embed", "embed.size"];

// ============================================================================
// Link types
// ============================================================================

/// A single HAL link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HalLink {
  pub href: String,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub templated: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

impl HalLink {
  pub fn new(href: impl Into<String>) -> Self {
    Self {
      href: href.into(),
      templated: false,
      name: None,
    }
  }

  /// The href with any URI template expanded without parameters, so that
  /// optional template parts disappear.
  pub fn resolved_href(&self) -> Result<String> {
    if self.templated {
      expand_template(&self.href, &BTreeMap::new())
    } else {
      Ok(self.href.clone())
    }
  }
}

/// A relation may carry one link or an array of links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkValue {
  One(HalLink),
  Many(Vec<HalLink>),
}

/// The `_links` block of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Links(BTreeMap<String, LinkValue>);

impl Links {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, relation: impl Into<String>, href: impl Into<String>) -> Self {
    self
      .0
      .insert(relation.into(), LinkValue::One(HalLink::new(href)));
    self
  }

  /// The first link for a relation.
  pub fn get(&self, relation: &str) -> Option<&HalLink> {
    match self.0.get(relation)? {
      LinkValue::One(link) => Some(link),
      LinkValue::Many(links) => links.first(),
    }
  }

  /// Every link for a relation, in document order.
  pub fn all(&self, relation: &str) -> Vec<&HalLink> {
    match self.0.get(relation) {
      Some(LinkValue::One(link)) => vec![link],
      Some(LinkValue::Many(links)) => links.iter().collect(),
      None => Vec::new(),
    }
  }

  pub fn self_href(&self) -> Option<&str> {
    self.get("self").map(|l| l.href.as_str())
  }

  pub fn relations(&self) -> impl Iterator<Item = &str> {
    self.0.keys().map(String::as_str)
  }
}

// ============================================================================
// Untyped document access
// ============================================================================

/// The `_links.self.href` of a document.
pub fn self_href(document: &Value) -> Option<&str> {
  link(document, "self").and_then(|l| l.get("href")).and_then(Value::as_str)
}

/// The link object for a relation, taking the first one when the relation
/// holds an array.
pub fn link<'a>(document: &'a Value, relation: &str) -> Option<&'a Value> {
  let value = document.get("_links")?.get(relation)?;
  match value {
    Value::Array(links) => links.first(),
    other => Some(other),
  }
}

/// The `Links` of an untyped document; empty when absent or malformed.
pub fn links_of(document: &Value) -> Links {
  document
    .get("_links")
    .and_then(|raw| serde_json::from_value(raw.clone()).ok())
    .unwrap_or_default()
}

/// Every resource nested under `_embedded`, depth first.
pub fn embedded_resources(document: &Value) -> Vec<&Value> {
  let mut found = Vec::new();
  collect_embedded(document, &mut found);
  found
}

fn collect_embedded<'a>(document: &'a Value, found: &mut Vec<&'a Value>) {
  let Some(embedded) = document.get("_embedded").and_then(Value::as_object) else {
    return;
  };

  for value in embedded.values() {
    match value {
      Value::Object(_) => {
        found.push(value);
        collect_embedded(value, found);
      }
      Value::Array(items) => {
        for item in items.iter().filter(|i| i.is_object()) {
          found.push(item);
          collect_embedded(item, found);
        }
      }
      _ => {}
    }
  }
}

// ============================================================================
// Keys and templates
// ============================================================================

/// Normalize an href into a cache key.
///
/// Drops the fragment, projection parameters and a trailing slash. Absolute
/// URLs are parsed and re-serialized; relative keys are kept as written.
pub fn normalize_key(href: &str) -> Result<String> {
  let href = href.trim();
  if href.is_empty() {
    return Err(eyre!("Cannot build a resource key from an empty href"));
  }
  if href.contains('{') {
    return Err(eyre!("Unexpanded URI template in href: {}", href));
  }

  let without_fragment = href.split('#').next().unwrap_or(href);

  if let Ok(mut url) = Url::parse(without_fragment) {
    let kept: Vec<(String, String)> = url
      .query_pairs()
      .filter(|(k, _)| !PROJECTION_PARAMS.contains(&&**k))
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    if kept.is_empty() {
      url.set_query(None);
    } else {
      url.query_pairs_mut().clear().extend_pairs(kept);
    }
    let path = url.path().trim_end_matches('/').to_string();
    if !path.is_empty() {
      url.set_path(&path);
    }
    let mut key = url.to_string();
    if url.query().is_none() && key.ends_with('/') {
      key.pop();
    }
    return Ok(key);
  }

  let (path, query) = match without_fragment.split_once('?') {
    Some((path, query)) => (path, Some(query)),
    None => (without_fragment, None),
  };
  let path = path.trim_end_matches('/');
  let kept: Vec<&str> = query
    .map(|q| {
      q.split('&')
        .filter(|pair| {
          let name = pair.split('=').next().unwrap_or("");
          !pair.is_empty() && !PROJECTION_PARAMS.contains(&name)
        })
        .collect()
    })
    .unwrap_or_default();

  if kept.is_empty() {
    Ok(path.to_string())
  } else {
    Ok(format!("{}?{}", path, kept.join("&")))
  }
}

/// Substring match against a normalized key. Normalization drops a trailing
/// slash from the path, so the key is also tried with it put back: the
/// pattern `items/` matches the collection key `items`.
pub fn key_contains(key: &str, pattern: &str) -> bool {
  if key.contains(pattern) {
    return true;
  }
  let slashed = match key.split_once('?') {
    Some((path, query)) => format!("{}/?{}", path, query),
    None => format!("{}/", key),
  };
  slashed.contains(pattern)
}

/// Expand a HAL URI template.
///
/// Supports simple `{name}` expressions, which are required, and the
/// optional query forms `{?a,b}` and `{&a,b}`.
pub fn expand_template(template: &str, params: &BTreeMap<String, String>) -> Result<String> {
  let mut out = String::with_capacity(template.len());
  let mut rest = template;
  let mut has_query = template.split('{').next().unwrap_or("").contains('?');

  while let Some(start) = rest.find('{') {
    out.push_str(&rest[..start]);
    let end = rest[start..]
      .find('}')
      .map(|e| start + e)
      .ok_or_else(|| eyre!("Unterminated expression in URI template: {}", template))?;
    let expression = &rest[start + 1..end];

    match expression.chars().next() {
      Some(op @ ('?' | '&')) => {
        let pairs: Vec<String> = expression[1..]
          .split(',')
          .map(str::trim)
          .filter_map(|name| params.get(name).map(|v| (name, v)))
          .map(|(name, value)| format!("{}={}", name, encode(value)))
          .collect();
        if !pairs.is_empty() {
          let lead = if op == '?' && !has_query { '?' } else { '&' };
          out.push(lead);
          out.push_str(&pairs.join("&"));
          has_query = true;
        }
      }
      _ => {
        let name = expression.trim();
        let value = params
          .get(name)
          .ok_or_else(|| eyre!("Missing required parameter '{}' for {}", name, template))?;
        out.push_str(&encode(value));
      }
    }

    rest = &rest[end + 1..];
  }
  out.push_str(rest);

  Ok(out)
}

/// Resolve a possibly relative href against a base URL.
pub fn resolve_href(base: &str, href: &str) -> Result<String> {
  if Url::parse(href).is_ok() {
    return Ok(href.to_string());
  }
  let mut base = Url::parse(base).map_err(|e| eyre!("Invalid base URL '{}': {}", base, e))?;
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  base
    .join(href.trim_start_matches('/'))
    .map(|u| u.to_string())
    .map_err(|e| eyre!("Cannot resolve '{}' against '{}': {}", href, base, e))
}

fn encode(value: &str) -> String {
  form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
