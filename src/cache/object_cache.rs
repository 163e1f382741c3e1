//! In-memory object cache keyed by normalized resource key.
//!
//! Entries are whole HAL documents. A write replaces the previous entry for
//! its key; field-level changes go through `add_patch` and are applied on
//! read. Staleness is computed from the clock at read time, so entries never
//! expire on their own.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::event::ChangeFeed;
use crate::hal::{key_contains, normalize_key};
use crate::request::RequestId;

/// A field-level change to a cached document, addressed by JSON pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
  Add { path: String, value: Value },
  Replace { path: String, value: Value },
  Remove { path: String },
}

/// Snapshot of a cache entry as handed out by `get`. The payload already has
/// pending patches applied.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub payload: Value,
  pub time_added: DateTime<Utc>,
  pub ms_to_live: Duration,
  /// Request that wrote this entry, if it came from the tracker
  pub request_id: Option<RequestId>,
  pub alternative_links: Vec<String>,
  /// Monotonic per cache; a higher generation is a later write
  pub generation: u64,
  pub marked_stale: bool,
}

impl CacheEntry {
  /// Closed bound: an entry whose age equals its TTL is stale.
  pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
    self.marked_stale || now - self.time_added >= self.ms_to_live
  }
}

#[derive(Debug)]
struct StoredEntry {
  payload: Value,
  time_added: DateTime<Utc>,
  ms_to_live: Duration,
  request_id: Option<RequestId>,
  alternative_links: Vec<String>,
  generation: u64,
  marked_stale: bool,
  patches: Vec<PatchOperation>,
}

#[derive(Debug, Default)]
struct CacheState {
  entries: HashMap<String, StoredEntry>,
  /// alternative link -> key
  aliases: HashMap<String, String>,
  /// key -> keys that depend on it
  dependents: HashMap<String, BTreeSet<String>>,
  generation: u64,
}

impl CacheState {
  fn resolve(&self, key: &str) -> Option<String> {
    if self.entries.contains_key(key) {
      return Some(key.to_string());
    }
    self.aliases.get(key).cloned()
  }

  fn drop_entry(&mut self, key: &str) -> bool {
    match self.entries.remove(key) {
      Some(entry) => {
        for alias in entry.alternative_links {
          if self.aliases.get(&alias).map(String::as_str) == Some(key) {
            self.aliases.remove(&alias);
          }
        }
        self.dependents.remove(key);
        self.dependents.retain(|_, keys| {
          keys.remove(key);
          !keys.is_empty()
        });
        true
      }
      None => false,
    }
  }
}

/// The shared object cache.
pub struct ObjectCache {
  state: Mutex<CacheState>,
  clock: Arc<dyn Clock>,
  feed: ChangeFeed,
  default_ttl: Duration,
}

impl ObjectCache {
  pub fn new(clock: Arc<dyn Clock>, feed: ChangeFeed, default_ttl: Duration) -> Self {
    Self {
      state: Mutex::new(CacheState::default()),
      clock,
      feed,
      default_ttl,
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Look up an entry by key or alternative link.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    let key = canonical(key);
    let state = self.lock();
    let resolved = state.resolve(&key)?;
    let stored = state.entries.get(&resolved)?;

    let mut payload = stored.payload.clone();
    for op in &stored.patches {
      if let Err(e) = apply_patch(&mut payload, op) {
        warn!(key = %resolved, "Skipping cache patch: {}", e);
      }
    }

    Some(CacheEntry {
      key: resolved,
      payload,
      time_added: stored.time_added,
      ms_to_live: stored.ms_to_live,
      request_id: stored.request_id,
      alternative_links: stored.alternative_links.clone(),
      generation: stored.generation,
      marked_stale: stored.marked_stale,
    })
  }

  /// Convenience for `get(key).map(|e| e.payload)`.
  pub fn get_payload(&self, key: &str) -> Option<Value> {
    self.get(key).map(|entry| entry.payload)
  }

  pub fn contains(&self, key: &str) -> bool {
    let key = canonical(key);
    self.lock().resolve(&key).is_some()
  }

  /// Upsert an entry, replacing whatever was stored for the key. Returns the
  /// generation assigned to the write.
  pub fn put(
    &self,
    key: &str,
    payload: Value,
    ms_to_live: Duration,
    time_added: DateTime<Utc>,
  ) -> u64 {
    self.write(canonical(key), payload, ms_to_live, time_added, None, None)
  }

  /// Write a payload that arrived as the response to a tracked request.
  ///
  /// `alternative_link` is the href the request was made for, when it
  /// differs from the payload's self link.
  pub fn put_from_request(
    &self,
    key: &str,
    payload: Value,
    ms_to_live: Duration,
    request_id: RequestId,
    alternative_link: Option<&str>,
  ) -> u64 {
    let time_added = self.clock.now();
    let alias = alternative_link.map(canonical);
    self.write(
      canonical(key),
      payload,
      ms_to_live,
      time_added,
      Some(request_id),
      alias,
    )
  }

  fn write(
    &self,
    key: String,
    payload: Value,
    ms_to_live: Duration,
    time_added: DateTime<Utc>,
    request_id: Option<RequestId>,
    alias: Option<String>,
  ) -> u64 {
    let generation = {
      let mut state = self.lock();
      state.generation += 1;
      let generation = state.generation;

      let mut alternative_links = state
        .entries
        .get(&key)
        .map(|prior| prior.alternative_links.clone())
        .unwrap_or_default();
      if let Some(alias) = alias.filter(|a| *a != key) {
        if !alternative_links.contains(&alias) {
          alternative_links.push(alias.clone());
        }
        state.aliases.insert(alias, key.clone());
      }

      state.entries.insert(
        key.clone(),
        StoredEntry {
          payload,
          time_added,
          ms_to_live,
          request_id,
          alternative_links,
          generation,
          marked_stale: false,
          patches: Vec::new(),
        },
      );
      generation
    };

    debug!(key = %key, generation, "Cached resource");
    self.feed.notify();
    generation
  }

  /// Whether the entry for `key` is stale now. A missing key is stale.
  pub fn is_stale(&self, key: &str) -> bool {
    let now = self.clock.now();
    self.get(key).map_or(true, |entry| entry.is_stale_at(now))
  }

  pub fn remove(&self, key: &str) -> bool {
    let key = canonical(key);
    let removed = {
      let mut state = self.lock();
      match state.resolve(&key) {
        Some(resolved) => state.drop_entry(&resolved),
        None => false,
      }
    };
    if removed {
      debug!(key = %key, "Removed cached resource");
      self.feed.notify();
    }
    removed
  }

  /// Remove every entry whose key or alternative link contains `pattern`.
  pub fn remove_by_substring(&self, pattern: &str) -> usize {
    let removed = {
      let mut state = self.lock();
      let keys = matching_keys(&state, pattern);
      for key in &keys {
        state.drop_entry(key);
      }
      keys.len()
    };
    if removed > 0 {
      debug!(pattern, removed, "Removed cached resources by substring");
      self.feed.notify();
    }
    removed
  }

  /// Explicitly mark an entry stale. Idempotent.
  pub fn mark_stale(&self, key: &str) -> bool {
    let key = canonical(key);
    let changed = {
      let mut state = self.lock();
      let Some(resolved) = state.resolve(&key) else {
        return false;
      };
      match state.entries.get_mut(&resolved) {
        Some(entry) if !entry.marked_stale => {
          entry.marked_stale = true;
          true
        }
        _ => false,
      }
    };
    if changed {
      self.feed.notify();
    }
    changed
  }

  /// Mark every entry whose key or alternative link contains `pattern`.
  /// Returns the number of entries that matched.
  pub fn mark_stale_by_substring(&self, pattern: &str) -> usize {
    let (matched, changed) = {
      let mut state = self.lock();
      let keys = matching_keys(&state, pattern);
      let mut changed = false;
      for key in &keys {
        if let Some(entry) = state.entries.get_mut(key) {
          changed |= !entry.marked_stale;
          entry.marked_stale = true;
        }
      }
      (keys.len(), changed)
    };
    if changed {
      self.feed.notify();
    }
    matched
  }

  /// Queue field-level operations on a cached document. They apply on read
  /// until the next `put` for the key. Returns false when the key is unknown.
  pub fn add_patch(&self, key: &str, operations: Vec<PatchOperation>) -> bool {
    let key = canonical(key);
    let added = {
      let mut state = self.lock();
      let Some(resolved) = state.resolve(&key) else {
        return false;
      };
      match state.entries.get_mut(&resolved) {
        Some(entry) => {
          entry.patches.extend(operations);
          true
        }
        None => false,
      }
    };
    if added {
      self.feed.notify();
    }
    added
  }

  /// Record that `key` depends on `depends_on`: invalidating the dependents
  /// of `depends_on` will reach `key`.
  pub fn add_dependency(&self, key: &str, depends_on: &str) {
    let (key, depends_on) = (canonical(key), canonical(depends_on));
    self.lock().dependents.entry(depends_on).or_default().insert(key);
  }

  pub fn dependents_of(&self, key: &str) -> Vec<String> {
    self
      .lock()
      .dependents
      .get(&canonical(key))
      .map(|set| set.iter().cloned().collect())
      .unwrap_or_default()
  }

  /// Forget the dependency edges pointing at `key`.
  pub fn remove_dependents(&self, key: &str) {
    self.lock().dependents.remove(&canonical(key));
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().entries.is_empty()
  }

  pub fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = self.lock().entries.keys().cloned().collect();
    keys.sort();
    keys
  }
}

/// Cache keys are normalized when possible. Cache operations never fail, so
/// an href that cannot be normalized is used as written.
fn canonical(key: &str) -> String {
  normalize_key(key).unwrap_or_else(|_| key.trim().to_string())
}

fn matching_keys(state: &CacheState, pattern: &str) -> Vec<String> {
  state
    .entries
    .iter()
    .filter(|(key, entry)| {
      key_contains(key, pattern)
        || entry
          .alternative_links
          .iter()
          .any(|a| key_contains(a, pattern))
    })
    .map(|(key, _)| key.clone())
    .collect()
}

// ============================================================================
// Patch application
// ============================================================================

fn apply_patch(document: &mut Value, op: &PatchOperation) -> Result<()> {
  match op {
    PatchOperation::Replace { path, value } => {
      let target = document
        .pointer_mut(path)
        .ok_or_else(|| eyre!("No value at {}", path))?;
      *target = value.clone();
      Ok(())
    }
    PatchOperation::Add { path, value } => {
      let (parent, token) = split_pointer(path)?;
      match document.pointer_mut(&parent) {
        Some(Value::Object(map)) => {
          map.insert(token, value.clone());
          Ok(())
        }
        Some(Value::Array(items)) => {
          if token == "-" {
            items.push(value.clone());
            return Ok(());
          }
          let index = array_index(&token, items.len() + 1)?;
          items.insert(index, value.clone());
          Ok(())
        }
        _ => Err(eyre!("Cannot add at {}", path)),
      }
    }
    PatchOperation::Remove { path } => {
      let (parent, token) = split_pointer(path)?;
      match document.pointer_mut(&parent) {
        Some(Value::Object(map)) => map
          .remove(&token)
          .map(|_| ())
          .ok_or_else(|| eyre!("No value at {}", path)),
        Some(Value::Array(items)) => {
          let index = array_index(&token, items.len())?;
          items.remove(index);
          Ok(())
        }
        _ => Err(eyre!("Cannot remove at {}", path)),
      }
    }
  }
}

fn split_pointer(path: &str) -> Result<(String, String)> {
  let (parent, token) = path
    .rsplit_once('/')
    .ok_or_else(|| eyre!("Invalid JSON pointer: {}", path))?;
  Ok((
    parent.to_string(),
    token.replace("~1", "/").replace("~0", "~"),
  ))
}

fn array_index(token: &str, bound: usize) -> Result<usize> {
  token
    .parse::<usize>()
    .ok()
    .filter(|i| *i < bound)
    .ok_or_else(|| eyre!("Invalid array index: {}", token))
}
