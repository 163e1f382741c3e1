//! Resource descriptors: the schema that ties a payload type to its
//! declared fields and link relations.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

use crate::hal::Links;

/// A declared link relation on a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDescriptor {
  /// Relation name as it appears under `_links`
  pub name: String,
  /// Resource type the relation points at
  pub target_type: String,
  /// Whether the relation resolves to a paginated list
  #[serde(default)]
  pub is_list: bool,
}

impl RelationDescriptor {
  pub fn one(name: impl Into<String>, target_type: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      target_type: target_type.into(),
      is_list: false,
    }
  }

  pub fn list(name: impl Into<String>, target_type: impl Into<String>) -> Self {
    Self {
      is_list: true,
      ..Self::one(name, target_type)
    }
  }
}

/// Schema of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
  /// Value of the payload's `type` field
  pub type_name: String,
  #[serde(default)]
  pub fields: Vec<String>,
  #[serde(default)]
  pub relations: Vec<RelationDescriptor>,
}

impl ResourceDescriptor {
  pub fn new(type_name: impl Into<String>) -> Self {
    Self {
      type_name: type_name.into(),
      fields: Vec::new(),
      relations: Vec::new(),
    }
  }

  pub fn field(mut self, name: impl Into<String>) -> Self {
    self.fields.push(name.into());
    self
  }

  pub fn relation(mut self, relation: RelationDescriptor) -> Self {
    self.relations.push(relation);
    self
  }

  pub fn find_relation(&self, name: &str) -> Option<&RelationDescriptor> {
    self.relations.iter().find(|r| r.name == name)
  }
}

/// A typed resource that can be decoded from a HAL payload.
///
/// Implementors declare their schema once; the builder uses it to decide
/// which relations may be resolved.
pub trait Resource: DeserializeOwned + Send + Sync + 'static {
  fn descriptor() -> ResourceDescriptor;

  fn links(&self) -> &Links;
}

/// Descriptors for every resource type known to a session, keyed by type
/// name.
#[derive(Debug, Clone, Default)]
pub struct DescriptorRegistry {
  descriptors: HashMap<String, ResourceDescriptor>,
}

impl DescriptorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register or replace a descriptor.
  pub fn register(&mut self, descriptor: ResourceDescriptor) {
    self
      .descriptors
      .insert(descriptor.type_name.clone(), descriptor);
  }

  pub fn register_resource<R: Resource>(&mut self) {
    self.register(R::descriptor());
  }

  pub fn get(&self, type_name: &str) -> Option<&ResourceDescriptor> {
    self.descriptors.get(type_name)
  }

  pub fn len(&self) -> usize {
    self.descriptors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.descriptors.is_empty()
  }
}

impl FromIterator<ResourceDescriptor> for DescriptorRegistry {
  fn from_iter<I: IntoIterator<Item = ResourceDescriptor>>(iter: I) -> Self {
    let mut registry = Self::new();
    for descriptor in iter {
      registry.register(descriptor);
    }
    registry
  }
}
