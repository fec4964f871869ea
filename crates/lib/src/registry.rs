//! Input registries.
//!
//! A registry is an ordered mapping from input names to inputs. Iteration
//! order is the registry's priority order: names listed in `priority` first,
//! then the remaining names in sorted order.
//!
//! Registries come in two states: [`Registry<RegistryInput>`] holds symbolic
//! references as written in a manifest, [`Registry<LockedInput>`] holds the
//! same inputs once every one of them is pinned to an immutable revision.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Subtree;

/// A symbolic, unpinned reference to an input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryInput {
  /// The input's URL, possibly carrying a symbolic ref.
  pub url: String,

  /// Restricts which subtrees of this input may be queried.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subtrees: Option<Vec<Subtree>>,
}

impl RegistryInput {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      subtrees: None,
    }
  }

  /// Overlay `other` onto this input.
  ///
  /// `url` always wins; `subtrees` wins only when `other` sets it.
  pub fn merge(&mut self, other: RegistryInput) {
    self.url = other.url;
    if other.subtrees.is_some() {
      self.subtrees = other.subtrees;
    }
  }
}

/// An input pinned to an immutable revision and content hash.
///
/// Re-fetching a locked input yields bit-identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedInput {
  /// The fully-pinned URL.
  pub url: String,

  /// Immutable revision identifier.
  pub rev: String,

  /// Content hash of the pinned input.
  pub hash: String,

  /// Subtree restriction carried over from the unlocked input.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subtrees: Option<Vec<Subtree>>,
}

/// An ordered mapping of input names to inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry<I> {
  #[serde(default = "BTreeMap::new")]
  pub inputs: BTreeMap<String, I>,

  /// Names to consult first, in order. Names absent from `inputs` are ignored.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub priority: Vec<String>,
}

impl<I> Default for Registry<I> {
  fn default() -> Self {
    Self {
      inputs: BTreeMap::new(),
      priority: Vec::new(),
    }
  }
}

impl<I> Registry<I> {
  /// Iterate inputs in priority order.
  pub fn iter(&self) -> impl Iterator<Item = (&String, &I)> {
    self
      .priority
      .iter()
      .filter_map(|name| self.inputs.get_key_value(name))
      .chain(self.inputs.iter().filter(|(name, _)| !self.priority.contains(name)))
  }
}

impl Registry<RegistryInput> {
  /// Right-merge `other` over this registry.
  ///
  /// The result holds the union of names; on conflict `other`'s entry wins
  /// field-wise. A non-empty priority list in `other` replaces this one's.
  pub fn merge(&mut self, other: Registry<RegistryInput>) {
    let Registry { inputs, priority } = other;
    for (name, input) in inputs {
      match self.inputs.get_mut(&name) {
        Some(existing) => existing.merge(input),
        None => {
          self.inputs.insert(name, input);
        }
      }
    }
    if !priority.is_empty() {
      self.priority = priority;
    }
  }
}
