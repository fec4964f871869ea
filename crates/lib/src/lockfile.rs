//! Lockfiles: the persistent artifact binding a manifest to pinned packages.
//!
//! A lockfile records the manifest it was resolved from, the pinned registry
//! of every input referenced by a package, and one package map per system.
//!
//! # Lockfile Format
//!
//! ```json
//! {
//!   "lockfileVersion": 1,
//!   "manifest": { "install": { "hello": { "name": "hello" } } },
//!   "registry": {
//!     "inputs": {
//!       "pkgs": {
//!         "url": "github:example/pkgs?rev=abc123",
//!         "rev": "abc123",
//!         "hash": "sha256-..."
//!       }
//!     }
//!   },
//!   "packages": {
//!     "x86_64-linux": {
//!       "hello": {
//!         "input": { "url": "github:example/pkgs?rev=abc123", "rev": "abc123", "hash": "sha256-..." },
//!         "attrPath": ["legacyPackages", "x86_64-linux", "hello"],
//!         "priority": 5,
//!         "info": { "pname": "hello", "version": "2.12.1" }
//!       },
//!       "ghost": null
//!     }
//!   }
//! }
//! ```
//!
//! A `null` package entry records an optional descriptor that was
//! intentionally left unresolved.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::{InstallDescriptors, ManifestRaw};
use crate::registry::{LockedInput, Registry};
use crate::types::{InstallID, System};

/// Current lockfile format version.
pub const LOCKFILE_VERSION: u32 = 1;

/// A fully-pinned resolved package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedPackage {
  /// The pinned input this package resolves inside.
  pub input: LockedInput,

  /// Absolute attribute path of the package within the input.
  pub attr_path: Vec<String>,

  /// Priority passed through to the environment builder.
  pub priority: u64,

  /// Remaining package metadata as returned by the package database.
  #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
  pub info: serde_json::Map<String, serde_json::Value>,
}

/// Per-system resolution results.
pub type SystemPackages = BTreeMap<InstallID, Option<LockedPackage>>;

/// The serialized lockfile structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockfileRaw {
  pub lockfile_version: u32,

  /// The manifest this lockfile was resolved from.
  pub manifest: ManifestRaw,

  /// The pinned inputs referenced by the package maps.
  #[serde(default)]
  pub registry: Registry<LockedInput>,

  /// Resolutions per system.
  #[serde(default)]
  pub packages: BTreeMap<System, SystemPackages>,
}

impl Default for LockfileRaw {
  fn default() -> Self {
    Self {
      lockfile_version: LOCKFILE_VERSION,
      manifest: ManifestRaw::default(),
      registry: Registry::default(),
      packages: BTreeMap::new(),
    }
  }
}

/// A lockfile with accessors over its raw structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Lockfile {
  raw: LockfileRaw,
}

impl Lockfile {
  pub fn new(raw: LockfileRaw) -> Self {
    Self { raw }
  }

  pub fn raw(&self) -> &LockfileRaw {
    &self.raw
  }

  pub fn into_raw(self) -> LockfileRaw {
    self.raw
  }

  /// The install descriptors of the manifest this lockfile was built from.
  pub fn descriptors(&self) -> &InstallDescriptors {
    &self.raw.manifest.install
  }

  /// The pinned registry recorded in this lockfile.
  pub fn registry(&self) -> &Registry<LockedInput> {
    &self.raw.registry
  }

  /// Drop registry inputs that no locked package references.
  pub fn remove_unused_inputs(&mut self) {
    let used: BTreeSet<String> = self
      .raw
      .packages
      .values()
      .flat_map(|pkgs| pkgs.values())
      .flatten()
      .map(|pkg| pkg.input.url.clone())
      .collect();

    let Registry { inputs, priority } = &mut self.raw.registry;
    inputs.retain(|_, input| used.contains(&input.url));
    priority.retain(|name| inputs.contains_key(name));
  }

  /// Load a lockfile from the given path.
  ///
  /// Returns `Ok(None)` if the file doesn't exist.
  pub fn load(path: &Path) -> Result<Option<Self>, LockfileError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(LockfileError::Read(e)),
    };

    // Check the version before committing to the full structure.
    let value: serde_json::Value = serde_json::from_str(&content).map_err(LockfileError::Parse)?;
    let version = value
      .get("lockfileVersion")
      .and_then(|v| v.as_u64())
      .unwrap_or(0) as u32;
    if version != LOCKFILE_VERSION {
      return Err(LockfileError::UnsupportedVersion(version));
    }

    let raw: LockfileRaw = serde_json::from_value(value).map_err(LockfileError::Parse)?;
    Ok(Some(Self::new(raw)))
  }

  /// Save the lockfile to the given path.
  pub fn save(&self, path: &Path) -> Result<(), LockfileError> {
    let content = serde_json::to_string_pretty(&self.raw).map_err(LockfileError::Serialize)?;
    fs::write(path, content).map_err(LockfileError::Write)?;
    Ok(())
  }
}

/// Errors that can occur when working with lockfiles.
#[derive(Debug, Error)]
pub enum LockfileError {
  /// Failed to read the lockfile.
  #[error("failed to read lockfile: {0}")]
  Read(#[source] io::Error),

  /// Failed to write the lockfile.
  #[error("failed to write lockfile: {0}")]
  Write(#[source] io::Error),

  /// Failed to parse the lockfile JSON.
  #[error("failed to parse lockfile: {0}")]
  Parse(#[source] serde_json::Error),

  /// Failed to serialize the lockfile.
  #[error("failed to serialize lockfile: {0}")]
  Serialize(#[source] serde_json::Error),

  /// Lockfile version is not supported.
  #[error("unsupported lockfile version {0}, expected {LOCKFILE_VERSION}")]
  UnsupportedVersion(u32),
}
