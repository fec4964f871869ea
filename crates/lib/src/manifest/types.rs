//! Manifest types: install descriptors, options, and the raw manifest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pkgdb::PkgQueryArgs;
use crate::registry::{Registry, RegistryInput};
use crate::types::{DEFAULT_GROUP_NAME, GroupName, InstallID, Subtree, System, current_system};

/// Priority applied to descriptors that do not set one.
pub const DEFAULT_PRIORITY: u64 = 5;

/// A user-written package request in a manifest.
///
/// All match fields are optional; an empty descriptor matches nothing useful,
/// so callers set at least `name` or `pkgPath`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestDescriptor {
  /// Match by package name.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,

  /// Match by exact attribute path below the subtree and system.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pkg_path: Option<Vec<String>>,

  /// Exact version match.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,

  /// Semver range expression.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub semver: Option<String>,

  /// Restrict matches to a single subtree.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subtree: Option<Subtree>,

  /// Resolve only in the named registry input.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub input: Option<String>,

  /// The group this descriptor resolves with. Absent means `default`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub group: Option<GroupName>,

  /// Restrict the systems this descriptor applies to. Absent means all.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub systems: Option<Vec<System>>,

  /// A resolution miss for this descriptor is non-fatal.
  pub optional: bool,

  /// Passed through to the environment builder; does not affect resolution.
  pub priority: u64,
}

impl Default for ManifestDescriptor {
  fn default() -> Self {
    Self {
      name: None,
      pkg_path: None,
      version: None,
      semver: None,
      subtree: None,
      input: None,
      group: None,
      systems: None,
      optional: false,
      priority: DEFAULT_PRIORITY,
    }
  }
}

impl ManifestDescriptor {
  /// Imprint this descriptor's constraints onto a query.
  pub fn fill_pkg_query_args(&self, args: &mut PkgQueryArgs) {
    args.name = self.name.clone();
    args.rel_path = self.pkg_path.clone();
    args.version = self.version.clone();
    args.semver = self.semver.clone();
    if let Some(subtree) = self.subtree {
      args.subtrees = Some(vec![subtree]);
    }
  }
}

/// Ordered mapping install ID -> descriptor.
pub type InstallDescriptors = BTreeMap<InstallID, ManifestDescriptor>;

/// Mapping group name -> member descriptors.
pub type Groups = BTreeMap<GroupName, InstallDescriptors>;

/// Allow/deny filters applied to every query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Allows {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub unfree: Option<bool>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub broken: Option<bool>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub licenses: Option<Vec<String>>,
}

impl Allows {
  fn merge(&mut self, other: Allows) {
    if other.unfree.is_some() {
      self.unfree = other.unfree;
    }
    if other.broken.is_some() {
      self.broken = other.broken;
    }
    if other.licenses.is_some() {
      self.licenses = other.licenses;
    }
  }
}

/// Semver resolution preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SemverOptions {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub prefer_pre_releases: Option<bool>,
}

impl SemverOptions {
  fn merge(&mut self, other: SemverOptions) {
    if other.prefer_pre_releases.is_some() {
      self.prefer_pre_releases = other.prefer_pre_releases;
    }
  }
}

/// Query options, merged across the global manifest, the old lockfile's
/// manifest, and the environment manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
  /// The systems the environment resolves for.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub systems: Option<Vec<System>>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub allow: Option<Allows>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub semver: Option<SemverOptions>,
}

impl Options {
  /// Overlay `other` onto this set; fields set in `other` win.
  pub fn merge(&mut self, other: Options) {
    if other.systems.is_some() {
      self.systems = other.systems;
    }
    match (&mut self.allow, other.allow) {
      (Some(allow), Some(other)) => allow.merge(other),
      (allow @ None, Some(other)) => *allow = Some(other),
      (_, None) => {}
    }
    match (&mut self.semver, other.semver) {
      (Some(semver), Some(other)) => semver.merge(other),
      (semver @ None, Some(other)) => *semver = Some(other),
      (_, None) => {}
    }
  }
}

/// The raw, declarative manifest being resolved.
///
/// Also used for the global manifest, which typically carries only a registry
/// and options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestRaw {
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub install: InstallDescriptors,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub registry: Option<Registry<RegistryInput>>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub options: Option<Options>,
}

impl ManifestRaw {
  /// Partition the install descriptors into their resolution groups.
  pub fn grouped_descriptors(&self) -> Groups {
    let mut groups = Groups::new();
    for (iid, descriptor) in &self.install {
      let name = descriptor
        .group
        .clone()
        .unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string());
      groups.entry(name).or_default().insert(iid.clone(), descriptor.clone());
    }
    groups
  }

  /// The systems this manifest resolves for.
  pub fn systems(&self) -> Vec<System> {
    self
      .options
      .as_ref()
      .and_then(|options| options.systems.clone())
      .unwrap_or_else(|| vec![current_system()])
  }
}
