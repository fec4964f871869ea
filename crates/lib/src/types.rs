//! Shared identifier types used across the resolver.

use serde::{Deserialize, Serialize};

/// A target system identifier, e.g. `x86_64-linux`.
pub type System = String;

/// The key under which one install request appears in a manifest.
pub type InstallID = String;

/// The name of a descriptor group.
pub type GroupName = String;

/// Group name applied to descriptors that declare no explicit group.
pub const DEFAULT_GROUP_NAME: &str = "default";

/// A package database subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subtree {
  #[serde(rename = "legacyPackages")]
  LegacyPackages,
  #[serde(rename = "packages")]
  Packages,
  #[serde(rename = "catalog")]
  Catalog,
}

/// The system string for the platform the resolver is running on.
///
/// Used when a manifest does not name an explicit system set.
pub fn current_system() -> System {
  format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}
