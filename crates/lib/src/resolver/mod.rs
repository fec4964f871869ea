//! Environment resolution.
//!
//! This module orchestrates the full resolution flow:
//!
//! 1. Merge the global manifest, environment manifest, and old lockfile into
//!    a combined registry (pinning every input) and combined query options
//! 2. Partition descriptors into groups and classify each group per system as
//!    locked (its prior resolution is reused) or unlocked
//! 3. Resolve each unlocked group: the prior pin first, then every registry
//!    input in priority order, first success winning
//! 4. Assemble the per-system package maps into a lockfile and prune inputs
//!    no package references
//!
//! The entry point is [`Environment::create_lockfile`].

mod environment;

pub use environment::Environment;

use std::fmt::Write;

use thiserror::Error;

use crate::lockfile::SystemPackages;
use crate::pkgdb::{InputLockError, QueryError};
use crate::types::{GroupName, InstallID};

/// Which groups should ignore their prior pins and re-resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upgrades {
  /// Re-resolve every group.
  All,

  /// Re-resolve only the named groups. Empty upgrades nothing.
  Groups(Vec<GroupName>),
}

impl Default for Upgrades {
  fn default() -> Self {
    Upgrades::Groups(Vec::new())
  }
}

impl Upgrades {
  /// Whether the group `name` is being upgraded.
  pub fn includes(&self, name: &str) -> bool {
    match self {
      Upgrades::All => true,
      Upgrades::Groups(groups) => groups.iter().any(|group| group == name),
    }
  }
}

/// Failed attempts for one group: which install ID missed in which input.
pub type ResolutionFailure = Vec<(InstallID, String)>;

/// Outcome of resolving one group across all candidate inputs.
#[derive(Debug)]
pub enum GroupOutcome {
  /// Every member resolved against one common input.
  Resolved(SystemPackages),

  /// Every candidate input failed; one attempt record per input tried.
  Failed(ResolutionFailure),
}

fn render_failures(failures: &[(GroupName, ResolutionFailure)]) -> String {
  let mut msg = String::new();
  for (name, failure) in failures {
    let _ = writeln!(msg, "  in '{name}':");
    for (iid, url) in failure {
      let _ = writeln!(msg, "    failed to resolve '{iid}' in input '{url}'");
    }
  }
  msg
}

/// Errors surfaced by an [`Environment`].
#[derive(Debug, Error)]
pub enum EnvironmentError {
  /// One or more groups could not be resolved in any input.
  #[error("failed to resolve some package(s):\n{}", render_failures(.0))]
  Resolution(Vec<(GroupName, ResolutionFailure)>),

  /// The combined registry offered no inputs at all.
  #[error("no inputs found to search for packages")]
  NoInputs,

  /// The input-locking collaborator failed.
  #[error("failed to lock input '{name}': {source}")]
  LockInput {
    name: String,
    #[source]
    source: InputLockError,
  },

  /// The package database collaborator failed.
  #[error(transparent)]
  Query(#[from] QueryError),

  /// A logic bug inside the resolver.
  #[error("internal invariant violated: {0}")]
  Invariant(String),
}
