//! Package database collaborator seams.
//!
//! The resolver never opens a package database itself. It reaches its
//! collaborators through the traits here:
//!
//! - [`InputLocker`] pins a symbolic input reference to an immutable revision
//! - [`PkgDbProvider`] opens a queryable input for a pinned reference
//! - [`PkgDbInput`] couples a pinned input with its read-only database
//! - [`PackageDb`] answers ranked queries and yields package metadata rows
//!
//! One collaborator value usually implements both [`InputLocker`] and
//! [`PkgDbProvider`]; the resolver is generic over it.

use thiserror::Error;

use crate::manifest::Options;
use crate::registry::{LockedInput, RegistryInput};
use crate::types::{Subtree, System};

/// Identifier of one candidate row in a package database.
pub type RowId = u64;

/// A package query, built from combined options, input restrictions, and one
/// descriptor's constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct PkgQueryArgs {
  /// Match by package name.
  pub name: Option<String>,

  /// Match by exact attribute path below the subtree and system.
  pub rel_path: Option<Vec<String>>,

  /// Exact version match.
  pub version: Option<String>,

  /// Semver range expression.
  pub semver: Option<String>,

  /// Restrict matches to these subtrees.
  pub subtrees: Option<Vec<Subtree>>,

  /// Systems to search. The resolver always narrows this to one system
  /// before executing a query.
  pub systems: Vec<System>,

  pub allow_unfree: bool,
  pub allow_broken: bool,
  pub licenses: Option<Vec<String>>,
  pub prefer_pre_releases: bool,
}

impl Default for PkgQueryArgs {
  fn default() -> Self {
    Self {
      name: None,
      rel_path: None,
      version: None,
      semver: None,
      subtrees: None,
      systems: Vec::new(),
      allow_unfree: true,
      allow_broken: false,
      licenses: None,
      prefer_pre_releases: false,
    }
  }
}

impl From<&Options> for PkgQueryArgs {
  fn from(options: &Options) -> Self {
    let allow = options.allow.as_ref();
    let semver = options.semver.as_ref();
    Self {
      systems: options.systems.clone().unwrap_or_default(),
      allow_unfree: allow.and_then(|allow| allow.unfree).unwrap_or(true),
      allow_broken: allow.and_then(|allow| allow.broken).unwrap_or(false),
      licenses: allow.and_then(|allow| allow.licenses.clone()),
      prefer_pre_releases: semver
        .and_then(|semver| semver.prefer_pre_releases)
        .unwrap_or(false),
      ..Self::default()
    }
  }
}

/// Error from the input-locking collaborator, propagated unchanged.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InputLockError(pub String);

/// Errors surfaced by a package database.
#[derive(Debug, Error)]
pub enum QueryError {
  /// The database could not be opened or queried.
  #[error("package database error: {0}")]
  Database(String),

  /// A metadata row lacked a field the resolver requires.
  #[error("package metadata missing field '{field}'")]
  MissingField { field: &'static str },

  /// A metadata field failed to decode.
  #[error("malformed package metadata: {0}")]
  Metadata(#[source] serde_json::Error),
}

/// Pins a symbolic input reference to an immutable revision.
pub trait InputLocker {
  /// Produce a fully-pinned reference for `input`.
  ///
  /// Deterministic for a given input; may perform network I/O.
  /// Implementations carry the input's `subtrees` restriction through to the
  /// result.
  fn lock_input(&self, name: &str, input: &RegistryInput) -> Result<LockedInput, InputLockError>;
}

/// Opens package database inputs for pinned references.
pub trait PkgDbProvider {
  type Input: PkgDbInput;

  /// Open a package database input for `locked`.
  ///
  /// `name` is the registry name when the input came from a registry, `None`
  /// when it was reconstructed from a prior lock entry.
  fn open_input(&self, name: Option<&str>, locked: &LockedInput) -> Result<Self::Input, QueryError>;
}

/// One queryable input: a pinned source plus its read-only database.
pub trait PkgDbInput {
  type Db: PackageDb;

  /// The registry name this input was opened under, if any.
  fn name(&self) -> Option<&str>;

  /// The pinned reference backing this input.
  fn locked_input(&self) -> &LockedInput;

  /// Imprint input-level restrictions (e.g. subtrees) onto a query.
  fn fill_pkg_query_args(&self, args: &mut PkgQueryArgs);

  /// The input's read-only database.
  fn db(&self) -> &Self::Db;

  /// Ensure the database covers `systems`. One-shot and idempotent.
  fn scrape_systems(&mut self, systems: &[System]) -> Result<(), QueryError>;

  /// Whether two handles point at the same pinned artifact.
  fn same_input(&self, other: &Self) -> bool {
    let (a, b) = (self.locked_input(), other.locked_input());
    a.url == b.url && a.rev == b.rev
  }
}

/// A read-only package database.
pub trait PackageDb {
  /// Execute `args`, returning candidate rows ranked best-first.
  fn query(&self, args: &PkgQueryArgs) -> Result<Vec<RowId>, QueryError>;

  /// Fetch the metadata record for `row`.
  fn get_package(&self, row: RowId) -> Result<serde_json::Map<String, serde_json::Value>, QueryError>;
}
