//! The environment resolver state machine.
//!
//! An [`Environment`] combines a manifest, an optional global manifest, and
//! an optional prior lockfile, then resolves every descriptor group per
//! system against the combined input registry. Combined state (registry,
//! options, base query args, opened package databases) is computed at most
//! once; an environment is single-use.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::lockfile::{LOCKFILE_VERSION, LockedPackage, Lockfile, LockfileRaw, SystemPackages};
use crate::manifest::{Groups, InstallDescriptors, ManifestDescriptor, ManifestRaw, Options};
use crate::pkgdb::{InputLocker, PackageDb, PkgDbInput, PkgDbProvider, PkgQueryArgs, QueryError, RowId};
use crate::registry::{LockedInput, Registry};
use crate::types::{GroupName, InstallID, System};

use super::{EnvironmentError, GroupOutcome, ResolutionFailure, Upgrades};

/// Outcome of resolving a group against a single input: either every member
/// locked, or the first install ID that missed.
#[derive(Debug)]
enum GroupResolution {
  Resolved(SystemPackages),
  Miss(InstallID),
}

/// A descriptor skips `system` when it names a system set excluding it.
fn system_skipped(system: &System, systems: &Option<Vec<System>>) -> bool {
  systems.as_ref().is_some_and(|systems| !systems.contains(system))
}

/// Whether `new` and `old` describe the same package.
///
/// Compares the fields that control what the package *is*. Grouping and
/// resolution-failure behavior (`group`, `optional`, `systems`) do not change
/// the package; `priority` never affects resolution.
fn same_package(new: &ManifestDescriptor, old: &ManifestDescriptor) -> bool {
  new.name == old.name
    && new.pkg_path == old.pkg_path
    && new.version == old.version
    && new.semver == old.semver
    && new.subtree == old.subtree
    && new.input == old.input
}

/// Whether a descriptor is unchanged against its lockfile counterpart for the
/// purposes of keeping the existing lock, projected onto `system`.
///
/// Membership of `system` in the old and new system sets must agree (an
/// absent set means all systems); changes affecting only other systems are
/// ignored, as is `priority`.
fn descriptor_unchanged(system: &System, new: &ManifestDescriptor, old: &ManifestDescriptor) -> bool {
  same_package(new, old)
    && new.group == old.group
    && new.optional == old.optional
    && system_skipped(system, &new.systems) == system_skipped(system, &old.systems)
}

/// A single-use resolution context.
///
/// Construct with [`Environment::new`], optionally attach a global manifest,
/// a prior lockfile, and upgrade requests, then call
/// [`Environment::create_lockfile`].
pub struct Environment<P>
where
  P: PkgDbProvider + InputLocker,
{
  global_manifest: Option<ManifestRaw>,
  manifest: ManifestRaw,
  old_lockfile: Option<Lockfile>,
  upgrades: Upgrades,
  provider: P,

  // Write-once caches; never recomputed after first use.
  combined_registry: Option<Registry<LockedInput>>,
  combined_options: Option<Options>,
  base_query_args: Option<PkgQueryArgs>,
  pkg_dbs: Option<Vec<P::Input>>,
  lockfile_raw: Option<LockfileRaw>,
}

impl<P> Environment<P>
where
  P: PkgDbProvider + InputLocker,
{
  pub fn new(manifest: ManifestRaw, provider: P) -> Self {
    Self {
      global_manifest: None,
      manifest,
      old_lockfile: None,
      upgrades: Upgrades::default(),
      provider,
      combined_registry: None,
      combined_options: None,
      base_query_args: None,
      pkg_dbs: None,
      lockfile_raw: None,
    }
  }

  /// Attach a global manifest whose registry and options sit below the
  /// environment manifest's.
  pub fn with_global_manifest(mut self, global: ManifestRaw) -> Self {
    self.global_manifest = Some(global);
    self
  }

  /// Attach the lockfile from a previous resolve; its pins are reused
  /// wherever descriptors are unchanged.
  pub fn with_old_lockfile(mut self, lockfile: Lockfile) -> Self {
    self.old_lockfile = Some(lockfile);
    self
  }

  /// Request that some or all groups ignore their prior pins.
  pub fn with_upgrades(mut self, upgrades: Upgrades) -> Self {
    self.upgrades = upgrades;
    self
  }

  /// The systems this environment resolves for.
  pub fn systems(&self) -> Vec<System> {
    self.manifest.systems()
  }

  fn upgrading_group(&self, name: &str) -> bool {
    self.upgrades.includes(name)
  }

  fn old_manifest(&self) -> Option<&ManifestRaw> {
    self.old_lockfile.as_ref().map(|lockfile| &lockfile.raw().manifest)
  }

  /// Merge the global and environment registries and pin every input.
  ///
  /// Inputs whose name appears in the old lockfile keep their old pin, even
  /// if their URL changed; everything else is locked fresh. Computed once.
  pub fn combined_registry(&mut self) -> Result<Registry<LockedInput>, EnvironmentError> {
    if let Some(registry) = &self.combined_registry {
      return Ok(registry.clone());
    }

    let mut raw = match &self.global_manifest {
      Some(global) => {
        let mut merged = global.registry.clone().unwrap_or_default();
        merged.merge(self.manifest.registry.clone().unwrap_or_default());
        merged
      }
      None => self.manifest.registry.clone().unwrap_or_default(),
    };

    let mut locked = Registry {
      inputs: BTreeMap::new(),
      priority: std::mem::take(&mut raw.priority),
    };
    for (name, input) in &raw.inputs {
      let old_pin = self
        .old_lockfile
        .as_ref()
        .and_then(|lockfile| lockfile.registry().inputs.get(name));
      let entry = match old_pin {
        Some(pinned) => pinned.clone(),
        None => {
          debug!(input = %name, url = %input.url, "locking input");
          self
            .provider
            .lock_input(name, input)
            .map_err(|source| EnvironmentError::LockInput {
              name: name.clone(),
              source,
            })?
        }
      };
      locked.inputs.insert(name.clone(), entry);
    }

    self.combined_registry = Some(locked.clone());
    Ok(locked)
  }

  /// Merge options: global first, then the old lockfile's manifest, then the
  /// environment manifest, later layers winning. Computed once.
  pub fn combined_options(&mut self) -> Options {
    if let Some(options) = &self.combined_options {
      return options.clone();
    }

    let mut combined = self
      .global_manifest
      .as_ref()
      .and_then(|global| global.options.clone())
      .unwrap_or_default();
    if let Some(old) = self.old_manifest().and_then(|manifest| manifest.options.clone()) {
      combined.merge(old);
    }
    if let Some(options) = self.manifest.options.clone() {
      combined.merge(options);
    }

    self.combined_options = Some(combined.clone());
    combined
  }

  /// The base query arguments every query starts from. Computed once.
  pub fn base_query_args(&mut self) -> PkgQueryArgs {
    if let Some(args) = &self.base_query_args {
      return args.clone();
    }
    let args = PkgQueryArgs::from(&self.combined_options());
    self.base_query_args = Some(args.clone());
    args
  }

  /// Open and scrape a package database for every registry input, in
  /// priority order. One-shot.
  fn ensure_pkg_dbs(&mut self) -> Result<(), EnvironmentError> {
    if self.pkg_dbs.is_some() {
      return Ok(());
    }
    let registry = self.combined_registry()?;
    let systems = self.systems();
    let mut dbs = Vec::new();
    for (name, locked) in registry.iter() {
      let mut input = self.provider.open_input(Some(name), locked)?;
      input.scrape_systems(&systems)?;
      dbs.push(input);
    }
    self.pkg_dbs = Some(dbs);
    Ok(())
  }

  /// Whether `group` can keep its existing lock for `system`.
  ///
  /// A group stays locked only when it is not being upgraded, the old
  /// lockfile covers `system`, and every member has an unchanged descriptor
  /// and an entry in the old lock. A `null` entry counts as "already locked
  /// to nothing". Any violation re-locks the whole group: groups are atomic.
  pub fn group_is_locked(
    &self,
    name: &GroupName,
    group: &InstallDescriptors,
    old_lockfile: &Lockfile,
    system: &System,
  ) -> bool {
    if self.upgrading_group(name) {
      return false;
    }
    let Some(old_packages) = old_lockfile.raw().packages.get(system) else {
      return false;
    };
    let old_descriptors = old_lockfile.descriptors();

    for (iid, descriptor) in group {
      let Some(old_descriptor) = old_descriptors.get(iid) else {
        return false;
      };
      if !descriptor_unchanged(system, descriptor, old_descriptor) {
        return false;
      }
      if !old_packages.contains_key(iid) {
        // Unreachable for well-formed lockfiles: a descriptor present in the
        // lock's manifest always has a package entry.
        return false;
      }
    }
    true
  }

  /// Groups that must be re-resolved for `system`.
  pub fn unlocked_groups(&self, system: &System) -> Groups {
    let mut groups = self.manifest.grouped_descriptors();
    if let Some(old_lockfile) = &self.old_lockfile {
      groups.retain(|name, group| !self.group_is_locked(name, group, old_lockfile, system));
    }
    groups
  }

  /// Groups whose existing lock is reused for `system`.
  pub fn locked_groups(&self, system: &System) -> Groups {
    let Some(old_lockfile) = &self.old_lockfile else {
      return Groups::new();
    };
    let mut groups = self.manifest.grouped_descriptors();
    groups.retain(|name, group| self.group_is_locked(name, group, old_lockfile, system));
    groups
  }

  /// Recover the input pin `group` was previously resolved against.
  ///
  /// Prefers a member still in its old group. Falls back to the first member
  /// whose package is unchanged but whose group was renamed, so a pin
  /// survives a group rename.
  fn group_input(
    group: &InstallDescriptors,
    old_lockfile: &Lockfile,
    system: &System,
  ) -> Option<LockedInput> {
    let old_packages = old_lockfile.raw().packages.get(system)?;
    let old_descriptors = old_lockfile.descriptors();

    let mut wrong_group: Option<LockedInput> = None;
    for (iid, descriptor) in group {
      if let Some(Some(locked)) = old_packages.get(iid)
        && let Some(old_descriptor) = old_descriptors.get(iid)
        && same_package(descriptor, old_descriptor)
      {
        if descriptor.group == old_descriptor.group {
          return Some(locked.input.clone());
        }
        if wrong_group.is_none() {
          wrong_group = Some(locked.input.clone());
        }
      }
    }
    wrong_group
  }

  /// Resolve one descriptor against one input, returning the best row.
  fn resolve_descriptor_in(
    base: &PkgQueryArgs,
    descriptor: &ManifestDescriptor,
    input: &P::Input,
    system: &System,
  ) -> Result<Option<RowId>, EnvironmentError> {
    let mut args = base.clone();
    input.fill_pkg_query_args(&mut args);
    descriptor.fill_pkg_query_args(&mut args);
    // Queries always target the single system being locked.
    args.systems = vec![system.clone()];
    let rows = input.db().query(&args)?;
    Ok(rows.first().copied())
  }

  /// Materialize a database row into a locked package.
  fn lock_package(
    input: &LockedInput,
    db: &<P::Input as PkgDbInput>::Db,
    row: RowId,
    priority: u64,
  ) -> Result<LockedPackage, EnvironmentError> {
    let mut info = db.get_package(row)?;
    let attr_path = match info.remove("absPath") {
      Some(value) => serde_json::from_value(value).map_err(QueryError::Metadata)?,
      None => return Err(QueryError::MissingField { field: "absPath" }.into()),
    };
    for field in ["relPath", "subtree", "id", "system"] {
      info.remove(field);
    }
    Ok(LockedPackage {
      input: input.clone(),
      attr_path,
      priority,
      info,
    })
  }

  /// Resolve every member of `group` against a single input.
  ///
  /// Short-circuits on the first mandatory miss, returning that install ID;
  /// later descriptors are not probed.
  fn resolve_group_in(
    base: &PkgQueryArgs,
    group: &InstallDescriptors,
    input: &P::Input,
    system: &System,
  ) -> Result<GroupResolution, EnvironmentError> {
    debug!(input = input.name().unwrap_or("<none>"), "resolving group in input");

    let mut rows: BTreeMap<InstallID, Option<(RowId, u64)>> = BTreeMap::new();
    for (iid, descriptor) in group {
      debug!(iid = %iid, "resolving install ID");
      if system_skipped(system, &descriptor.systems) {
        rows.insert(iid.clone(), None);
        continue;
      }
      match Self::resolve_descriptor_in(base, descriptor, input, system)? {
        Some(row) => {
          rows.insert(iid.clone(), Some((row, descriptor.priority)));
        }
        None if descriptor.optional => {
          rows.insert(iid.clone(), None);
        }
        None => {
          debug!(iid = %iid, "package not found in input");
          return Ok(GroupResolution::Miss(iid.clone()));
        }
      }
    }

    let locked_input = input.locked_input().clone();
    let mut pkgs = SystemPackages::new();
    for (iid, row) in rows {
      let entry = match row {
        Some((row, priority)) => Some(Self::lock_package(&locked_input, input.db(), row, priority)?),
        None => None,
      };
      pkgs.insert(iid, entry);
    }
    Ok(GroupResolution::Resolved(pkgs))
  }

  /// Resolve `group` across all candidate inputs.
  ///
  /// The pin recorded by the old lockfile is tried first unless the group is
  /// being upgraded; the registry sweep follows in priority order, first
  /// success winning. Returns every failed attempt otherwise.
  pub fn try_resolve_group(
    &mut self,
    name: &GroupName,
    group: &InstallDescriptors,
    system: &System,
  ) -> Result<GroupOutcome, EnvironmentError> {
    debug!(group = %name, members = group.len(), "starting group resolution");
    let base = self.base_query_args();
    self.ensure_pkg_dbs()?;

    let mut failure: ResolutionFailure = Vec::new();

    // Try the input+rev an existing lock resolved this group against.
    // Failures here are presumably new group members.
    let mut old_group_input: Option<P::Input> = None;
    if !self.upgrading_group(name)
      && let Some(old_lockfile) = &self.old_lockfile
      && let Some(locked) = Self::group_input(group, old_lockfile, system)
    {
      debug!(url = %locked.url, "group previously pinned to input");
      let input = self.provider.open_input(None, &locked)?;
      match Self::resolve_group_in(&base, group, &input, system)? {
        GroupResolution::Resolved(pkgs) => return Ok(GroupOutcome::Resolved(pkgs)),
        GroupResolution::Miss(iid) => {
          failure.push((iid, input.locked_input().url.clone()));
        }
      }
      old_group_input = Some(input);
    }

    // Sweep the registry in priority order, skipping the pin already tried.
    let Some(dbs) = self.pkg_dbs.as_ref() else {
      return Err(EnvironmentError::Invariant(
        "package databases not initialized".to_string(),
      ));
    };
    for input in dbs {
      if let Some(old) = &old_group_input
        && input.same_input(old)
      {
        continue;
      }
      match Self::resolve_group_in(&base, group, input, system)? {
        GroupResolution::Resolved(pkgs) => {
          info!(group = %name, "upgrading group to avoid resolution failure");
          return Ok(GroupOutcome::Resolved(pkgs));
        }
        GroupResolution::Miss(iid) => {
          failure.push((iid, input.locked_input().url.clone()));
        }
      }
    }

    Ok(GroupOutcome::Failed(failure))
  }

  /// Lock a single system: resolve every unlocked group, then carry over
  /// entries from groups whose lock is reused.
  fn lock_system(&mut self, system: &System) -> Result<SystemPackages, EnvironmentError> {
    let mut pkgs = SystemPackages::new();
    let groups = self.unlocked_groups(system);
    let mut failures: Vec<(GroupName, ResolutionFailure)> = Vec::new();

    for (name, group) in &groups {
      match self.try_resolve_group(name, group, system)? {
        GroupOutcome::Resolved(resolved) => {
          pkgs.extend(resolved);
        }
        GroupOutcome::Failed(failure) => {
          // No attempt records means there were no inputs to search at all.
          if failure.is_empty() {
            return Err(EnvironmentError::NoInputs);
          }
          failures.push((name.clone(), failure));
        }
      }
    }

    if !failures.is_empty() {
      return Err(EnvironmentError::Resolution(failures));
    }

    // Reuse old entries for locked groups, taking the priority from the
    // current descriptor: priority is not pinned.
    if let Some(old_lockfile) = &self.old_lockfile
      && let Some(old_packages) = old_lockfile.raw().packages.get(system)
    {
      for (_, group) in self.locked_groups(system) {
        for (iid, descriptor) in group {
          if let Some(entry) = old_packages.get(&iid) {
            let mut entry = entry.clone();
            if let Some(pkg) = &mut entry {
              pkg.priority = descriptor.priority;
            }
            pkgs.insert(iid, entry);
          }
        }
      }
    }

    Ok(pkgs)
  }

  /// Resolve every system and assemble the lockfile.
  ///
  /// Idempotent: the raw lockfile is built at most once per environment.
  /// If any system fails to lock, the whole call fails.
  pub fn create_lockfile(&mut self) -> Result<Lockfile, EnvironmentError> {
    let raw = match self.lockfile_raw.clone() {
      Some(raw) => raw,
      None => {
        let registry = self.combined_registry()?;
        let mut packages = BTreeMap::new();
        for system in self.systems() {
          let pkgs = self.lock_system(&system)?;
          packages.insert(system, pkgs);
        }
        let raw = LockfileRaw {
          lockfile_version: LOCKFILE_VERSION,
          manifest: self.manifest.clone(),
          registry,
          packages,
        };
        self.lockfile_raw = Some(raw.clone());
        raw
      }
    };

    // The combined registry keeps every input ever considered; the emitted
    // lockfile keeps only inputs some locked package references.
    let mut lockfile = Lockfile::new(raw);
    lockfile.remove_unused_inputs();
    Ok(lockfile)
  }
}
