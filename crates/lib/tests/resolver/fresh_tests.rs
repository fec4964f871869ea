//! Resolving without a prior lockfile.

use envlock_core::resolver::{Environment, EnvironmentError, GroupOutcome};
use serde_json::json;

use super::common::*;

const SYSTEM: &str = "x86_64-linux";

#[test]
fn fresh_resolve_single_input_single_system() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/pkgs", "rev1", vec![row("hello", "2.12.1", SYSTEM)]);

  let manifest = manifest(
    registry(&[("pkgs", "github:example/pkgs")]),
    &[SYSTEM],
    &[("hello", descriptor("hello"))],
  );
  let mut env = Environment::new(manifest, provider);
  let lockfile = env.create_lockfile().unwrap();

  let raw = lockfile.raw();
  assert_eq!(raw.lockfile_version, 1);

  let pkgs = &raw.packages[SYSTEM];
  let hello = pkgs["hello"].as_ref().unwrap();
  assert_eq!(
    hello.attr_path,
    vec!["legacyPackages".to_string(), SYSTEM.to_string(), "hello".to_string()]
  );
  assert_eq!(hello.priority, 5);
  assert_eq!(hello.input.rev, "rev1");
  assert_eq!(hello.info.get("version"), Some(&json!("2.12.1")));

  // Redundant metadata fields are stripped.
  for field in ["absPath", "relPath", "subtree", "id", "system"] {
    assert!(!hello.info.contains_key(field), "{field} should be stripped");
  }

  // The registry contains exactly the one pinned input.
  assert_eq!(raw.registry.inputs.len(), 1);
  assert_eq!(raw.registry.inputs["pkgs"].rev, "rev1");
}

#[test]
fn optional_descriptor_missing_resolves_to_null() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/pkgs", "rev1", vec![row("hello", "2.12.1", SYSTEM)]);

  let mut ghost = descriptor("ghost");
  ghost.optional = true;
  let manifest = manifest(
    registry(&[("pkgs", "github:example/pkgs")]),
    &[SYSTEM],
    &[("hello", descriptor("hello")), ("ghost", ghost)],
  );
  let mut env = Environment::new(manifest, provider);
  let lockfile = env.create_lockfile().unwrap();

  let pkgs = &lockfile.raw().packages[SYSTEM];
  assert!(pkgs["hello"].is_some());
  assert_eq!(pkgs.get("ghost"), Some(&None));
}

#[test]
fn required_missing_in_first_input_falls_back_to_second() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/a", "aaa", vec![row("other", "1.0", SYSTEM)]);
  provider.add_input("github:example/b", "bbb", vec![row("hello", "2.12.1", SYSTEM)]);

  let manifest = manifest(
    registry(&[("a", "github:example/a"), ("b", "github:example/b")]),
    &[SYSTEM],
    &[("hello", descriptor("hello"))],
  );
  let mut env = Environment::new(manifest, provider);
  let lockfile = env.create_lockfile().unwrap();

  let hello = lockfile.raw().packages[SYSTEM]["hello"].as_ref().unwrap();
  assert_eq!(hello.input.rev, "bbb");
}

#[test]
fn group_members_resolve_against_one_common_input() {
  // `a` carries only foo; `b` carries the whole group.
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/a", "aaa", vec![row("foo", "1.0", SYSTEM)]);
  provider.add_input(
    "github:example/b",
    "bbb",
    vec![row("foo", "1.0", SYSTEM), row("bar", "1.0", SYSTEM)],
  );

  let manifest = manifest(
    registry(&[("a", "github:example/a"), ("b", "github:example/b")]),
    &[SYSTEM],
    &[("foo", descriptor("foo")), ("bar", descriptor("bar"))],
  );
  let mut env = Environment::new(manifest, provider);
  let lockfile = env.create_lockfile().unwrap();

  let pkgs = &lockfile.raw().packages[SYSTEM];
  let foo = pkgs["foo"].as_ref().unwrap();
  let bar = pkgs["bar"].as_ref().unwrap();
  assert_eq!(foo.input, bar.input);
  assert_eq!(foo.input.rev, "bbb");
}

#[test]
fn first_mandatory_miss_short_circuits_the_input() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/a", "aaa", vec![row("zzz-late", "1.0", SYSTEM)]);
  let log = provider.query_log.clone();

  let manifest = manifest(
    registry(&[("a", "github:example/a")]),
    &[SYSTEM],
    &[("aaa-early", descriptor("aaa-early")), ("zzz-late", descriptor("zzz-late"))],
  );
  let mut env = Environment::new(manifest, provider);
  let err = env.create_lockfile().unwrap_err();

  // Only the first (missing) member was probed; the rest of the group was not.
  assert_eq!(log.borrow().len(), 1);
  match err {
    EnvironmentError::Resolution(failures) => {
      assert_eq!(failures.len(), 1);
      let (group, failure) = &failures[0];
      assert_eq!(group, "default");
      assert_eq!(failure.len(), 1);
      assert_eq!(failure[0].0, "aaa-early");
      assert_eq!(failure[0].1, "github:example/a?rev=aaa");
    }
    other => panic!("expected Resolution, got {other:?}"),
  }
}

#[test]
fn descriptor_gated_to_other_systems_locks_to_null() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/pkgs", "rev1", vec![row("hello", "2.12.1", SYSTEM)]);

  let mut darwin_only = descriptor("hello");
  darwin_only.systems = Some(vec!["aarch64-darwin".to_string()]);
  let manifest = manifest(
    registry(&[("pkgs", "github:example/pkgs")]),
    &[SYSTEM],
    &[("hello", darwin_only)],
  );
  let mut env = Environment::new(manifest, provider);
  let lockfile = env.create_lockfile().unwrap();

  assert_eq!(lockfile.raw().packages[SYSTEM].get("hello"), Some(&None));
}

#[test]
fn every_requested_system_gets_a_package_map() {
  const DARWIN: &str = "aarch64-darwin";
  let mut provider = MemoryProvider::new();
  provider.add_input(
    "github:example/pkgs",
    "rev1",
    vec![row("hello", "2.12.1", SYSTEM), row("hello", "2.12.1", DARWIN)],
  );

  let manifest = manifest(
    registry(&[("pkgs", "github:example/pkgs")]),
    &[SYSTEM, DARWIN],
    &[("hello", descriptor("hello"))],
  );
  let mut env = Environment::new(manifest, provider);
  let lockfile = env.create_lockfile().unwrap();

  let packages = &lockfile.raw().packages;
  assert_eq!(packages.len(), 2);
  assert!(packages[SYSTEM]["hello"].is_some());
  assert!(packages[DARWIN]["hello"].is_some());
}

#[test]
fn semver_range_selects_matching_version() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/pkgs", "rev1", vec![row("hello", "1.4.2", SYSTEM)]);

  let mut constrained = descriptor("hello");
  constrained.semver = Some("^1".to_string());
  let mut too_new = descriptor("hello");
  too_new.semver = Some("^2".to_string());
  too_new.optional = true;

  let manifest = manifest(
    registry(&[("pkgs", "github:example/pkgs")]),
    &[SYSTEM],
    &[("hello", constrained), ("hello-two", too_new)],
  );
  let mut env = Environment::new(manifest, provider);
  let lockfile = env.create_lockfile().unwrap();

  let pkgs = &lockfile.raw().packages[SYSTEM];
  assert!(pkgs["hello"].is_some());
  assert_eq!(pkgs.get("hello-two"), Some(&None));
}

#[test]
fn unreferenced_inputs_are_pruned_from_lockfile_registry() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/a", "aaa", vec![row("hello", "2.12.1", SYSTEM)]);
  provider.add_input("github:example/b", "bbb", vec![row("hello", "2.12.1", SYSTEM)]);

  let manifest = manifest(
    registry(&[("a", "github:example/a"), ("b", "github:example/b")]),
    &[SYSTEM],
    &[("hello", descriptor("hello"))],
  );
  let mut env = Environment::new(manifest, provider);
  let lockfile = env.create_lockfile().unwrap();

  let registry = lockfile.registry();
  assert_eq!(registry.inputs.len(), 1);
  assert!(registry.inputs.contains_key("a"));
  assert_eq!(registry.priority, vec!["a".to_string()]);
}

#[test]
fn empty_registry_fails_with_no_inputs() {
  let provider = MemoryProvider::new();
  let manifest = manifest(registry(&[]), &[SYSTEM], &[("hello", descriptor("hello"))]);
  let mut env = Environment::new(manifest, provider);

  let err = env.create_lockfile().unwrap_err();
  assert!(matches!(err, EnvironmentError::NoInputs));
}

#[test]
fn unresolvable_package_reports_every_attempt() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/a", "aaa", vec![]);
  provider.add_input("github:example/b", "bbb", vec![]);

  let manifest = manifest(
    registry(&[("a", "github:example/a"), ("b", "github:example/b")]),
    &[SYSTEM],
    &[("ghost", descriptor("ghost"))],
  );
  let mut env = Environment::new(manifest, provider);
  let err = env.create_lockfile().unwrap_err();

  let msg = err.to_string();
  assert!(msg.contains("failed to resolve 'ghost' in input 'github:example/a?rev=aaa'"));
  assert!(msg.contains("failed to resolve 'ghost' in input 'github:example/b?rev=bbb'"));
}

#[test]
fn try_resolve_group_is_observable_per_group() {
  let mut provider = MemoryProvider::new();
  provider.add_input("github:example/pkgs", "rev1", vec![row("hello", "2.12.1", SYSTEM)]);

  let manifest = manifest(
    registry(&[("pkgs", "github:example/pkgs")]),
    &[SYSTEM],
    &[("hello", descriptor("hello"))],
  );
  let mut env = Environment::new(manifest.clone(), provider);

  let system = SYSTEM.to_string();
  let groups = env.unlocked_groups(&system);
  assert_eq!(groups.len(), 1);
  assert!(env.locked_groups(&system).is_empty());

  let (name, group) = groups.iter().next().unwrap();
  match env.try_resolve_group(name, group, &system).unwrap() {
    GroupOutcome::Resolved(pkgs) => {
      assert!(pkgs["hello"].is_some());
    }
    GroupOutcome::Failed(failure) => panic!("expected success, got {failure:?}"),
  }
}
