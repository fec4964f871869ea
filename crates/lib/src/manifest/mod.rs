//! Manifests and install descriptors.
//!
//! A manifest declares the packages an environment wants installed
//! (`install`), the inputs those packages may come from (`registry`), and
//! query options (`options`). Descriptors are partitioned into groups; every
//! member of a group must resolve against a single common input pin so that
//! the group's runtime closures are mutually coherent.

mod types;

pub use types::*;
