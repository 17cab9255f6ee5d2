//! Git abstraction layer for patchgate.
//!
//! This crate defines the [`GitRepo`] trait, the single interface through
//! which the harness talks to git. Fixture caching, patch computation and
//! patch application all go through it; no other crate spawns `git`.
//!
//! # Crate layout
//!
//! - [`repo`]: the [`GitRepo`] trait definition.
//! - [`types`]: value types used in trait signatures ([`GitOid`], [`Identity`],
//!   [`Submodule`]).
//! - [`error`]: the [`GitError`] enum returned by all trait methods.

pub mod error;
pub mod repo;
pub mod types;

mod cli_repo;

pub use cli_repo::GitCli;

pub use error::GitError;
pub use repo::GitRepo;
pub use types::{GitOid, Identity, OidParseError, Submodule};
