//! # ols-mirror
//!
//! Read-only local mirror of one branch of a remote repository.
//!
//! [`VersionMirror`] owns the working copy and drives a [`GitTransport`]
//! (normally [`GitCli`]) to clone, fetch and fast-forward it. Divergence is
//! reported by [`VersionMirror::resolve_refs`] as [`MirrorRefs`].

pub mod error;
pub mod mirror;
pub mod transport;

pub use error::MirrorError;
pub use mirror::{AuthorIdentity, EnsureOutcome, MirrorRefs, VersionMirror};
pub use transport::{GitCli, GitTransport};
