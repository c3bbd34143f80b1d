//! Common utilities and types shared across the reposync crates.
//!
//! This module provides the error type every library crate returns and the
//! transport-independent path type used to address files in a repository.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{RepoPath, SensitiveBytes};
