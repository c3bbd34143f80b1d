//! Repository proxies for reposync.
//!
//! The diff and apply engines reach storage only through the
//! `RepositoryProxy` trait. This crate provides the trait, the local
//! filesystem, in-memory and encrypting implementations, and the registry
//! that picks a transport for a location string.
//!
//! # Design Principles
//! - Transport isolation: engines never branch on which proxy they hold
//! - Manifest after effect: a proxy records an operation only once it landed
//! - Staged writes: content is written into a staging area and renamed into place

pub mod crypt;
pub mod local;
pub mod memory;
pub mod proxy;
pub mod registry;

pub use crypt::{CryptHeader, CryptRepositoryProxy, CRYPT_DIRNAME};
pub use local::LocalRepositoryProxy;
pub use memory::{MemoryRepositoryProxy, ProxyCall, ProxyOp};
pub use proxy::{FileHandle, RepositoryProxy};
pub use registry::{
    create_default_registry, CryptOpener, LocalOpener, PassphraseProvider, ProxyRegistry,
    RepositoryOpener,
};
