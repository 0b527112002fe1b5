//! This crate implements the pkgfile database storage and access layer.
//!
//! # Data formats
//!
//! Upstream mirrors serve one `<repo>.files` archive per repository: a
//! compressed tar stream with one directory per package, each holding a
//! `files` text entry (the file list) and usually a `desc` entry (package
//! metadata). [repo_archive] decodes these into [Package](repo_archive::Package)
//! records.
//!
//! Locally, a repository database is a set of chunk files named
//! `<repo>.files.NNN`. Each chunk is a self contained binary blob holding a
//! contiguous run of packages: a fixed header page, a package index and a
//! string region (see [file_formats]). Chunks are written through
//! [repo_index::encode_chunks] and read back through a memory mapping via
//! [repo_index::RepoChunkReader], so the query scan works directly on the
//! mapped bytes without further allocation.
//!
//! The [store::CacheStore] owns the cache directory: the `.db_version`
//! marker, chunk discovery, atomic replacement and the cleanup pass.

pub mod file_formats;
pub mod repo_archive;
pub mod repo_index;
pub mod store;

pub use store::CacheStore;
