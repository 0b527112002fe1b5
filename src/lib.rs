//! Find which package owns a file in pacman-style repositories.
//!
//! The heavy lifting lives in the workspace crates: `pkgfile-datastore`
//! (database format and cache directory), `pkgfile-client` (mirror HTTP
//! client) and `pkgfile-config` (pacman.conf parsing). This crate wires
//! them into the two user facing operations: [update] refreshes the local
//! databases from the configured mirrors, [query] answers search and list
//! requests against them.

pub mod query;
pub mod update;
