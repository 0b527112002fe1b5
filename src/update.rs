//! The update pipeline: refresh every configured repo's database from its
//! mirror list.
//!
//! Repos are updated concurrently up to a bounded width. Within one repo
//! the candidate URLs are tried strictly in order - server order is
//! authoritative failover order. The cache directory is partitioned by
//! repo name, so the tasks never contend on files.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Error};
use futures::stream::{self, StreamExt};

use pkgfile_client::{FetchOutcome, MirrorClient};
use pkgfile_config::{Config, Repository};
use pkgfile_datastore::repo_index::{encode_chunks, DEFAULT_REPO_CHUNK_BYTES};
use pkgfile_datastore::{repo_archive, CacheStore};

const MAX_CONCURRENT_REPO_UPDATES: usize = 8;

pub struct UpdateOptions {
    /// Rewrite every database even when the mirror reports it unchanged.
    pub force: bool,
    /// Target size for one chunk file.
    pub chunk_bytes: u64,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            force: false,
            chunk_bytes: DEFAULT_REPO_CHUNK_BYTES,
        }
    }
}

/// Refresh all configured repos, then tidy the cache directory.
///
/// Fails if any repo exhausted its candidate URLs; the other repos are
/// still updated and the failure only affects the exit status.
pub async fn run_update(
    config: &Config,
    cachedir: &Path,
    options: &UpdateOptions,
) -> Result<(), Error> {
    let store = CacheStore::create(cachedir)?;
    let client = Arc::new(MirrorClient::new());
    let architectures = config.architectures();

    let width = config.repos.len().clamp(1, MAX_CONCURRENT_REPO_UPDATES);

    let results: Vec<(String, Result<(), Error>)> = stream::iter(config.repos.iter())
        .map(|repo| {
            let client = Arc::clone(&client);
            let store = store.clone();
            let architectures = &architectures;
            async move {
                let result = update_repo(&client, &store, repo, architectures, options).await;
                (repo.name.clone(), result)
            }
        })
        .buffer_unordered(width)
        .collect()
        .await;

    let mut failed = 0;
    for (name, result) in &results {
        if let Err(err) = result {
            failed += 1;
            log::error!("failed to update repo '{}' - {:#}", name, err);
        }
    }

    store.tidy(&config.repo_names())?;

    if failed > 0 {
        bail!("failed to update {} of {} repos", failed, results.len());
    }

    Ok(())
}

async fn update_repo(
    client: &MirrorClient,
    store: &CacheStore,
    repo: &Repository,
    architectures: &[String],
    options: &UpdateOptions,
) -> Result<(), Error> {
    let reference_mtime = if options.force {
        None
    } else {
        store.min_chunk_mtime(&repo.name)?
    };

    let urls = repo.archive_urls(architectures);
    if urls.is_empty() {
        bail!("no usable mirrors");
    }

    for url in &urls {
        log::debug!("fetching {}", url);

        match client.fetch_archive(url, reference_mtime).await {
            Ok(FetchOutcome::NotModified) => {
                log::info!("repo '{}' is up to date", repo.name);
                return Ok(());
            }
            Ok(FetchOutcome::Archive {
                data,
                last_modified,
            }) => {
                let chunk_bytes = options.chunk_bytes;
                let chunks = tokio::task::spawn_blocking(move || {
                    repo_archive::read_packages(&data[..])
                        .map(|packages| encode_chunks(&packages, chunk_bytes))
                })
                .await?;

                let chunks = match chunks {
                    Ok(chunks) => chunks,
                    Err(err) => {
                        // broken download or corrupt archive, try the next mirror
                        log::warn!("ignoring archive from '{}' - {:#}", url, err);
                        continue;
                    }
                };

                let mtime = last_modified.unwrap_or_else(proxmox_time::epoch_i64);
                let chunk_count = chunks.len();

                let store = store.clone();
                let name = repo.name.clone();
                tokio::task::spawn_blocking(move || store.replace_repo(&name, &chunks, mtime))
                    .await??;

                log::info!("updated repo '{}' ({} chunks)", repo.name, chunk_count);
                return Ok(());
            }
            Err(err) => {
                log::warn!("unable to retrieve {} - {:#}", url, err);
            }
        }
    }

    bail!("all mirrors failed");
}
