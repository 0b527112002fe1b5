//! Cache directory management.
//!
//! The cache directory holds one set of chunk files per configured repo
//! plus the `.db_version` marker. Everything else in there is unknown and
//! subject to the cleanup pass, unless the directory guard trips.

use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use nix::sys::time::{TimeVal, TimeValLike};
use proxmox_sys::fs::{create_path, file_read_firstline, replace_file, CreateOptions};

use crate::file_formats::{DATABASE_VERSION, DB_VERSION_FILENAME};

lazy_static! {
    static ref REPO_FILE_NAME_REGEX: Regex =
        Regex::new(r"^(.+)\.files(?:\.([0-9]{3}))?$").unwrap();
}

/// File system view of the pkgfile cache directory.
#[derive(Clone)]
pub struct CacheStore {
    cachedir: PathBuf,
}

impl CacheStore {
    pub fn new<P: Into<PathBuf>>(cachedir: P) -> Self {
        Self {
            cachedir: cachedir.into(),
        }
    }

    /// Open the cache directory for updating, creating it if necessary.
    pub fn create<P: Into<PathBuf>>(cachedir: P) -> Result<Self, Error> {
        let cachedir: PathBuf = cachedir.into();
        create_path(&cachedir, None, None)
            .map_err(|err| format_err!("unable to create cachedir {:?} - {}", cachedir, err))?;
        Ok(Self { cachedir })
    }

    pub fn cachedir(&self) -> &Path {
        &self.cachedir
    }

    /// Enforce the database version contract for read access.
    pub fn check_version(&self) -> Result<(), Error> {
        let path = self.cachedir.join(DB_VERSION_FILENAME);

        let line = match file_read_firstline(&path) {
            Ok(line) => line,
            Err(_) => bail!("Database version file not found"),
        };

        match line.trim().parse::<u64>() {
            Ok(version) if version == DATABASE_VERSION => Ok(()),
            Ok(version) => bail!(
                "Database has incorrect version ({} != {})",
                version,
                DATABASE_VERSION
            ),
            Err(_) => bail!("Database has incorrect version (unparsable marker)"),
        }
    }

    /// Write or refresh the `.db_version` marker.
    pub fn write_version(&self) -> Result<(), Error> {
        let path = self.cachedir.join(DB_VERSION_FILENAME);
        replace_file(
            &path,
            format!("{}", DATABASE_VERSION).as_bytes(),
            CreateOptions::new(),
            false,
        )
        .map_err(|err| format_err!("unable to write {:?} - {}", path, err))
    }

    fn chunk_path(&self, repo: &str, index: usize) -> PathBuf {
        self.cachedir.join(format!("{}.files.{:03}", repo, index))
    }

    fn numbered_chunks(&self, repo: &str) -> Result<Vec<(usize, PathBuf)>, Error> {
        let prefix = format!("{}.files.", repo);

        let mut chunks = Vec::new();
        let dir = std::fs::read_dir(&self.cachedir)
            .map_err(|err| format_err!("unable to read cachedir {:?} - {}", self.cachedir, err))?;
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(index) = name.strip_prefix(&prefix) {
                if index.len() == 3 && index.bytes().all(|b| b.is_ascii_digit()) {
                    chunks.push((index.parse().unwrap(), entry.path()));
                }
            }
        }
        chunks.sort();

        Ok(chunks)
    }

    /// Paths of the repo's chunk files in ascending chunk order.
    pub fn repo_chunks(&self, repo: &str) -> Result<Vec<PathBuf>, Error> {
        Ok(self
            .numbered_chunks(repo)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    /// The oldest integer-second mtime over the repo's chunks.
    ///
    /// Used as the `If-Modified-Since` reference. Taking the minimum (not
    /// the maximum) makes a half rewritten previous update converge on the
    /// next run.
    pub fn min_chunk_mtime(&self, repo: &str) -> Result<Option<i64>, Error> {
        let mut min = None;
        for (_, path) in self.numbered_chunks(repo)? {
            let mtime = std::fs::metadata(&path)?.mtime();
            min = Some(match min {
                None => mtime,
                Some(min) if mtime < min => mtime,
                Some(min) => min,
            });
        }
        Ok(min)
    }

    /// Atomically replace the repo's database with `chunks`.
    ///
    /// Each chunk is staged next to its final name with a `.tmp` suffix,
    /// fsynced, renamed into place and stamped with `mtime`. Residual
    /// chunks with indices beyond the new count are unlinked, and the
    /// version marker is refreshed.
    pub fn replace_repo(&self, repo: &str, chunks: &[Vec<u8>], mtime: i64) -> Result<(), Error> {
        self.sweep_staging_files(repo)?;

        for (index, data) in chunks.iter().enumerate() {
            let path = self.chunk_path(repo, index);
            let mut tmp_path = path.clone().into_os_string();
            tmp_path.push(".tmp");
            let tmp_path = PathBuf::from(tmp_path);

            let mut file = std::fs::File::create(&tmp_path)
                .map_err(|err| format_err!("unable to create {:?} - {}", tmp_path, err))?;
            file.write_all(data)
                .and_then(|_| file.flush())
                .map_err(|err| format_err!("unable to write {:?} - {}", tmp_path, err))?;
            nix::unistd::fsync(file.as_raw_fd())
                .map_err(|err| format_err!("fsync on {:?} failed - {}", tmp_path, err))?;
            drop(file);

            if let Err(err) = std::fs::rename(&tmp_path, &path) {
                bail!("atomic rename of {:?} failed - {}", path, err);
            }

            let stamp = TimeVal::seconds(mtime);
            nix::sys::stat::utimes(&path, &stamp, &stamp)
                .map_err(|err| format_err!("unable to set mtime on {:?} - {}", path, err))?;
        }

        for (index, path) in self.numbered_chunks(repo)? {
            if index >= chunks.len() {
                std::fs::remove_file(&path)
                    .map_err(|err| format_err!("unable to remove {:?} - {}", path, err))?;
            }
        }

        self.write_version()
    }

    /// Remove staging files left behind by an interrupted update.
    fn sweep_staging_files(&self, repo: &str) -> Result<(), Error> {
        let prefix = format!("{}.files.", repo);
        let dir = std::fs::read_dir(&self.cachedir)
            .map_err(|err| format_err!("unable to read cachedir {:?} - {}", self.cachedir, err))?;
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if name.starts_with(&prefix) && name.ends_with(".tmp") {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        Ok(())
    }

    /// Remove cache directory entries that belong to no configured repo.
    ///
    /// If any sub-directory shows up the whole cleanup is skipped: the
    /// cache directory may have been pointed at something valuable.
    /// Hidden files (the version marker) are never touched.
    pub fn tidy(&self, known_repos: &[String]) -> Result<(), Error> {
        let dir = std::fs::read_dir(&self.cachedir)
            .map_err(|err| format_err!("unable to read cachedir {:?} - {}", self.cachedir, err))?;

        let mut files = Vec::new();
        for entry in dir {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                log::warn!("Directory found in pkgfile cachedir, skipping cleanup");
                return Ok(());
            }
            files.push(entry.path());
        }

        for path in files {
            let keep = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) if name.starts_with('.') => true,
                Some(name) => match REPO_FILE_NAME_REGEX.captures(name) {
                    Some(caps) => known_repos.iter().any(|repo| repo.as_str() == &caps[1]),
                    None => false,
                },
                None => false,
            };
            if !keep {
                log::info!("removing unknown cachedir entry {:?}", path);
                std::fs::remove_file(&path)
                    .map_err(|err| format_err!("unable to remove {:?} - {}", path, err))?;
            }
        }

        Ok(())
    }
}
