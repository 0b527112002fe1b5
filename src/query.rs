//! The query engine: scan the mmap'd repo databases for packages owning a
//! path (`search`) or enumerate the files of a package (`list`).
//!
//! Matchers are compiled once per query; the inner scan works on borrowed
//! byte slices straight out of the chunk mappings and never allocates per
//! file entry.

use std::io::Write;

use anyhow::{format_err, Error};

use pkgfile_config::Config;
use pkgfile_datastore::repo_index::RepoChunkReader;
use pkgfile_datastore::CacheStore;

/// Flag surface shared by search and list queries.
#[derive(Clone, Copy, Default)]
pub struct QueryOptions {
    pub case_insensitive: bool,
    pub use_glob: bool,
    pub use_regex: bool,
    pub match_directories: bool,
    pub verbose: bool,
    pub quiet: bool,
    pub raw: bool,
    pub binaries: bool,
}

const BINARY_DIRS: [&[u8]; 6] = [
    b"/bin/",
    b"/sbin/",
    b"/usr/bin/",
    b"/usr/sbin/",
    b"/usr/local/bin/",
    b"/usr/local/sbin/",
];

fn bytes_eq(a: &[u8], b: &[u8], case_insensitive: bool) -> bool {
    if case_insensitive {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// The final path component. For `/usr/bin/dhcpcd` this is `dhcpcd`.
fn basename(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|b| *b == b'/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// The final component of a directory entry, keeping its trailing slash.
/// For `/usr/lib/dhcpcd/` this is `dhcpcd/`.
fn dir_component(path: &[u8]) -> &[u8] {
    let trimmed = &path[..path.len() - 1];
    match trimmed.iter().rposition(|b| *b == b'/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

enum MatchKind {
    Basename { target: Vec<u8> },
    FullPath { target: Vec<u8> },
    Glob { pattern: glob::Pattern, options: glob::MatchOptions },
    Regex { regex: regex::bytes::Regex },
}

/// A compiled search predicate, applied to every file entry in the scan.
pub struct FileMatcher {
    kind: MatchKind,
    case_insensitive: bool,
    match_directories: bool,
}

impl FileMatcher {
    pub fn new(target: &str, options: &QueryOptions) -> Result<Self, Error> {
        let kind = if options.use_regex {
            MatchKind::Regex {
                regex: regex::bytes::RegexBuilder::new(target)
                    .case_insensitive(options.case_insensitive)
                    .build()
                    .map_err(|err| format_err!("invalid regex '{}' - {}", target, err))?,
            }
        } else if options.use_glob {
            MatchKind::Glob {
                pattern: glob::Pattern::new(target)
                    .map_err(|err| format_err!("invalid glob '{}' - {}", target, err))?,
                options: glob::MatchOptions {
                    case_sensitive: !options.case_insensitive,
                    require_literal_separator: true,
                    require_literal_leading_dot: false,
                },
            }
        } else if target.trim_end_matches('/').contains('/') {
            MatchKind::FullPath {
                target: target.as_bytes().to_vec(),
            }
        } else {
            MatchKind::Basename {
                target: target.as_bytes().to_vec(),
            }
        };

        Ok(Self {
            kind,
            case_insensitive: options.case_insensitive,
            match_directories: options.match_directories,
        })
    }

    pub fn matches(&self, path: &[u8]) -> bool {
        let is_dir = path.ends_with(b"/");

        match self.kind {
            MatchKind::Basename { ref target } => {
                if target.ends_with(b"/") {
                    // only meaningful with --directories
                    self.match_directories
                        && is_dir
                        && bytes_eq(dir_component(path), target, self.case_insensitive)
                } else if is_dir {
                    let component = dir_component(path);
                    self.match_directories
                        && bytes_eq(
                            &component[..component.len() - 1],
                            target,
                            self.case_insensitive,
                        )
                } else {
                    bytes_eq(basename(path), target, self.case_insensitive)
                }
            }
            MatchKind::FullPath { ref target } => {
                (!is_dir || self.match_directories)
                    && bytes_eq(path, target, self.case_insensitive)
            }
            MatchKind::Glob {
                ref pattern,
                ref options,
            } => {
                if is_dir && !self.match_directories {
                    return false;
                }
                match std::str::from_utf8(path) {
                    Ok(path) => pattern.matches_with(path, *options),
                    Err(_) => false,
                }
            }
            MatchKind::Regex { ref regex } => {
                (!is_dir || self.match_directories) && regex.is_match(path)
            }
        }
    }
}

struct Row {
    repo: usize,
    name: Vec<u8>,
    prefix: String,
    path: Option<Vec<u8>>,
}

/// Find packages owning a path matching `target`.
///
/// Returns whether anything matched; the caller maps that to the process
/// exit status.
pub fn search(
    store: &CacheStore,
    config: &Config,
    target: &str,
    options: &QueryOptions,
    out: &mut dyn Write,
) -> Result<bool, Error> {
    store.check_version()?;

    let matcher = FileMatcher::new(target, options)?;
    let mut rows: Vec<Row> = Vec::new();

    for (repo_pos, repo) in config.repos.iter().enumerate() {
        for chunk_path in store.repo_chunks(&repo.name)? {
            let reader = RepoChunkReader::open(&chunk_path)?;
            for package in reader.packages() {
                let package = package?;

                if options.verbose {
                    for path in package.files() {
                        if matcher.matches(path) {
                            rows.push(Row {
                                repo: repo_pos,
                                name: package.name.to_vec(),
                                prefix: format!(
                                    "{}/{} {}",
                                    repo.name,
                                    String::from_utf8_lossy(package.name),
                                    String::from_utf8_lossy(package.version),
                                ),
                                path: Some(path.to_vec()),
                            });
                        }
                    }
                } else if package.files().any(|path| matcher.matches(path)) {
                    rows.push(Row {
                        repo: repo_pos,
                        name: package.name.to_vec(),
                        prefix: format!(
                            "{}/{}",
                            repo.name,
                            String::from_utf8_lossy(package.name)
                        ),
                        path: None,
                    });
                }
            }
        }
    }

    // package-per-line output is sorted by name; verbose rows keep the
    // database scan order
    if !options.verbose {
        rows.sort_by(|a, b| (a.repo, &a.name).cmp(&(b.repo, &b.name)));
    }

    write_rows(out, &rows, !options.raw, false)?;

    Ok(!rows.is_empty())
}

/// Enumerate the files of the packages matching a `[repo/]name` spec.
pub fn list(
    store: &CacheStore,
    config: &Config,
    target: &str,
    options: &QueryOptions,
    out: &mut dyn Write,
) -> Result<bool, Error> {
    store.check_version()?;

    let (repo_filter, name_spec) = match target.split_once('/') {
        Some((repo, name)) => (Some(repo), name),
        None => (None, target),
    };

    let name_regex = if options.use_regex {
        Some(
            regex::bytes::RegexBuilder::new(name_spec)
                .case_insensitive(options.case_insensitive)
                .build()
                .map_err(|err| format_err!("invalid regex '{}' - {}", name_spec, err))?,
        )
    } else {
        None
    };

    let name_matches = |name: &[u8]| match name_regex {
        Some(ref regex) => regex.is_match(name),
        None => bytes_eq(name, name_spec.as_bytes(), options.case_insensitive),
    };

    let mut rows: Vec<Row> = Vec::new();

    for (repo_pos, repo) in config.repos.iter().enumerate() {
        if let Some(filter) = repo_filter {
            if repo.name != filter {
                continue;
            }
        }

        for chunk_path in store.repo_chunks(&repo.name)? {
            let reader = RepoChunkReader::open(&chunk_path)?;
            for package in reader.packages() {
                let package = package?;
                if !name_matches(package.name) {
                    continue;
                }

                for path in package.files() {
                    if options.binaries && !in_binary_dir(path) {
                        continue;
                    }
                    rows.push(Row {
                        repo: repo_pos,
                        name: package.name.to_vec(),
                        prefix: format!(
                            "{}/{}",
                            repo.name,
                            String::from_utf8_lossy(package.name)
                        ),
                        path: Some(path.to_vec()),
                    });
                }
            }
        }
    }

    write_rows(out, &rows, !options.raw, options.quiet)?;

    Ok(!rows.is_empty())
}

fn in_binary_dir(path: &[u8]) -> bool {
    if path.ends_with(b"/") {
        return false;
    }
    let dir = match path.iter().rposition(|b| *b == b'/') {
        Some(pos) => &path[..pos + 1],
        None => return false,
    };
    BINARY_DIRS.contains(&dir)
}

/// Emit result rows, right-padding the prefix column with spaces so the
/// tab separated path column lines up.
fn write_rows(out: &mut dyn Write, rows: &[Row], pad: bool, quiet: bool) -> Result<(), Error> {
    let width = if pad {
        rows.iter().map(|row| row.prefix.len()).max().unwrap_or(0)
    } else {
        0
    };

    for row in rows {
        match row.path {
            Some(ref path) => {
                if !quiet {
                    out.write_all(row.prefix.as_bytes())?;
                    for _ in row.prefix.len()..width {
                        out.write_all(b" ")?;
                    }
                    out.write_all(b"\t")?;
                }
                out.write_all(path)?;
                out.write_all(b"\n")?;
            }
            None => {
                out.write_all(row.prefix.as_bytes())?;
                out.write_all(b"\n")?;
            }
        }
    }

    Ok(())
}
