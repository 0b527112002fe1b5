//! Shared fixtures for the integration tests: in-memory `.files` archives
//! and a small in-process HTTP server standing in for a mirror.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};

use pkgfile::query;
use pkgfile::update::{self, UpdateOptions};
use pkgfile_client::http_date;
use pkgfile_config::Config;
use pkgfile_datastore::CacheStore;

pub const TESTING_MTIME: i64 = 1585674000;
pub const MULTILIB_MTIME: i64 = 1585674123;

/// `(name, version, file list)` - files are repo relative, like upstream.
pub type FixturePackage = (&'static str, &'static str, &'static [&'static str]);

pub const DHCPCD_FILES: &[&str] = &[
    "etc/",
    "etc/dhcpcd.conf",
    "usr/",
    "usr/bin/",
    "usr/bin/dhcpcd",
    "usr/lib/",
    "usr/lib/dhcpcd/",
    "usr/lib/dhcpcd/dev/",
    "usr/lib/dhcpcd/dev/udev.so",
    "usr/lib/dhcpcd/dhcpcd-hooks/",
    "usr/lib/dhcpcd/dhcpcd-hooks/01-test",
    "usr/lib/dhcpcd/dhcpcd-hooks/02-dump",
    "usr/lib/dhcpcd/dhcpcd-hooks/20-resolv.conf",
    "usr/lib/dhcpcd/dhcpcd-hooks/30-hostname",
    "usr/lib/dhcpcd/dhcpcd-run-hooks",
    "usr/lib/systemd/",
    "usr/lib/systemd/system/",
    "usr/lib/systemd/system/dhcpcd.service",
    "usr/lib/systemd/system/dhcpcd@.service",
    "usr/share/",
    "usr/share/dhcpcd/",
    "usr/share/dhcpcd/hooks/",
    "usr/share/dhcpcd/hooks/10-wpa_supplicant",
    "usr/share/dhcpcd/hooks/15-timezone",
    "usr/share/dhcpcd/hooks/29-lookup-hostname",
    "usr/share/licenses/",
    "usr/share/licenses/dhcpcd/",
    "usr/share/licenses/dhcpcd/LICENSE",
    "usr/share/man/",
    "usr/share/man/man5/",
    "usr/share/man/man5/dhcpcd.conf.5.gz",
    "usr/share/man/man8/",
    "usr/share/man/man8/dhcpcd-run-hooks.8.gz",
    "usr/share/man/man8/dhcpcd.8.gz",
    "var/",
    "var/lib/",
    "var/lib/dhcpcd/",
];

pub const TESTING_PACKAGES: &[FixturePackage] = &[
    ("dhcpcd", "8.0.6-1", DHCPCD_FILES),
    (
        "java-openjfx-src",
        "12.0.2.u1-2",
        &[
            "usr/",
            "usr/lib/",
            "usr/lib/jvm/",
            "usr/lib/jvm/java-12-openjfx/",
            "usr/lib/jvm/java-12-openjfx/javafx-src.zip",
            "usr/share/",
            "usr/share/licenses/",
            "usr/share/licenses/java-openjfx-src",
        ],
    ),
    (
        "java11-openjfx-src",
        "11.0.3.u1-2",
        &[
            "usr/",
            "usr/lib/",
            "usr/lib/jvm/",
            "usr/lib/jvm/java-11-openjfx/",
            "usr/lib/jvm/java-11-openjfx/javafx-src.zip",
            "usr/share/",
            "usr/share/licenses/",
            "usr/share/licenses/java11-openjfx-src",
        ],
    ),
    (
        "mkinitcpio",
        "27-2",
        &[
            "etc/",
            "etc/mkinitcpio.conf",
            "usr/",
            "usr/bin/",
            "usr/bin/mkinitcpio",
        ],
    ),
];

pub const MULTILIB_PACKAGES: &[FixturePackage] = &[
    (
        "lib32-glibc",
        "2.31-1",
        &["usr/", "usr/lib32/", "usr/lib32/libc.so.6"],
    ),
    (
        "lib32-zlib",
        "1.2.11-3",
        &["usr/", "usr/lib32/", "usr/lib32/libz.so"],
    ),
];

/// Packages deliberately out of alphabetical order: upstream archive
/// order is whatever the mirror serves, and queries must not reorder it
/// except where sorted output is called for.
pub const UNSORTED_PACKAGES: &[FixturePackage] = &[
    (
        "zlib",
        "1.2.11-4",
        &[
            "usr/",
            "usr/lib/",
            "usr/lib/libz.so",
            "usr/share/licenses/zlib/LICENSE",
        ],
    ),
    (
        "acl",
        "2.2.53-2",
        &[
            "usr/",
            "usr/lib/",
            "usr/lib/libacl.so",
            "usr/share/licenses/acl/LICENSE",
        ],
    ),
];

pub enum Compression {
    Gzip,
    Zstd,
}

/// Build a compressed `.files` archive the way upstream repos serve them.
pub fn build_archive(packages: &[FixturePackage], compression: Compression) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for (name, version, files) in packages {
        let dir = format!("{}-{}", name, version);

        let desc = format!("%NAME%\n{}\n\n%VERSION%\n{}\n\n%BASE%\n{}\n", name, version, name);
        append_entry(&mut builder, &format!("{}/desc", dir), desc.as_bytes());

        let mut list = String::from("%FILES%\n");
        for file in *files {
            list.push_str(file);
            list.push('\n');
        }
        append_entry(&mut builder, &format!("{}/files", dir), list.as_bytes());
    }

    let tar = builder.into_inner().unwrap();

    match compression {
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&tar).unwrap();
            encoder.finish().unwrap()
        }
        Compression::Zstd => zstd::stream::encode_all(&tar[..], 3).unwrap(),
    }
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

/// Mirror stand-in serving fixed blobs with `Last-Modified` /
/// `If-Modified-Since` handling, like the original test suite's fakehttp
/// server.
pub struct FakeServer {
    pub base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(files: HashMap<String, (Vec<u8>, i64)>) -> Self {
        let files = Arc::new(files);

        let make_svc = make_service_fn(move |_conn| {
            let files = Arc::clone(&files);
            async move {
                Ok::<_, std::convert::Infallible>(service_fn(move |request| {
                    let files = Arc::clone(&files);
                    async move {
                        Ok::<_, std::convert::Infallible>(handle_request(&files, &request))
                    }
                }))
            }
        });

        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let base_url = format!("http://{}", server.local_addr());
        let handle = tokio::spawn(async move {
            let _ = server.await;
        });

        Self { base_url, handle }
    }

    /// A single `testing` repo serving [UNSORTED_PACKAGES].
    pub async fn start_unsorted() -> Self {
        let mut files = HashMap::new();
        files.insert(
            "/x86_64/testing/testing.files".to_string(),
            (
                build_archive(UNSORTED_PACKAGES, Compression::Gzip),
                TESTING_MTIME,
            ),
        );
        Self::start(files).await
    }

    /// The standard two-repo fixture: a gzip `testing` and a zstd
    /// `multilib` archive under the usual `/$arch/$repo/` layout.
    pub async fn start_standard() -> Self {
        let mut files = HashMap::new();
        files.insert(
            "/x86_64/testing/testing.files".to_string(),
            (
                build_archive(TESTING_PACKAGES, Compression::Gzip),
                TESTING_MTIME,
            ),
        );
        files.insert(
            "/x86_64/multilib/multilib.files".to_string(),
            (
                build_archive(MULTILIB_PACKAGES, Compression::Zstd),
                MULTILIB_MTIME,
            ),
        );
        Self::start(files).await
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn handle_request(
    files: &HashMap<String, (Vec<u8>, i64)>,
    request: &Request<Body>,
) -> Response<Body> {
    let (data, mtime) = match files.get(request.uri().path()) {
        Some(entry) => entry,
        None => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("not found"))
                .unwrap()
        }
    };

    let if_modified_since = request
        .headers()
        .get(http::header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| http_date::parse_http_date(value).ok());
    if let Some(reference) = if_modified_since {
        if *mtime <= reference {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .body(Body::empty())
                .unwrap();
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(
            http::header::LAST_MODIFIED,
            http_date::format_http_date(*mtime),
        )
        .body(Body::from(data.clone()))
        .unwrap()
}

/// Fresh scratch cache directory for one test.
pub fn scratch_cachedir(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("pkgfile-it-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    path
}

/// The pacman.conf the original test suite writes, pointed at `base_url`.
pub fn standard_config(base_url: &str) -> Config {
    let text = format!(
        "[options]\n\
         Architecture = x86_64 x86_64_v3 imnotlistening\n\
         \n\
         [testing]\n\
         Server = {base}/$arch/$repo\n\
         \n\
         [multilib]\n\
         Server = {base}/$arch/$repo\n",
        base = base_url
    );
    pkgfile_config::parse_config(std::io::Cursor::new(text)).unwrap()
}

/// A configuration with `testing` as the only repo.
pub fn single_repo_config(base_url: &str) -> Config {
    let text = format!(
        "[options]\n\
         Architecture = x86_64\n\
         \n\
         [testing]\n\
         Server = {base}/$arch/$repo\n",
        base = base_url
    );
    pkgfile_config::parse_config(std::io::Cursor::new(text)).unwrap()
}

pub async fn run_update(config: &Config, cachedir: &Path, force: bool) -> anyhow::Result<()> {
    run_update_chunked(config, cachedir, force, 100_000).await
}

pub async fn run_update_chunked(
    config: &Config,
    cachedir: &Path,
    force: bool,
    chunk_bytes: u64,
) -> anyhow::Result<()> {
    update::run_update(
        config,
        cachedir,
        &UpdateOptions { force, chunk_bytes },
    )
    .await
}

pub fn run_search(
    config: &Config,
    cachedir: &Path,
    target: &str,
    options: &query::QueryOptions,
) -> anyhow::Result<(bool, String)> {
    let store = CacheStore::new(cachedir);
    let mut out = Vec::new();
    let matched = query::search(&store, config, target, options, &mut out)?;
    Ok((matched, String::from_utf8(out).unwrap()))
}

pub fn run_list(
    config: &Config,
    cachedir: &Path,
    target: &str,
    options: &query::QueryOptions,
) -> anyhow::Result<(bool, String)> {
    let store = CacheStore::new(cachedir);
    let mut out = Vec::new();
    let matched = query::list(&store, config, target, options, &mut out)?;
    Ok((matched, String::from_utf8(out).unwrap()))
}
