//! Decoder for upstream `<repo>.files` archives.
//!
//! The archive is a compressed tar stream with one directory per package
//! (`<pkgname>-<version>/`) holding a `files` entry and usually a `desc`
//! entry. Compression is sniffed from the leading magic bytes; mirrors are
//! not trusted to label their archives correctly.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};

use anyhow::{bail, format_err, Error};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const XZ_MAGIC: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];

/// A single package record decoded from an upstream archive.
///
/// `files` holds the package's paths rooted at `/`, in the exact order the
/// archive listed them. Directory entries keep their trailing slash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub base: Option<String>,
    pub files: Vec<Vec<u8>>,
}

#[derive(Default)]
struct PackageBuilder {
    directory: String,
    name: Option<String>,
    version: Option<String>,
    base: Option<String>,
    files: Option<Vec<Vec<u8>>>,
}

impl PackageBuilder {
    fn finish(self) -> Result<Package, Error> {
        let files = self
            .files
            .ok_or_else(|| format_err!("package entry '{}' has no file list", self.directory))?;

        let (name, version) = match (self.name, self.version) {
            (Some(name), Some(version)) => (name, version),
            // no desc entry, fall back to the directory name
            _ => split_dir_name(&self.directory)?,
        };

        Ok(Package {
            name,
            version,
            base: self.base,
            files,
        })
    }
}

/// Wrap `reader` with the matching decompressor, sniffed by magic bytes.
pub fn decompress_reader<'a, R: Read + 'a>(reader: R) -> Result<Box<dyn Read + 'a>, Error> {
    let mut reader = BufReader::new(reader);

    let magic = reader.fill_buf()?;
    if magic.starts_with(GZIP_MAGIC) {
        Ok(Box::new(flate2::read::GzDecoder::new(reader)))
    } else if magic.starts_with(ZSTD_MAGIC) {
        Ok(Box::new(zstd::stream::read::Decoder::with_buffer(reader)?))
    } else if magic.starts_with(XZ_MAGIC) {
        Ok(Box::new(xz2::read::XzDecoder::new(reader)))
    } else {
        bail!("unrecognized archive compression (bad magic)");
    }
}

/// Decode a complete `.files` archive into package records.
///
/// Packages are returned in the order their directories first appear in the
/// archive. Truncated streams, missing `%FILES%` headers and malformed
/// metadata all fail here; the update pipeline treats that like a failed
/// download and falls back to the next mirror.
pub fn read_packages<R: Read>(reader: R) -> Result<Vec<Package>, Error> {
    let decompressed = decompress_reader(reader)?;
    let mut archive = tar::Archive::new(decompressed);

    let mut builders: Vec<PackageBuilder> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry.map_err(|err| format_err!("corrupt archive - {}", err))?;

        let path = entry.path()?;
        let path = path
            .to_str()
            .ok_or_else(|| format_err!("corrupt archive - non-utf8 entry name"))?
            .trim_end_matches('/')
            .to_owned();

        let (directory, file_name) = match path.split_once('/') {
            Some((directory, file_name)) => (directory.to_owned(), file_name.to_owned()),
            None => continue, // directory entry itself
        };

        let pos = match index.get(&directory) {
            Some(pos) => *pos,
            None => {
                builders.push(PackageBuilder {
                    directory: directory.clone(),
                    ..Default::default()
                });
                index.insert(directory, builders.len() - 1);
                builders.len() - 1
            }
        };

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|err| format_err!("corrupt archive - {}", err))?;

        match file_name.as_str() {
            "files" => builders[pos].files = Some(parse_files_list(&data)?),
            "desc" => parse_desc(&data, &mut builders[pos])?,
            _ => (),
        }
    }

    builders.into_iter().map(PackageBuilder::finish).collect()
}

/// Parse a `files` entry: a `%FILES%` header followed by one path per line.
///
/// Entries are repo relative in the archive and get rooted at `/` here. A
/// further `%...%` header (e.g. `%BACKUP%`) ends the list.
fn parse_files_list(data: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
    let mut lines = data.split(|b| *b == b'\n');

    match lines.next() {
        Some(b"%FILES%") => (),
        _ => bail!("file list lacks a %FILES% header"),
    }

    let mut files = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(b"%") && line.ends_with(b"%") {
            break;
        }
        let mut path = Vec::with_capacity(line.len() + 1);
        path.push(b'/');
        path.extend_from_slice(line);
        files.push(path);
    }

    Ok(files)
}

/// Parse a `desc` entry: `%KEY%` lines each followed by their value lines.
fn parse_desc(data: &[u8], builder: &mut PackageBuilder) -> Result<(), Error> {
    let data = std::str::from_utf8(data)
        .map_err(|_| format_err!("corrupt archive - non-utf8 desc entry"))?;

    let mut key: Option<&str> = None;
    for line in data.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            key = None;
            continue;
        }
        if line.starts_with('%') && line.ends_with('%') && line.len() > 2 {
            key = Some(&line[1..line.len() - 1]);
            continue;
        }
        match key {
            Some("NAME") => builder.name = Some(line.to_owned()),
            Some("VERSION") => builder.version = Some(line.to_owned()),
            Some("BASE") => builder.base = Some(line.to_owned()),
            _ => (),
        }
    }

    Ok(())
}

/// Split `<pkgname>-<pkgver>-<pkgrel>` into name and version.
fn split_dir_name(directory: &str) -> Result<(String, String), Error> {
    let rel_dash = directory
        .rfind('-')
        .ok_or_else(|| format_err!("malformed package directory name '{}'", directory))?;
    let ver_dash = directory[..rel_dash]
        .rfind('-')
        .ok_or_else(|| format_err!("malformed package directory name '{}'", directory))?;

    if ver_dash == 0 || rel_dash + 1 == directory.len() {
        bail!("malformed package directory name '{}'", directory);
    }

    Ok((
        directory[..ver_dash].to_owned(),
        directory[ver_dash + 1..].to_owned(),
    ))
}
