//! Encoder and mmap-backed reader for repo chunk files.
//!
//! A repository database is split into chunk files, each holding a
//! contiguous run of packages. Chunks split between packages, never within
//! one, so a chunk is always self contained.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use proxmox_io::ReadExt;
use proxmox_sys::mmap::Mmap;

use crate::file_formats::{
    PackageIndexEntry, RepoChunkHeader, DATABASE_VERSION, REPO_CHUNK_MAGIC_1_0,
};
use crate::repo_archive::Package;

/// Default target size for one chunk file.
pub const DEFAULT_REPO_CHUNK_BYTES: u64 = 32 * 1024 * 1024;

const HEADER_SIZE: usize = std::mem::size_of::<RepoChunkHeader>();
const INDEX_ENTRY_SIZE: usize = std::mem::size_of::<PackageIndexEntry>();

fn encoded_package_size(package: &Package) -> usize {
    let strings = package.name.len()
        + package.version.len()
        + package.base.as_ref().map(String::len).unwrap_or(0);
    let files: usize = package.files.iter().map(|path| path.len() + 1).sum();
    INDEX_ENTRY_SIZE + strings + files
}

/// Serialize `packages` into chunk blobs of roughly `chunk_target_bytes`.
///
/// A new chunk starts whenever the current one is non-empty and appending
/// the next package would exceed the target, so a single oversized package
/// still fits into a chunk of its own. At least one chunk is always
/// produced, even for an empty package list.
pub fn encode_chunks(packages: &[Package], chunk_target_bytes: u64) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();

    let mut start = 0;
    let mut size = HEADER_SIZE;
    for (pos, package) in packages.iter().enumerate() {
        let package_size = encoded_package_size(package);
        if pos > start && (size + package_size) as u64 > chunk_target_bytes {
            chunks.push(encode_chunk(&packages[start..pos]));
            start = pos;
            size = HEADER_SIZE;
        }
        size += package_size;
    }
    chunks.push(encode_chunk(&packages[start..]));

    chunks
}

fn encode_chunk(packages: &[Package]) -> Vec<u8> {
    let index_size = packages.len() * INDEX_ENTRY_SIZE;

    let mut index = Vec::with_capacity(index_size);
    let mut strings = Vec::new();

    for package in packages {
        let mut append = |data: &[u8]| -> (u64, u64) {
            let offset = (index_size + strings.len()) as u64;
            strings.extend_from_slice(data);
            (offset, data.len() as u64)
        };

        let (name_offset, name_len) = append(package.name.as_bytes());
        let (version_offset, version_len) = append(package.version.as_bytes());
        let (base_offset, base_len) = match package.base {
            Some(ref base) => append(base.as_bytes()),
            None => (0, 0),
        };
        let files_offset = (index_size + strings.len()) as u64;
        for path in &package.files {
            strings.extend_from_slice(path);
            strings.push(0);
        }
        let files_len = (index_size + strings.len()) as u64 - files_offset;

        let entry = PackageIndexEntry {
            name_offset: name_offset.to_le(),
            name_len: name_len.to_le(),
            version_offset: version_offset.to_le(),
            version_len: version_len.to_le(),
            base_offset: base_offset.to_le(),
            base_len: base_len.to_le(),
            files_offset: files_offset.to_le(),
            files_len: files_len.to_le(),
        };
        entry.write_le_bytes(&mut index);
    }

    let mut header = RepoChunkHeader::zeroed();
    header.magic = REPO_CHUNK_MAGIC_1_0;
    header.format_version = DATABASE_VERSION.to_le();
    header.package_count = (packages.len() as u64).to_le();
    header.index_offset = 0u64.to_le();
    header.strings_offset = (index_size as u64).to_le();

    let mut chunk = Vec::with_capacity(HEADER_SIZE + index.len() + strings.len());
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(&index);
    chunk.extend_from_slice(&strings);

    chunk
}

/// Read-only view of one mmap'd chunk file.
pub struct RepoChunkReader {
    _file: File,
    payload: Option<Mmap<u8>>,
    package_count: usize,
    index_offset: usize,
}

impl RepoChunkReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        File::open(path)
            .map_err(Error::from)
            .and_then(Self::new)
            .map_err(|err| format_err!("unable to open repo chunk {:?} - {}", path, err))
    }

    pub fn new(mut file: File) -> Result<Self, Error> {
        file.seek(SeekFrom::Start(0))?;

        let rawfd = file.as_raw_fd();
        let stat = match nix::sys::stat::fstat(rawfd) {
            Ok(stat) => stat,
            Err(err) => bail!("fstat failed - {}", err),
        };

        let size = stat.st_size as usize;
        if size < HEADER_SIZE {
            bail!("chunk file too small ({})", stat.st_size);
        }

        let header: Box<RepoChunkHeader> = unsafe { file.read_host_value_boxed()? };

        if header.magic != REPO_CHUNK_MAGIC_1_0 {
            bail!("got unknown magic number");
        }
        let format_version = u64::from_le(header.format_version);
        if format_version != DATABASE_VERSION {
            bail!("got unsupported chunk format version ({})", format_version);
        }

        let package_count = u64::from_le(header.package_count) as usize;
        let index_offset = u64::from_le(header.index_offset) as usize;
        let strings_offset = u64::from_le(header.strings_offset) as usize;

        let payload_size = size - HEADER_SIZE;

        let index_end = package_count
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|len| len.checked_add(index_offset))
            .ok_or_else(|| format_err!("invalid package index size"))?;
        if index_end > payload_size || strings_offset > payload_size {
            bail!(
                "got unexpected file size ({} < {})",
                payload_size,
                index_end.max(strings_offset)
            );
        }

        let payload = if payload_size > 0 {
            Some(unsafe {
                Mmap::map_fd(
                    rawfd,
                    HEADER_SIZE as u64,
                    payload_size,
                    nix::sys::mman::ProtFlags::PROT_READ,
                    nix::sys::mman::MapFlags::MAP_PRIVATE,
                )?
            })
        } else {
            None
        };

        Ok(Self {
            _file: file,
            payload,
            package_count,
            index_offset,
        })
    }

    pub fn package_count(&self) -> usize {
        self.package_count
    }

    /// Zero-copy view of the package at index `pos`.
    pub fn package(&self, pos: usize) -> Result<PackageRef<'_>, Error> {
        if pos >= self.package_count {
            bail!(
                "package index out of range ({} >= {})",
                pos,
                self.package_count
            );
        }
        let payload: &[u8] = self.payload.as_deref().unwrap();

        let entry_offset = self.index_offset + pos * INDEX_ENTRY_SIZE;
        let raw: &[u8; 64] = payload[entry_offset..entry_offset + INDEX_ENTRY_SIZE]
            .try_into()
            .unwrap();
        let entry = PackageIndexEntry::from_le_bytes(raw);

        let slice = |offset: u64, len: u64| -> Result<&[u8], Error> {
            let end = offset
                .checked_add(len)
                .ok_or_else(|| format_err!("string region offset overflow"))?;
            if end as usize > payload.len() {
                bail!("string region entry out of range");
            }
            Ok(&payload[offset as usize..end as usize])
        };

        Ok(PackageRef {
            name: slice(entry.name_offset, entry.name_len)?,
            version: slice(entry.version_offset, entry.version_len)?,
            base: if entry.base_len > 0 {
                Some(slice(entry.base_offset, entry.base_len)?)
            } else {
                None
            },
            files: slice(entry.files_offset, entry.files_len)?,
        })
    }

    /// Iterate over all packages, stopping at the first corrupt entry.
    pub fn packages(&self) -> impl Iterator<Item = Result<PackageRef<'_>, Error>> {
        (0..self.package_count).map(move |pos| self.package(pos))
    }
}

/// Borrowed view of one package inside a mapped chunk.
#[derive(Clone, Copy)]
pub struct PackageRef<'a> {
    pub name: &'a [u8],
    pub version: &'a [u8],
    pub base: Option<&'a [u8]>,
    files: &'a [u8],
}

impl<'a> PackageRef<'a> {
    /// The package's paths in upstream order.
    pub fn files(&self) -> FileEntries<'a> {
        FileEntries { data: self.files }
    }

    pub fn to_package(&self) -> Result<Package, Error> {
        let text = |data: &[u8]| -> Result<String, Error> {
            String::from_utf8(data.to_vec())
                .map_err(|_| format_err!("non-utf8 package metadata"))
        };
        Ok(Package {
            name: text(self.name)?,
            version: text(self.version)?,
            base: self.base.map(text).transpose()?,
            files: self.files().map(|path| path.to_vec()).collect(),
        })
    }
}

/// Iterator over the NUL-terminated paths of one package.
pub struct FileEntries<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for FileEntries<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.data.is_empty() {
            return None;
        }
        match self.data.iter().position(|b| *b == 0) {
            Some(pos) => {
                let entry = &self.data[..pos];
                self.data = &self.data[pos + 1..];
                Some(entry)
            }
            None => {
                let entry = self.data;
                self.data = &[];
                Some(entry)
            }
        }
    }
}
