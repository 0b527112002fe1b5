// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

// openssl::sha::sha256(b"pkgfile repository chunk v1.0")[0..8]
pub const REPO_CHUNK_MAGIC_1_0: [u8; 8] = [216, 89, 73, 237, 99, 108, 212, 49];

/// Version of the on-disk database format.
///
/// Written to the `.db_version` marker and into every chunk header. Readers
/// refuse databases written with any other version.
pub const DATABASE_VERSION: u64 = 1;

/// Name of the version marker file at the cache directory root.
pub const DB_VERSION_FILENAME: &str = ".db_version";

/// Header format definition for repo chunk files (`<repo>.files.NNN`)
///
/// All integers are little endian. Offsets are relative to the start of the
/// payload, which begins directly after this header. The header occupies a
/// whole page so the payload can be mapped page aligned.
#[repr(C)]
pub struct RepoChunkHeader {
    pub magic: [u8; 8],
    pub format_version: u64,
    pub package_count: u64,
    pub index_offset: u64,
    pub strings_offset: u64,
    reserved: [u8; 4056], // overall size is one page (4096 bytes)
}
proxmox_lang::static_assert_size!(RepoChunkHeader, 4096);

impl RepoChunkHeader {
    /// Convenience method to allocate a zero-initialized header struct.
    pub fn zeroed() -> Box<Self> {
        unsafe {
            Box::from_raw(std::alloc::alloc_zeroed(std::alloc::Layout::new::<Self>()) as *mut Self)
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self as *const Self as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }
}

/// One record of the package index inside a chunk.
///
/// Offsets point into the chunk payload; lengths are in bytes. A
/// `base_len` of zero means the package has no base name. The files blob
/// holds the package's paths in upstream order, each terminated by a single
/// NUL byte.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct PackageIndexEntry {
    pub name_offset: u64,
    pub name_len: u64,
    pub version_offset: u64,
    pub version_len: u64,
    pub base_offset: u64,
    pub base_len: u64,
    pub files_offset: u64,
    pub files_len: u64,
}
proxmox_lang::static_assert_size!(PackageIndexEntry, 64);

impl PackageIndexEntry {
    /// Decode one index record from its on-disk little endian form.
    pub fn from_le_bytes(data: &[u8; 64]) -> Self {
        let field = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[i * 8..i * 8 + 8]);
            u64::from_le_bytes(buf)
        };
        Self {
            name_offset: field(0),
            name_len: field(1),
            version_offset: field(2),
            version_len: field(3),
            base_offset: field(4),
            base_len: field(5),
            files_offset: field(6),
            files_len: field(7),
        }
    }

    pub fn write_le_bytes(&self, out: &mut Vec<u8>) {
        for value in [
            self.name_offset,
            self.name_len,
            self.version_offset,
            self.version_len,
            self.base_offset,
            self.base_len,
            self.files_offset,
            self.files_len,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}
