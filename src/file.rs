// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::Encode,
    compression::{decompress_term, CompressionType},
    Checksum, Slice,
};
use byteorder::{ByteOrder, LittleEndian};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

pub const MAGIC_BYTES: [u8; 4] = [b'D', b'O', b'C', 1];

/// Size of the alignment grid for header records.
///
/// Headers are only ever written at multiples of this offset, so opening
/// a database scans backwards over block boundaries until it finds the
/// freshest valid header.
pub const BLOCK_SIZE: u64 = 4_096;

/// Extension of the compaction sidecar file.
pub const COMPACT_SUFFIX: &str = "compact";

// [len u32][checksum u64]
const CHUNK_TRAILER: usize = 12;

// [magic 4][len u32][checksum u64]
const HEADER_TRAILER: usize = 16;

/// Uniquely identifies one *open* database file within this process
///
/// A compaction swap re-opens the database under a fresh id, which is how
/// stale pre-compaction writes are detected.
pub type FileId = u64;

fn next_file_id() -> FileId {
    static FILE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
    FILE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An append-only database file
///
/// All writes are appends of framed, checksummed chunks; reads are
/// positional and never move a shared cursor, so any number of readers can
/// run next to the single append path.
pub struct DatabaseFile {
    id: FileId,
    path: PathBuf,
    file: File,

    /// Logical end of file; appends are serialized through this lock.
    len: Mutex<u64>,
}

impl std::fmt::Debug for DatabaseFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DatabaseFile({}, {:?})", self.id, self.path)
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = buf.get(n..).unwrap_or_default();
        offset += n as u64;
    }

    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;

        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read_exact_at reached end of file",
            ));
        }

        buf = buf.get_mut(n..).unwrap_or_default();
        offset += n as u64;
    }

    Ok(())
}

impl DatabaseFile {
    /// Opens a database file, creating it if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();

        Ok(Self {
            id: next_file_id(),
            path,
            file,
            len: Mutex::new(len),
        })
    }

    /// Creates a fresh (truncated) database file.
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self {
            id: next_file_id(),
            path,
            file,
            len: Mutex::new(0),
        })
    }

    /// Returns the process-unique id of this open file.
    #[must_use]
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Returns the path this file was opened at.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current logical file length.
    pub fn len(&self) -> u64 {
        *self.len.lock().expect("lock is poisoned")
    }

    /// Returns `true` if nothing was ever appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a framed chunk, returning its pointer.
    pub fn append_chunk(&self, payload: &[u8]) -> crate::Result<u64> {
        let mut trailer = [0u8; CHUNK_TRAILER];

        #[allow(clippy::cast_possible_truncation)]
        LittleEndian::write_u32(&mut trailer[0..4], payload.len() as u32);
        LittleEndian::write_u64(&mut trailer[4..12], Checksum::of(payload).into_u64());

        let mut len = self.len.lock().expect("lock is poisoned");
        let ptr = *len;

        write_all_at(&self.file, &trailer, ptr)?;
        write_all_at(&self.file, payload, ptr + CHUNK_TRAILER as u64)?;

        *len = ptr + CHUNK_TRAILER as u64 + payload.len() as u64;

        Ok(ptr)
    }

    /// Reads back the chunk at `ptr`, verifying its checksum.
    pub fn pread_chunk(&self, ptr: u64) -> crate::Result<Slice> {
        let file_len = self.len();

        let mut trailer = [0u8; CHUNK_TRAILER];
        read_exact_at(&self.file, &mut trailer, ptr)?;

        let payload_len = u64::from(LittleEndian::read_u32(&trailer[0..4]));
        let expected = Checksum::from_raw(LittleEndian::read_u64(&trailer[4..12]));

        if ptr + CHUNK_TRAILER as u64 + payload_len > file_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("chunk at {ptr} overruns file of length {file_len}"),
            )
            .into());
        }

        #[allow(clippy::cast_possible_truncation)]
        let mut payload = vec![0u8; payload_len as usize];
        read_exact_at(&self.file, &mut payload, ptr + CHUNK_TRAILER as u64)?;

        Checksum::of(&payload).check(expected)?;

        Ok(payload.into())
    }

    /// Encodes, compresses and appends a term.
    ///
    /// Returns the pointer and the number of stored payload bytes.
    pub fn append_term<T: Encode>(
        &self,
        term: &T,
        compression: CompressionType,
    ) -> crate::Result<(u64, u64)> {
        let raw = term.encode_into_vec()?;
        let payload = compression.compress(&raw);
        let ptr = self.append_chunk(&payload)?;
        Ok((ptr, payload.len() as u64))
    }

    /// Reads back and decompresses the term chunk at `ptr`.
    pub fn pread_term(&self, ptr: u64) -> crate::Result<Vec<u8>> {
        let chunk = self.pread_chunk(ptr)?;
        decompress_term(&chunk)
    }

    /// Appends a header record at the next block boundary.
    ///
    /// The gap up to the boundary is zero-padded; a reader can always
    /// distinguish padding from a header because headers start with
    /// [`MAGIC_BYTES`] plus a valid checksum.
    pub fn write_header(&self, payload: &[u8]) -> crate::Result<u64> {
        let mut len = self.len.lock().expect("lock is poisoned");

        let ptr = len.next_multiple_of(BLOCK_SIZE);

        let mut buf = Vec::with_capacity(HEADER_TRAILER + payload.len());
        buf.extend_from_slice(&MAGIC_BYTES);
        buf.extend_from_slice(&[0u8; 12]);

        #[allow(clippy::cast_possible_truncation)]
        LittleEndian::write_u32(&mut buf[4..8], payload.len() as u32);
        LittleEndian::write_u64(&mut buf[8..16], Checksum::of(payload).into_u64());
        buf.extend_from_slice(payload);

        if ptr > *len {
            #[allow(clippy::cast_possible_truncation)]
            let padding = vec![0u8; (ptr - *len) as usize];
            write_all_at(&self.file, &padding, *len)?;
        }

        write_all_at(&self.file, &buf, ptr)?;
        *len = ptr + buf.len() as u64;

        Ok(ptr)
    }

    /// Scans backwards over block boundaries for the freshest valid header.
    pub fn read_last_header(&self) -> crate::Result<Option<Vec<u8>>> {
        let file_len = self.len();

        if file_len == 0 {
            return Ok(None);
        }

        let mut block = ((file_len - 1) / BLOCK_SIZE) * BLOCK_SIZE;

        loop {
            if let Some(header) = self.try_read_header_at(block, file_len)? {
                return Ok(Some(header));
            }

            if block == 0 {
                return Ok(None);
            }

            block -= BLOCK_SIZE;
        }
    }

    fn try_read_header_at(&self, ptr: u64, file_len: u64) -> crate::Result<Option<Vec<u8>>> {
        if ptr + HEADER_TRAILER as u64 > file_len {
            return Ok(None);
        }

        let mut trailer = [0u8; HEADER_TRAILER];
        read_exact_at(&self.file, &mut trailer, ptr)?;

        if trailer[0..4] != MAGIC_BYTES {
            return Ok(None);
        }

        let payload_len = u64::from(LittleEndian::read_u32(&trailer[4..8]));
        let expected = Checksum::from_raw(LittleEndian::read_u64(&trailer[8..16]));

        if ptr + HEADER_TRAILER as u64 + payload_len > file_len {
            return Ok(None);
        }

        #[allow(clippy::cast_possible_truncation)]
        let mut payload = vec![0u8; payload_len as usize];
        read_exact_at(&self.file, &mut payload, ptr + HEADER_TRAILER as u64)?;

        if Checksum::of(&payload) == expected {
            Ok(Some(payload))
        } else {
            Ok(None)
        }
    }

    /// Fsyncs file data and metadata.
    pub fn sync(&self) -> crate::Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Returns the sidecar path a compaction writes into (`<db path>.compact`).
#[must_use]
pub fn compact_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(COMPACT_SUFFIX);
    PathBuf::from(s)
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(_path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}
