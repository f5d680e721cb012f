//! Write-ahead log for the extraction ledger.
//!
//! Frame layout: `[u32 LE payload length][32-byte SHA-256 of payload][CBOR payload]`.
//! A frame cut short at the tail (torn write) ends replay; the writer truncates
//! it away, a read-only reader leaves the file untouched. A checksum mismatch
//! on a complete frame is corruption.
//!
//! The log has a single writer. Bytes past the last committed frame are the
//! remains of a failed append and are cut before the next one.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: u64 = 4 + 32;

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAL encode error: {0}")]
    Encode(String),
    #[error("WAL decode error at offset {offset}: {message}")]
    Decode { offset: u64, message: String },
    #[error("WAL checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },
    /// The replay handler refused a well-formed record
    #[error("WAL record rejected: {0}")]
    Rejected(String),
    #[error("WAL {0} is open read-only")]
    ReadOnly(PathBuf),
}

struct WalFile {
    file: File,
    /// End of the last complete frame
    committed_len: u64,
}

pub struct WriteAheadLog {
    inner: Mutex<WalFile>,
    path: PathBuf,
    writable: bool,
}

impl WriteAheadLog {
    /// Open (or create) the log for appending.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        Self::from_file(file, path, true)
    }

    /// Open an existing log without a write handle. Replay never modifies
    /// the file and appends are refused.
    pub fn open_read_only(path: &Path) -> Result<Self, WalError> {
        let file = OpenOptions::new().read(true).open(path)?;
        Self::from_file(file, path, false)
    }

    fn from_file(file: File, path: &Path, writable: bool) -> Result<Self, WalError> {
        let committed_len = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(WalFile {
                file,
                committed_len,
            }),
            path: path.to_path_buf(),
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Append one record and sync it to disk. Returns the bytes written.
    ///
    /// On failure the file is cut back to the last committed frame.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<u64, WalError> {
        if !self.writable {
            return Err(WalError::ReadOnly(self.path.clone()));
        }
        let mut payload = Vec::new();
        ciborium::ser::into_writer(record, &mut payload)
            .map_err(|e| WalError::Encode(e.to_string()))?;
        let checksum = compute_sha256(&payload);

        let mut frame = Vec::with_capacity(HEADER_LEN as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum);
        frame.extend_from_slice(&payload);

        let mut inner = self.inner.lock();
        let committed_len = inner.committed_len;
        let file_len = inner.file.metadata()?.len();
        if file_len != committed_len {
            tracing::warn!(
                path = %self.path.display(),
                offset = committed_len,
                dropped_bytes = file_len.saturating_sub(committed_len),
                "discarding partial WAL frame left by a failed append"
            );
            inner.file.set_len(committed_len)?;
        }

        let written = match inner.file.write_all(&frame) {
            Ok(()) => inner.file.sync_data(),
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(rollback) = inner.file.set_len(committed_len) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %rollback,
                    "could not roll back failed WAL append"
                );
            }
            return Err(e.into());
        }

        inner.committed_len = committed_len + frame.len() as u64;
        Ok(frame.len() as u64)
    }

    /// Replay every complete record in order.
    pub fn replay<T, F>(&self, mut handler: F) -> Result<usize, WalError>
    where
        T: DeserializeOwned,
        F: FnMut(T) -> Result<(), WalError>,
    {
        let mut inner = self.inner.lock();
        let file_len = inner.file.metadata()?.len();
        inner.file.seek(SeekFrom::Start(0))?;

        let mut offset = 0u64;
        let mut count = 0usize;
        let mut torn = false;
        while offset < file_len {
            if file_len - offset < HEADER_LEN {
                torn = true;
                break;
            }

            let mut len_bytes = [0u8; 4];
            inner.file.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as u64;
            let mut checksum = [0u8; 32];
            inner.file.read_exact(&mut checksum)?;

            if file_len - offset - HEADER_LEN < len {
                torn = true;
                break;
            }

            let mut payload = vec![0u8; len as usize];
            match inner.file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    torn = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            if compute_sha256(&payload) != checksum {
                return Err(WalError::ChecksumMismatch { offset });
            }

            let record: T =
                ciborium::de::from_reader(payload.as_slice()).map_err(|e| WalError::Decode {
                    offset,
                    message: e.to_string(),
                })?;
            handler(record)?;

            offset += HEADER_LEN + len;
            count += 1;
        }

        if torn {
            if self.writable {
                tracing::warn!(
                    path = %self.path.display(),
                    offset,
                    dropped_bytes = file_len - offset,
                    "truncating torn trailing WAL frame"
                );
                inner.file.set_len(offset)?;
            } else {
                tracing::debug!(
                    path = %self.path.display(),
                    offset,
                    pending_bytes = file_len - offset,
                    "stopping replay at incomplete trailing frame"
                );
            }
        }
        inner.committed_len = offset;
        inner.file.seek(SeekFrom::End(0))?;
        Ok(count)
    }
}

fn compute_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
