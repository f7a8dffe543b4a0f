//! Content-addressed blob store for document bytes.
//!
//! Bytes live under `{root}/{category}/{YYYY}/{MM}/{document-id}/{name}`.
//! Every path segment is sanitized before touching the filesystem, so a
//! hostile file name cannot escape the root. Writes are atomic
//! (write-temp-then-rename) and checksummed with SHA-256; a write whose
//! bytes disagree with existing content at the same path is rejected.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use firma_sign_proto::ids::Timestamp;
use firma_sign_proto::transfer::DocumentCategory;

/// Default maximum file size (500 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Errors from the blob store.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The path escapes the root or contains no valid segments.
    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    /// No blob exists at the path.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The payload exceeds the configured maximum.
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge {
        /// Payload size.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// Stored bytes disagree with the expected checksum.
    #[error("checksum mismatch at {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Relative path of the blob.
        path: String,
        /// Expected SHA-256 hex.
        expected: String,
        /// Actual SHA-256 hex.
        actual: String,
    },

    /// An underlying I/O error.
    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Entry name.
    pub name: String,
    /// Whether the entry is a file or a directory.
    pub kind: BlobEntryKind,
}

/// Kind of a listing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobEntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// Options for a [`BlobStore`].
#[derive(Debug, Clone)]
pub struct BlobStoreOptions {
    /// Maximum accepted payload size.
    pub max_file_size: u64,
    /// Re-verify the checksum on every read.
    pub use_checksum: bool,
}

impl Default for BlobStoreOptions {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            use_checksum: true,
        }
    }
}

/// Sanitizes a single file or directory name: every character outside
/// `[A-Za-z0-9.-]` becomes `_`, and runs of dots collapse to one so the
/// result never contains `..`.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    let mut prev_dot = false;
    for c in name.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
            c
        } else {
            '_'
        };
        if mapped == '.' {
            if prev_dot {
                continue;
            }
            prev_dot = true;
        } else {
            prev_dot = false;
        }
        cleaned.push(mapped);
    }
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Computes the SHA-256 of `bytes` as lower-case hex.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Content-addressed file store rooted at a configurable path.
pub struct BlobStore {
    root: PathBuf,
    options: BlobStoreOptions,
}

impl BlobStore {
    /// Creates a store rooted at `root`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Io`] when the root cannot be created.
    pub fn new(root: impl Into<PathBuf>, options: BlobStoreOptions) -> Result<Self, BlobError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, options })
    }

    /// Builds the relative storage path for a document:
    /// `{category}/{YYYY}/{MM}/{document-id}/{sanitized-name}`.
    #[must_use]
    pub fn document_path(
        category: DocumentCategory,
        created_at: Timestamp,
        document_id: &str,
        file_name: &str,
    ) -> String {
        use chrono::Datelike;
        let millis = i64::try_from(created_at.as_millis()).unwrap_or(0);
        let date = chrono::DateTime::from_timestamp_millis(millis)
            .unwrap_or_else(|| chrono::DateTime::from_timestamp_millis(0).unwrap_or_default());
        format!(
            "{}/{:04}/{:02}/{}/{}",
            category.as_str(),
            date.year(),
            date.month(),
            sanitize_name(document_id),
            sanitize_name(file_name),
        )
    }

    /// Resolves a relative path against the root, sanitizing every
    /// segment.
    fn resolve(&self, relpath: &str) -> Result<PathBuf, BlobError> {
        let mut out = self.root.clone();
        let mut segments = 0;
        for segment in relpath.split('/') {
            if segment.is_empty() {
                continue;
            }
            if segment == "." || segment == ".." {
                return Err(BlobError::InvalidPath(relpath.to_string()));
            }
            out.push(sanitize_name(segment));
            segments += 1;
        }
        if segments == 0 {
            return Err(BlobError::InvalidPath(relpath.to_string()));
        }
        Ok(out)
    }

    /// Writes `bytes` at `relpath` atomically and returns the SHA-256
    /// hex of the content.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::TooLarge`] over the size cap,
    /// [`BlobError::ChecksumMismatch`] when different content already
    /// exists at the path, or [`BlobError::Io`].
    pub fn save(&self, relpath: &str, bytes: &[u8]) -> Result<String, BlobError> {
        let size = bytes.len() as u64;
        if size > self.options.max_file_size {
            return Err(BlobError::TooLarge {
                size,
                max: self.options.max_file_size,
            });
        }
        let path = self.resolve(relpath)?;
        let hash = sha256_hex(bytes);

        if path.exists() {
            let existing = std::fs::read(&path)?;
            let existing_hash = sha256_hex(&existing);
            if existing_hash != hash {
                return Err(BlobError::ChecksumMismatch {
                    path: relpath.to_string(),
                    expected: existing_hash,
                    actual: hash,
                });
            }
            // Identical content already stored.
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp-write");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(hash)
    }

    /// Reads the blob at `relpath`, optionally verifying it against
    /// `expected_hash` when the store was configured with checksums.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::NotFound`] for a missing blob or
    /// [`BlobError::ChecksumMismatch`] when verification fails.
    pub fn read(&self, relpath: &str, expected_hash: Option<&str>) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(relpath)?;
        if !path.is_file() {
            return Err(BlobError::NotFound(relpath.to_string()));
        }
        let bytes = std::fs::read(&path)?;
        if self.options.use_checksum
            && let Some(expected) = expected_hash
        {
            let actual = sha256_hex(&bytes);
            if actual != expected {
                return Err(BlobError::ChecksumMismatch {
                    path: relpath.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    /// Deletes the blob at `relpath`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::NotFound`] when nothing exists there.
    pub fn delete(&self, relpath: &str) -> Result<(), BlobError> {
        let path = self.resolve(relpath)?;
        if !path.is_file() {
            return Err(BlobError::NotFound(relpath.to_string()));
        }
        std::fs::remove_file(&path)?;
        Ok(())
    }

    /// Returns whether a blob exists at `relpath`.
    #[must_use]
    pub fn exists(&self, relpath: &str) -> bool {
        self.resolve(relpath).is_ok_and(|path| path.is_file())
    }

    /// Lists entries under a directory, typed as file or directory.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::NotFound`] for a missing directory.
    pub fn list(&self, dir: &str) -> Result<Vec<BlobEntry>, BlobError> {
        let path = if dir.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir)?
        };
        if !path.is_dir() {
            return Err(BlobError::NotFound(dir.to_string()));
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let kind = if entry.file_type()?.is_dir() {
                BlobEntryKind::Directory
            } else {
                BlobEntryKind::File
            };
            entries.push(BlobEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
