//! File/image storage collaborator.
//!
//! Messages only keep the public URL and an opaque handle; the handle is what
//! gets purged when the owning message is deleted.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::error::{ChatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Image,
    File,
}

impl BlobKind {
    fn prefix(self) -> &'static str {
        match self {
            BlobKind::Image => "img",
            BlobKind::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub url: String,
    pub handle: String,
}

pub trait BlobStore: Send + Sync {
    fn upload(&self, kind: BlobKind, bytes: &[u8]) -> Result<StoredBlob>;

    /// Purging a handle that is already gone is not an error
    fn purge(&self, handle: &str) -> Result<()>;
}

/// Decode a base64 payload, tolerating a `data:<mime>;base64,` prefix
pub fn decode_inline(data: &str) -> Result<Vec<u8>> {
    let encoded = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| ChatError::Validation(format!("attachment is not valid base64: {}", e)))
}

/// Blob store backed by a local directory
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, handle: &str) -> Result<PathBuf> {
        // Handles are generated here, anything path-like was not
        if handle.is_empty() || handle.contains(['/', '\\']) || handle.contains("..") {
            return Err(ChatError::Validation(format!("invalid blob handle {}", handle)));
        }
        Ok(self.root.join(handle))
    }
}

impl BlobStore for LocalBlobStore {
    fn upload(&self, kind: BlobKind, bytes: &[u8]) -> Result<StoredBlob> {
        let handle = format!("{}-{}", kind.prefix(), uuid::Uuid::new_v4());
        fs::write(self.path_for(&handle)?, bytes)?;
        debug!(handle = %handle, size = bytes.len(), "Stored blob");
        Ok(StoredBlob {
            url: format!("{}/{}", self.base_url, handle),
            handle,
        })
    }

    fn purge(&self, handle: &str) -> Result<()> {
        match fs::remove_file(self.path_for(handle)?) {
            Ok(()) => {
                debug!(handle = %handle, "Purged blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
