use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::engine::copier::{self, CopyError};

/// Opaque artifact identity. Caller-assigned or a fresh ULID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Remote placement hints (folder, name, ...). Opaque to the scheduler.
pub type TargetMetadata = BTreeMap<String, String>;

/// A local file waiting to be uploaded. Never mutated once a job exists for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub mime_type: String,
    /// blake3 hex digest of the content at capture time.
    pub content_fingerprint: String,
    #[serde(default)]
    pub target_metadata: TargetMetadata,
}

impl Artifact {
    /// Capture a file on disk: generated id, size, guessed mime type and blake3 fingerprint.
    pub fn from_file(path: impl AsRef<Path>, target_metadata: TargetMetadata) -> Result<Self, CopyError> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| copier::map_io_error(e, path))?;
        if !metadata.is_file() {
            return Err(CopyError::NotAFile(path.display().to_string()));
        }

        Ok(Self {
            id: ArtifactId::generate(),
            local_path: path.to_path_buf(),
            size_bytes: metadata.len(),
            mime_type: mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string(),
            content_fingerprint: copier::fingerprint(path)?,
            target_metadata,
        })
    }

    pub fn file_name(&self) -> Option<String> {
        self.local_path.file_name().map(|n| n.to_string_lossy().to_string())
    }
}
