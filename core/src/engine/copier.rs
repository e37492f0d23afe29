use std::{
	fs,
	io::{self, Read, Write},
	path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::transport::{TransferError, Transport};
use crate::models::{Artifact, TargetMetadata};

/// Read buffer for streaming copies and fingerprints.
const CHUNK_SIZE: usize = 256 * 1024;

/// Target metadata keys understood by [`DirectoryTransport`].
pub const TARGET_FOLDER: &str = "folder";
pub const TARGET_NAME: &str = "name";

/// Filesystem-level failure while capturing or delivering an artifact.
#[derive(Debug, Error)]
pub enum CopyError {
	#[error("artifact file is missing: {0}")]
	SourceNotFound(String),

	#[error("{0} is not a regular file")]
	NotAFile(String),

	#[error("access denied to {0}")]
	PermissionDenied(String),

	#[error("no space left writing {0}")]
	NoSpace(String),

	#[error("{0}")]
	Io(String),

	#[error("bad target metadata: {0}")]
	InvalidTarget(String),

	#[error("artifact content changed since capture (fingerprint {expected}, now {actual})")]
	SourceChanged { expected: String, actual: String },

	#[error("delivered copy does not verify (wrote {written}, read back {read_back})")]
	VerifyFailed { written: String, read_back: String },
}

impl CopyError {
	/// Whether retrying later can succeed: a flaky read or write, or a copy
	/// that came back corrupted.
	pub fn is_retryable(&self) -> bool {
		matches!(self, CopyError::Io(_) | CopyError::VerifyFailed { .. })
	}

	pub fn into_transfer_error(self) -> TransferError {
		if self.is_retryable() {
			TransferError::Transient(self.to_string())
		} else {
			TransferError::Permanent(self.to_string())
		}
	}
}

/// What a finished delivery wrote.
#[derive(Debug, Clone)]
struct Delivery {
	bytes_written: u64,
	fingerprint: String,
}

/// Uploads into a directory tree: a mounted share, a sync folder, a staging area.
///
/// The destination is `root/<folder>/<name>`; `name` defaults to the source file
/// name. The remote id is the destination path relative to `root`.
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
	root: PathBuf,
}

impl DirectoryTransport {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Resolve the relative destination for an artifact.
	pub fn destination_for(&self, artifact: &Artifact, target: &TargetMetadata) -> Result<PathBuf, CopyError> {
		let name = match target.get(TARGET_NAME) {
			Some(name) => name.clone(),
			None => artifact
				.file_name()
				.ok_or_else(|| CopyError::InvalidTarget(format!("no file name for {}", artifact.id)))?,
		};

		let mut relative = PathBuf::new();
		if let Some(folder) = target.get(TARGET_FOLDER) {
			relative.push(checked_relative(folder)?);
		}
		let name_path = checked_relative(&name)?;
		if name_path.components().count() != 1 {
			return Err(CopyError::InvalidTarget(format!("name must be a single path segment: {name}")));
		}
		relative.push(name_path);
		Ok(relative)
	}
}

#[async_trait]
impl Transport for DirectoryTransport {
	async fn send(&self, artifact: &Artifact, target: &TargetMetadata) -> Result<String, TransferError> {
		let relative = self.destination_for(artifact, target).map_err(CopyError::into_transfer_error)?;
		let dest = self.root.join(&relative);
		let source = artifact.local_path.clone();
		let expected = artifact.content_fingerprint.clone();

		let delivery = tokio::task::spawn_blocking(move || deliver(&source, &dest, &expected))
			.await
			.map_err(|e| TransferError::Transient(format!("copy task aborted: {e}")))?
			.map_err(CopyError::into_transfer_error)?;

		debug!(
			artifact_id = %artifact.id,
			bytes = delivery.bytes_written,
			fingerprint = %delivery.fingerprint,
			"artifact delivered"
		);

		Ok(relative.to_string_lossy().replace('\\', "/"))
	}

	fn name(&self) -> &str {
		"directory"
	}
}

/// Reject absolute paths and any `..` or root component in caller metadata.
fn checked_relative(value: &str) -> Result<PathBuf, CopyError> {
	let path = Path::new(value);
	let mut out = PathBuf::new();
	for component in path.components() {
		match component {
			Component::Normal(part) => out.push(part),
			Component::CurDir => {}
			_ => return Err(CopyError::InvalidTarget(format!("path escapes remote root: {value}"))),
		}
	}
	if out.as_os_str().is_empty() {
		return Err(CopyError::InvalidTarget(format!("empty path: {value:?}")));
	}
	Ok(out)
}

/// Stream the source into `<dest>.part` while fingerprinting it, check the
/// fingerprint against the one taken at capture, read the copy back, then
/// rename it into place. Blocking; run it on `spawn_blocking`.
fn deliver(source_path: &Path, dest_path: &Path, expected: &str) -> Result<Delivery, CopyError> {
	if let Some(parent) = dest_path.parent() {
		fs::create_dir_all(parent).map_err(|e| map_io_error(e, parent))?;
	}

	let mut source = fs::File::open(source_path).map_err(|e| map_io_error(e, source_path))?;

	// Sibling of the destination so the rename never crosses filesystems.
	let partial = PartialFile::new(dest_path);
	let mut out = fs::File::create(&partial.path).map_err(|e| map_io_error(e, &partial.path))?;

	let mut hasher = blake3::Hasher::new();
	let mut chunk = vec![0u8; CHUNK_SIZE];
	let mut bytes_written = 0u64;
	loop {
		let n = source.read(&mut chunk).map_err(|e| map_io_error(e, source_path))?;
		if n == 0 {
			break;
		}
		hasher.update(&chunk[..n]);
		out.write_all(&chunk[..n]).map_err(|e| map_io_error(e, &partial.path))?;
		bytes_written += n as u64;
	}
	out.flush().and_then(|_| out.sync_all()).map_err(|e| map_io_error(e, &partial.path))?;
	drop(out);

	let written = hasher.finalize().to_hex().to_string();
	if written != expected {
		return Err(CopyError::SourceChanged { expected: expected.to_string(), actual: written });
	}

	let read_back = fingerprint(&partial.path)?;
	if read_back != written {
		return Err(CopyError::VerifyFailed { written, read_back });
	}

	partial.commit(dest_path)?;
	Ok(Delivery { bytes_written, fingerprint: written })
}

/// A `.part` file that is removed on drop unless renamed into place.
struct PartialFile {
	path: PathBuf,
	committed: bool,
}

impl PartialFile {
	fn new(dest: &Path) -> Self {
		Self { path: partial_path(dest), committed: false }
	}

	fn commit(mut self, dest: &Path) -> Result<(), CopyError> {
		fs::rename(&self.path, dest).map_err(|e| map_io_error(e, dest))?;
		self.committed = true;
		Ok(())
	}
}

impl Drop for PartialFile {
	fn drop(&mut self) {
		if !self.committed {
			let _ = fs::remove_file(&self.path);
		}
	}
}

fn partial_path(dest: &Path) -> PathBuf {
	let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	name.push(".part");
	dest.with_file_name(name)
}

/// blake3 hex digest of a file's contents.
pub fn fingerprint(path: &Path) -> Result<String, CopyError> {
	let file = fs::File::open(path).map_err(|e| map_io_error(e, path))?;
	let mut reader = io::BufReader::with_capacity(CHUNK_SIZE, file);
	let mut hasher = blake3::Hasher::new();
	io::copy(&mut reader, &mut hasher).map_err(|e| map_io_error(e, path))?;
	Ok(hasher.finalize().to_hex().to_string())
}

pub(crate) fn map_io_error(err: io::Error, path: &Path) -> CopyError {
	let shown = path.display().to_string();
	match err.kind() {
		io::ErrorKind::NotFound => CopyError::SourceNotFound(shown),
		io::ErrorKind::PermissionDenied => CopyError::PermissionDenied(shown),
		io::ErrorKind::StorageFull => CopyError::NoSpace(shown),
		_ => CopyError::Io(format!("{shown}: {err}")),
	}
}
