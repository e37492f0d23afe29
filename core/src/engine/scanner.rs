use std::path::Path;

use thiserror::Error;
use walkdir::WalkDir;

use super::copier::{CopyError, TARGET_FOLDER};
use crate::models::{Artifact, TargetMetadata};

#[derive(Debug, Error)]
pub enum ScanError {
	#[error("path does not exist: {0}")]
	PathNotExists(String),

	#[error("failed to capture {path}: {source}")]
	Capture {
		path: String,
		#[source]
		source: CopyError,
	},
}

#[derive(Debug)]
pub struct ScanResult {
	pub artifacts: Vec<Artifact>,
	pub total_bytes: u64,
	pub skipped_entries: u64,
}

/// Capture every regular file under `path` as an artifact.
///
/// A single file yields one artifact. For a directory, each file's parent
/// directory (relative to `path`) is appended to the `folder` target key so the
/// remote layout mirrors the local one. Symlinks and unreadable entries are skipped.
pub fn collect_artifacts(path: &Path, target: &TargetMetadata) -> Result<ScanResult, ScanError> {
	if !path.exists() {
		return Err(ScanError::PathNotExists(path.display().to_string()));
	}

	if path.is_file() {
		let artifact = capture(path, target.clone())?;
		return Ok(ScanResult {
			total_bytes: artifact.size_bytes,
			artifacts: vec![artifact],
			skipped_entries: 0,
		});
	}

	let mut artifacts = Vec::new();
	let mut skipped = 0u64;

	for result in WalkDir::new(path).follow_links(false).sort_by_file_name() {
		let entry = match result {
			Ok(e) => e,
			Err(_) => {
				skipped += 1;
				continue;
			}
		};

		if entry.file_type().is_dir() || entry.file_type().is_symlink() {
			if entry.file_type().is_symlink() {
				skipped += 1;
			}
			continue;
		}

		let relative_parent = entry
			.path()
			.parent()
			.and_then(|p| p.strip_prefix(path).ok())
			.map(|p| p.to_string_lossy().replace('\\', "/"))
			.unwrap_or_default();

		let mut file_target = target.clone();
		if !relative_parent.is_empty() {
			let folder = match target.get(TARGET_FOLDER) {
				Some(base) => format!("{}/{relative_parent}", base.trim_end_matches('/')),
				None => relative_parent,
			};
			file_target.insert(TARGET_FOLDER.to_string(), folder);
		}

		match Artifact::from_file(entry.path(), file_target) {
			Ok(artifact) => artifacts.push(artifact),
			Err(CopyError::SourceNotFound(_)) | Err(CopyError::PermissionDenied(_)) => skipped += 1,
			Err(source) => {
				return Err(ScanError::Capture {
					path: entry.path().display().to_string(),
					source,
				})
			}
		}
	}

	let total_bytes = artifacts.iter().map(|a| a.size_bytes).sum();
	Ok(ScanResult { artifacts, total_bytes, skipped_entries: skipped })
}

fn capture(path: &Path, target: TargetMetadata) -> Result<Artifact, ScanError> {
	Artifact::from_file(path, target).map_err(|source| ScanError::Capture {
		path: path.display().to_string(),
		source,
	})
}
