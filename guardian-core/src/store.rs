//! On-disk half of component D: one token file per cloister, under a
//! single 0700 directory (spec.md §4.D, §7).

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::Strng;
use crate::error::TokenError;

/// The JSON shape written for each cloister. Older installs may instead
/// have a file whose entire contents is the raw 64-char token; `Load`
/// tolerates both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFile {
	pub token: String,
	pub project: String,
	#[serde(default)]
	pub workspace: String,
}

/// Reads and writes the `tokens/<cloister>` files underneath `dir`.
/// `dir` is created with mode 0700 on first write if it doesn't exist.
pub struct TokenStore {
	dir: PathBuf,
}

impl TokenStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	fn path_for(&self, cloister: &str) -> PathBuf {
		self.dir.join(cloister)
	}

	async fn ensure_dir(&self) -> Result<(), TokenError> {
		tokio::fs::create_dir_all(&self.dir)
			.await
			.map_err(|e| TokenError::Persist {
				cloister: self.dir.display().to_string(),
				source: e.into(),
			})?;
		tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
			.await
			.map_err(|e| TokenError::Persist {
				cloister: self.dir.display().to_string(),
				source: e.into(),
			})
	}

	/// Atomically writes `{token, project, workspace}` as JSON (mode
	/// 0600) for `cloister`: write to a sibling temp file, fsync-free
	/// rename into place so a reader never observes a partial file.
	#[instrument(level = "debug", skip(self))]
	pub async fn save_full(&self, cloister: &str, file: &TokenFile) -> Result<(), TokenError> {
		self.ensure_dir().await?;
		let dest = self.path_for(cloister);
		let tmp = self.dir.join(format!(".{cloister}.tmp"));

		let body = serde_json::to_vec_pretty(file).map_err(|e| TokenError::Persist {
			cloister: cloister.to_string(),
			source: e.into(),
		})?;

		tokio::fs::write(&tmp, &body)
			.await
			.map_err(|e| TokenError::Persist {
				cloister: cloister.to_string(),
				source: e.into(),
			})?;
		tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
			.await
			.map_err(|e| TokenError::Persist {
				cloister: cloister.to_string(),
				source: e.into(),
			})?;
		tokio::fs::rename(&tmp, &dest)
			.await
			.map_err(|e| TokenError::Persist {
				cloister: cloister.to_string(),
				source: e.into(),
			})
	}

	/// Idempotent: removing an already-absent file is not an error.
	pub async fn remove(&self, cloister: &str) -> Result<(), TokenError> {
		match tokio::fs::remove_file(self.path_for(cloister)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(TokenError::Persist {
				cloister: cloister.to_string(),
				source: e.into(),
			}),
		}
	}

	/// Reads every file in the directory into a token → TokenFile map.
	/// An entry that's neither valid JSON nor a bare hex token is logged
	/// and skipped rather than failing the whole load.
	#[instrument(level = "debug", skip(self))]
	pub async fn load(&self) -> Result<HashMap<Strng, TokenFile>, TokenError> {
		let mut out = HashMap::new();
		let mut entries = match tokio::fs::read_dir(&self.dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
			Err(e) => return Err(TokenError::Load(e.into())),
		};

		while let Some(entry) = entries.next_entry().await.map_err(|e| TokenError::Load(e.into()))? {
			let path = entry.path();
			let Some(cloister) = file_name_str(&path) else {
				continue;
			};
			if cloister.starts_with('.') {
				continue;
			}
			match load_one(&path).await {
				Ok(file) => {
					out.insert(Strng::from(file.token.as_str()), file);
				},
				Err(e) => warn!("skipping unreadable token file {path:?}: {e}"),
			}
		}

		Ok(out)
	}

	/// Reads a single cloister's file directly, for admin-API lookups
	/// that already know the cloister name (e.g. revoke-by-cloister).
	/// Returns `Ok(None)` if no such file exists.
	pub async fn load_one(&self, cloister: &str) -> Result<Option<TokenFile>, TokenError> {
		let path = self.path_for(cloister);
		match load_one(&path).await {
			Ok(file) => Ok(Some(file)),
			Err(e) => match tokio::fs::try_exists(&path).await {
				Ok(true) => Err(TokenError::Load(e)),
				_ => Ok(None),
			},
		}
	}

	/// Like [`TokenStore::load`] but keyed by cloister name instead of
	/// token, for listings that need to display which sandbox a token
	/// belongs to.
	pub async fn list_cloisters(&self) -> Result<Vec<(String, TokenFile)>, TokenError> {
		let mut out = Vec::new();
		let mut entries = match tokio::fs::read_dir(&self.dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
			Err(e) => return Err(TokenError::Load(e.into())),
		};

		while let Some(entry) = entries.next_entry().await.map_err(|e| TokenError::Load(e.into()))? {
			let path = entry.path();
			let Some(cloister) = file_name_str(&path) else {
				continue;
			};
			if cloister.starts_with('.') {
				continue;
			}
			match load_one(&path).await {
				Ok(file) => out.push((cloister.to_string(), file)),
				Err(e) => warn!("skipping unreadable token file {path:?}: {e}"),
			}
		}

		Ok(out)
	}
}

fn file_name_str(path: &Path) -> Option<&str> {
	path.file_name().and_then(|n| n.to_str())
}

async fn load_one(path: &Path) -> anyhow::Result<TokenFile> {
	let contents = tokio::fs::read_to_string(path).await?;
	let trimmed = contents.trim();
	if let Ok(file) = serde_json::from_str::<TokenFile>(trimmed) {
		return Ok(file);
	}
	// Legacy format: the file's entire contents is the raw token; the
	// cloister name is the project and workspace both, since the old
	// format carried no further metadata.
	if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
		let cloister = file_name_str(path).unwrap_or_default().to_string();
		return Ok(TokenFile {
			token: trimmed.to_string(),
			project: cloister.clone(),
			workspace: cloister,
		});
	}
	anyhow::bail!("neither JSON nor a legacy raw token")
}
