//! Filesystem-backed [`guardian_core::ConfigLoader`],
//! [`guardian_core::DecisionLoader`], and [`guardian_core::ProjectLister`]
//! implementations (spec.md §4.I, §6 "Decision file format").
//!
//! Decision files are written atomically (temp file + rename within the
//! same directory) at mode 0600, under a 0700 directory (the same
//! crash-safety idiom `guardian_core::store::TokenStore` uses for token
//! files).

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use guardian_core::{ConfigLoader, DecisionLoader, PolicyError, ProjectLister, RawDecisions};

const EXT: &str = "yaml";

/// Reads the config-declared (not human-edited) global/project allow
/// and deny lists. A missing file is an empty layer, not an error;
/// only malformed YAML or an unreadable existing file is a load
/// failure.
pub struct FileConfigLoader {
	config_dir: PathBuf,
	project_config_dir: PathBuf,
}

impl FileConfigLoader {
	pub fn new(config_dir: impl Into<PathBuf>, project_config_dir: impl Into<PathBuf>) -> Self {
		Self {
			config_dir: config_dir.into(),
			project_config_dir: project_config_dir.into(),
		}
	}
}

#[async_trait]
impl ConfigLoader for FileConfigLoader {
	async fn load_global(&self) -> Result<RawDecisions, PolicyError> {
		read_optional(&self.config_dir.join(format!("global.{EXT}")))
			.await
			.map_err(PolicyError::GlobalConfigLoad)
	}

	async fn load_project(&self, project: &str) -> Result<RawDecisions, PolicyError> {
		read_optional(&self.project_config_dir.join(format!("{project}.{EXT}")))
			.await
			.map_err(|source| PolicyError::ProjectConfigLoad {
				project: project.to_string(),
				source,
			})
	}
}

/// Reads and atomically writes the human-editable global/project
/// decision files.
pub struct FileDecisionLoader {
	decisions_dir: PathBuf,
	project_decisions_dir: PathBuf,
}

impl FileDecisionLoader {
	pub fn new(decisions_dir: impl Into<PathBuf>, project_decisions_dir: impl Into<PathBuf>) -> Self {
		Self {
			decisions_dir: decisions_dir.into(),
			project_decisions_dir: project_decisions_dir.into(),
		}
	}

	pub fn project_decisions_dir(&self) -> &Path {
		&self.project_decisions_dir
	}
}

#[async_trait]
impl DecisionLoader for FileDecisionLoader {
	async fn load_global(&self) -> Result<RawDecisions, PolicyError> {
		read_optional(&self.decisions_dir.join(format!("global.{EXT}")))
			.await
			.map_err(PolicyError::GlobalDecisionsLoad)
	}

	async fn save_global(&self, decisions: &RawDecisions) -> Result<(), PolicyError> {
		write_atomic(&self.decisions_dir, &format!("global.{EXT}"), decisions)
			.await
			.map_err(PolicyError::Disk)
	}

	async fn load_project(&self, project: &str) -> Result<RawDecisions, PolicyError> {
		read_optional(&self.project_decisions_dir.join(format!("{project}.{EXT}")))
			.await
			.map_err(|source| PolicyError::ProjectDecisionsLoad {
				project: project.to_string(),
				source,
			})
	}

	async fn save_project(&self, project: &str, decisions: &RawDecisions) -> Result<(), PolicyError> {
		write_atomic(
			&self.project_decisions_dir,
			&format!("{project}.{EXT}"),
			decisions,
		)
		.await
		.map_err(PolicyError::Disk)
	}
}

/// Enumerates every project known to either the config or decisions
/// tree, so `ReloadAll` rebuilds every layer that could possibly exist.
pub struct FileProjectLister {
	project_config_dir: PathBuf,
	project_decisions_dir: PathBuf,
}

impl FileProjectLister {
	pub fn new(project_config_dir: impl Into<PathBuf>, project_decisions_dir: impl Into<PathBuf>) -> Self {
		Self {
			project_config_dir: project_config_dir.into(),
			project_decisions_dir: project_decisions_dir.into(),
		}
	}
}

#[async_trait]
impl ProjectLister for FileProjectLister {
	async fn list_projects(&self) -> Result<Vec<String>, PolicyError> {
		let mut names = HashSet::new();
		for dir in [&self.project_config_dir, &self.project_decisions_dir] {
			match list_stems(dir).await {
				Ok(stems) => names.extend(stems),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
				Err(e) => return Err(PolicyError::ProjectList(e.into())),
			}
		}
		let mut names: Vec<String> = names.into_iter().collect();
		names.sort();
		Ok(names)
	}
}

async fn list_stems(dir: &Path) -> std::io::Result<Vec<String>> {
	let mut out = Vec::new();
	let mut entries = tokio::fs::read_dir(dir).await?;
	while let Some(entry) = entries.next_entry().await? {
		if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
			out.push(stem.to_string());
		}
	}
	Ok(out)
}

async fn read_optional(path: &Path) -> anyhow::Result<RawDecisions> {
	match tokio::fs::read_to_string(path).await {
		Ok(body) if body.trim().is_empty() => Ok(RawDecisions::default()),
		Ok(body) => Ok(serde_yaml::from_str(&body)?),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RawDecisions::default()),
		Err(e) => Err(e.into()),
	}
}

async fn write_atomic(dir: &Path, file_name: &str, decisions: &RawDecisions) -> anyhow::Result<()> {
	tokio::fs::create_dir_all(dir).await?;
	tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;

	let body = serde_yaml::to_string(&dedup(decisions))?;
	let tmp = dir.join(format!(".{file_name}.tmp"));
	let dest = dir.join(file_name);

	tokio::fs::write(&tmp, body.as_bytes()).await?;
	tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
	tokio::fs::rename(&tmp, &dest).await?;
	Ok(())
}

fn dedup(decisions: &RawDecisions) -> RawDecisions {
	RawDecisions {
		allow: dedup_list(&decisions.allow),
		deny: dedup_list(&decisions.deny),
	}
}

fn dedup_list(list: &[String]) -> Vec<String> {
	let mut seen = HashSet::new();
	list
		.iter()
		.filter(|entry| seen.insert(entry.as_str()))
		.cloned()
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn missing_file_is_empty_not_error() {
		let dir = tempfile::tempdir().unwrap();
		let loader = FileConfigLoader::new(dir.path(), dir.path().join("projects"));
		let decisions = loader.load_global().await.unwrap();
		assert!(decisions.allow.is_empty() && decisions.deny.is_empty());
	}

	#[tokio::test]
	async fn save_then_load_roundtrips_and_dedups() {
		let dir = tempfile::tempdir().unwrap();
		let loader = FileDecisionLoader::new(dir.path(), dir.path().join("projects"));
		let decisions = RawDecisions {
			allow: vec!["a.com".into(), "a.com".into()],
			deny: vec!["b.com".into()],
		};
		loader.save_global(&decisions).await.unwrap();

		let loaded = loader.load_global().await.unwrap();
		assert_eq!(loaded.allow, vec!["a.com".to_string()]);
		assert_eq!(loaded.deny, vec!["b.com".to_string()]);

		let perms = std::fs::metadata(dir.path().join(format!("global.{EXT}")))
			.unwrap()
			.permissions();
		assert_eq!(perms.mode() & 0o777, 0o600);
	}

	#[tokio::test]
	async fn project_lister_unions_config_and_decisions_dirs() {
		let root = tempfile::tempdir().unwrap();
		let config_dir = root.path().join("config");
		let decisions_dir = root.path().join("decisions");
		tokio::fs::create_dir_all(&config_dir).await.unwrap();
		tokio::fs::create_dir_all(&decisions_dir).await.unwrap();
		tokio::fs::write(config_dir.join("alpha.yaml"), "allow: []\ndeny: []\n")
			.await
			.unwrap();
		tokio::fs::write(decisions_dir.join("beta.yaml"), "allow: []\ndeny: []\n")
			.await
			.unwrap();

		let lister = FileProjectLister::new(&config_dir, &decisions_dir);
		let mut names = lister.list_projects().await.unwrap();
		names.sort();
		assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
	}
}
