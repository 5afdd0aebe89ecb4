//! `GuardianConfig`: process-wide settings loaded from a YAML file and
//! overridable by `GUARDIAN_*` environment variables, instance-namespaced
//! so more than one broker can run on a host (spec.md §3, §6 "Environment").

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GuardianConfig {
	pub instance_id: String,
	pub config_root: PathBuf,
	pub listen_addr: String,
	pub admin_listen_addr: String,
	pub realm: String,
	#[serde(with = "humantime_secs")]
	pub dial_timeout: Duration,
	#[serde(with = "humantime_secs")]
	pub idle_timeout: Duration,
	#[serde(with = "humantime_secs")]
	pub header_timeout: Duration,
	#[serde(with = "humantime_secs")]
	pub approval_timeout: Duration,
	pub wildcard_min_labels: usize,
	#[serde(with = "humantime_secs")]
	pub shutdown_timeout: Duration,
}

impl Default for GuardianConfig {
	fn default() -> Self {
		Self {
			instance_id: "default".to_string(),
			config_root: PathBuf::from("/etc/guardian"),
			listen_addr: "0.0.0.0:8443".to_string(),
			admin_listen_addr: "127.0.0.1:8444".to_string(),
			realm: "guardian".to_string(),
			dial_timeout: Duration::from_secs(30),
			idle_timeout: Duration::from_secs(300),
			header_timeout: Duration::from_secs(30),
			approval_timeout: Duration::from_secs(60),
			wildcard_min_labels: 3,
			shutdown_timeout: Duration::from_secs(30),
		}
	}
}

impl GuardianConfig {
	/// Loads from `path` if given, falling back to built-in defaults on a
	/// cold start with no file (spec.md §7 "ConfigLoad ... on cold start
	/// fall back to built-in defaults; log at warn"). Every field can
	/// then be overridden by a `GUARDIAN_<FIELD>` environment variable.
	/// Once `instance_id` is known, any of `config_root`/`listen_addr`/
	/// `admin_listen_addr` left at their un-namespaced defaults are
	/// derived from it, so two instances started with only
	/// `GUARDIAN_INSTANCE_ID` set can run side by side without colliding
	/// (spec.md §6 "Environment": "ports, hostnames, and directories are
	/// namespaced by it").
	pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
		let mut cfg = match path {
			Some(path) => match std::fs::read_to_string(path) {
				Ok(body) => serde_yaml::from_str(&body)?,
				Err(e) => {
					tracing::warn!("reading config {path:?} failed ({e}), using defaults");
					Self::default()
				},
			},
			None => Self::default(),
		};
		cfg.apply_env_overrides()?;
		cfg.namespace_by_instance();
		Ok(cfg)
	}

	/// Rewrites any still-default `config_root`/`listen_addr`/
	/// `admin_listen_addr` to fold in `instance_id`, unless the operator
	/// already chose an explicit value (file or env override) for that
	/// field. A no-op for the `"default"` instance.
	fn namespace_by_instance(&mut self) {
		let defaults = Self::default();
		if self.instance_id == defaults.instance_id {
			return;
		}
		if self.config_root == defaults.config_root {
			self.config_root = PathBuf::from(format!("{}-{}", defaults.config_root.display(), self.instance_id));
		}
		if self.listen_addr == defaults.listen_addr {
			self.listen_addr = namespaced_addr(&defaults.listen_addr, &self.instance_id);
		}
		if self.admin_listen_addr == defaults.admin_listen_addr {
			self.admin_listen_addr = namespaced_addr(&defaults.admin_listen_addr, &self.instance_id);
		}
	}

	fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
		if let Some(v) = env_var("GUARDIAN_INSTANCE_ID")? {
			self.instance_id = v;
		}
		if let Some(v) = env_parse("GUARDIAN_CONFIG_ROOT")? {
			self.config_root = v;
		}
		if let Some(v) = env_var("GUARDIAN_LISTEN_ADDR")? {
			self.listen_addr = v;
		}
		if let Some(v) = env_var("GUARDIAN_ADMIN_LISTEN_ADDR")? {
			self.admin_listen_addr = v;
		}
		if let Some(v) = env_var("GUARDIAN_REALM")? {
			self.realm = v;
		}
		if let Some(v) = env_duration("GUARDIAN_DIAL_TIMEOUT")? {
			self.dial_timeout = v;
		}
		if let Some(v) = env_duration("GUARDIAN_IDLE_TIMEOUT")? {
			self.idle_timeout = v;
		}
		if let Some(v) = env_duration("GUARDIAN_HEADER_TIMEOUT")? {
			self.header_timeout = v;
		}
		if let Some(v) = env_duration("GUARDIAN_APPROVAL_TIMEOUT")? {
			self.approval_timeout = v;
		}
		if let Some(v) = env_parse("GUARDIAN_WILDCARD_MIN_LABELS")? {
			self.wildcard_min_labels = v;
		}
		if let Some(v) = env_duration("GUARDIAN_SHUTDOWN_TIMEOUT")? {
			self.shutdown_timeout = v;
		}
		Ok(())
	}

	pub fn decisions_dir(&self) -> PathBuf {
		self.config_root.join("decisions")
	}

	pub fn project_decisions_dir(&self) -> PathBuf {
		self.decisions_dir().join("projects")
	}

	pub fn config_dir(&self) -> PathBuf {
		self.config_root.join("config")
	}

	pub fn project_config_dir(&self) -> PathBuf {
		self.config_dir().join("projects")
	}

	pub fn tokens_dir(&self) -> PathBuf {
		self.config_root.join("tokens")
	}
}

/// Offsets `addr`'s port by a stable, deterministic hash of `instance_id`
/// (range 0..1000) so distinct instance ids fan out across distinct
/// ports without any coordination between operators.
fn namespaced_addr(addr: &str, instance_id: &str) -> String {
	let Some((host, port)) = addr.rsplit_once(':') else {
		return addr.to_string();
	};
	let Ok(port) = port.parse::<u16>() else {
		return addr.to_string();
	};
	let offset = (fnv1a(instance_id) % 1000) as u16;
	format!("{host}:{}", port.saturating_add(offset))
}

/// FNV-1a, used only to derive a stable port offset, not a cryptographic
/// hash and never used for anything security-relevant.
fn fnv1a(s: &str) -> u64 {
	let mut hash: u64 = 0xcbf29ce484222325;
	for b in s.bytes() {
		hash ^= b as u64;
		hash = hash.wrapping_mul(0x100000001b3);
	}
	hash
}

fn env_var(name: &str) -> anyhow::Result<Option<String>> {
	match std::env::var(name) {
		Ok(val) => Ok(Some(val)),
		Err(std::env::VarError::NotPresent) => Ok(None),
		Err(e) => Err(anyhow::anyhow!("invalid env var {name}: {e}")),
	}
}

fn env_parse<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
	env_var(name)?
		.map(|v| v.parse().map_err(|e: T::Err| anyhow::anyhow!("invalid env var {name}={v}: {e}")))
		.transpose()
}

fn env_duration(name: &str) -> anyhow::Result<Option<Duration>> {
	env_var(name)?
		.map(|v| duration_str::parse(&v).map_err(|e| anyhow::anyhow!("invalid env var {name}={v}: {e}")))
		.transpose()
}

/// Serializes a `Duration` as a plain integer number of seconds, the
/// same shape the config file and `duration-str` env overrides share.
mod humantime_secs {
	use super::Duration;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(value.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let secs = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(secs))
	}
}
