//! The layered allow/deny evaluator (spec.md §4.C) and its supporting
//! `ProxyPolicy` layer type (spec.md §4.B).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::Strng;
use crate::domain::{DomainSet, canonicalize};
use crate::error::PolicyError;

/// `{Allow: DomainSet, Deny: DomainSet}`, one policy layer.
///
/// There is no `Option<ProxyPolicy>` anywhere in this crate: a layer
/// that doesn't exist (no project config, no session decisions yet) is
/// represented by its absence from the engine's map, not by an empty
/// `ProxyPolicy`. `IsAllowed`/`IsDenied` on an empty policy both return
/// `false`, which is the "nil-safe" behavior spec.md asks for.
#[derive(Debug, Clone, Default)]
pub struct ProxyPolicy {
	allow: DomainSet,
	deny: DomainSet,
}

impl ProxyPolicy {
	pub fn new(allow: DomainSet, deny: DomainSet) -> Self {
		Self { allow, deny }
	}

	pub fn is_allowed(&self, domain: &str) -> bool {
		self.allow.contains(domain)
	}

	pub fn is_denied(&self, domain: &str) -> bool {
		self.deny.contains(domain)
	}

	pub fn allow(&self) -> &DomainSet {
		&self.allow
	}

	pub fn deny(&self) -> &DomainSet {
		&self.deny
	}
}

/// The persistence bucket a human decision lands in (spec.md GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
	Once,
	Session,
	Project,
	Global,
}

/// The three outcomes of a policy check (spec.md §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
	Allow,
	Deny,
	AskHuman,
}

/// The allow/deny entry lists behind one decision file or config layer,
/// independent of its on-disk encoding. A pattern entry is written as
/// `*.suffix`; everything else is an exact domain.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDecisions {
	#[serde(default)]
	pub allow: Vec<String>,
	#[serde(default)]
	pub deny: Vec<String>,
}

impl RawDecisions {
	fn to_policy(&self) -> Result<ProxyPolicy, PolicyError> {
		Ok(ProxyPolicy::new(
			DomainSet::from_entries(&self.allow)?,
			DomainSet::from_entries(&self.deny)?,
		))
	}

	fn dedup_push(&mut self, entry: &str, allowed: bool) {
		let list = if allowed {
			&mut self.allow
		} else {
			&mut self.deny
		};
		if !list.iter().any(|existing| existing == entry) {
			list.push(entry.to_string());
		}
	}
}

/// Loads the config-declared (not user-edited) allow/deny lists for a
/// layer. Implemented by the `guardian` binary's YAML config reader;
/// this crate never touches a filesystem directly.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
	async fn load_global(&self) -> Result<RawDecisions, PolicyError>;
	async fn load_project(&self, project: &str) -> Result<RawDecisions, PolicyError>;
}

/// Loads and persists the human-decision files for a layer.
#[async_trait]
pub trait DecisionLoader: Send + Sync {
	async fn load_global(&self) -> Result<RawDecisions, PolicyError>;
	async fn save_global(&self, decisions: &RawDecisions) -> Result<(), PolicyError>;
	async fn load_project(&self, project: &str) -> Result<RawDecisions, PolicyError>;
	async fn save_project(&self, project: &str, decisions: &RawDecisions) -> Result<(), PolicyError>;
}

/// Enumerates the projects a full reload must rebuild.
#[async_trait]
pub trait ProjectLister: Send + Sync {
	async fn list_projects(&self) -> Result<Vec<String>, PolicyError>;
}

/// Arguments to [`PolicyEngine::record_decision`].
#[derive(Debug, Clone)]
pub struct RecordDecisionArgs {
	pub token: String,
	pub project: String,
	pub domain: String,
	pub scope: Scope,
	pub allowed: bool,
	pub wildcard: bool,
}

struct Layers {
	global: ProxyPolicy,
	projects: HashMap<Strng, ProxyPolicy>,
	tokens: HashMap<Strng, ProxyPolicy>,
}

/// Ordered evaluator over global / project / token layers; owns reload
/// and decision persistence (spec.md §4.C). A single RW lock guards all
/// three layers together: reads (`check`) take the read side, every
/// mutation takes the write side, and loader calls happen before the
/// lock is acquired so file I/O never runs while readers are blocked.
pub struct PolicyEngine {
	layers: tokio::sync::RwLock<Layers>,
	config: Arc<dyn ConfigLoader>,
	decisions: Arc<dyn DecisionLoader>,
	projects: Arc<dyn ProjectLister>,
	/// Minimum label count a domain must have before `Wildcard: true` is
	/// honored by expanding it to a `*.parent` pattern (spec.md §9 Open
	/// Questions: exposed here as the documented knob).
	wildcard_min_labels: usize,
}

impl PolicyEngine {
	pub async fn new(
		config: Arc<dyn ConfigLoader>,
		decisions: Arc<dyn DecisionLoader>,
		projects: Arc<dyn ProjectLister>,
		wildcard_min_labels: usize,
	) -> Result<Self, PolicyError> {
		let global = build_layer(config.load_global().await, decisions.load_global().await)?;
		Ok(Self {
			layers: tokio::sync::RwLock::new(Layers {
				global,
				projects: HashMap::new(),
				tokens: HashMap::new(),
			}),
			config,
			decisions,
			projects,
			wildcard_min_labels,
		})
	}

	/// `Check(token, project, domain)` from spec.md §4.C: deny-first
	/// across all layers, then allow-second, else ask a human.
	#[instrument(level = "debug", skip(self), fields(project, domain))]
	pub async fn check(&self, token: &str, project: &str, domain: &str) -> Verdict {
		let domain = canonicalize(domain);
		let layers = self.layers.read().await;

		let project_policy = (!project.is_empty())
			.then(|| layers.projects.get(project))
			.flatten();
		let token_policy = (!token.is_empty())
			.then(|| layers.tokens.get(token))
			.flatten();

		if layers.global.is_denied(&domain)
			|| project_policy.is_some_and(|p| p.is_denied(&domain))
			|| token_policy.is_some_and(|p| p.is_denied(&domain))
		{
			return Verdict::Deny;
		}

		if layers.global.is_allowed(&domain)
			|| project_policy.is_some_and(|p| p.is_allowed(&domain))
			|| token_policy.is_some_and(|p| p.is_allowed(&domain))
		{
			return Verdict::Allow;
		}

		Verdict::AskHuman
	}

	/// `RecordDecision` from spec.md §4.C.
	pub async fn record_decision(&self, args: RecordDecisionArgs) -> Result<(), PolicyError> {
		let domain = canonicalize(&args.domain);
		let entry = if args.wildcard {
			wildcard_entry(&domain, self.wildcard_min_labels)
		} else {
			domain.clone()
		};

		match args.scope {
			Scope::Once => Ok(()),
			Scope::Session => {
				if args.token.is_empty() {
					return Ok(());
				}
				let mut layers = self.layers.write().await;
				let token: Strng = args.token.as_str().into();
				let mut current = layers.tokens.remove(&token).unwrap_or_default();
				let mut raw = RawDecisions {
					allow: current.allow().entries().collect(),
					deny: current.deny().entries().collect(),
				};
				raw.dedup_push(&entry, args.allowed);
				current = raw.to_policy()?;
				layers.tokens.insert(token, current);
				Ok(())
			},
			Scope::Project => {
				if args.project.is_empty() {
					return Ok(());
				}
				let mut raw = self.decisions.load_project(&args.project).await?;
				raw.dedup_push(&entry, args.allowed);
				self.decisions.save_project(&args.project, &raw).await?;
				self.reload_project(&args.project).await
			},
			Scope::Global => {
				let mut raw = self.decisions.load_global().await?;
				raw.dedup_push(&entry, args.allowed);
				self.decisions.save_global(&raw).await?;
				self.reload_global().await
			},
		}
	}

	/// Rebuilds the global layer from its config and decisions loaders.
	pub async fn reload_global(&self) -> Result<(), PolicyError> {
		let global = build_layer(self.config.load_global().await, self.decisions.load_global().await)?;
		self.layers.write().await.global = global;
		Ok(())
	}

	/// Rebuilds one project's layer from its config and decisions loaders.
	pub async fn reload_project(&self, project: &str) -> Result<(), PolicyError> {
		if project.is_empty() {
			return Ok(());
		}
		let policy = build_layer(
			self.config.load_project(project).await,
			self.decisions.load_project(project).await,
		)?;
		self
			.layers
			.write()
			.await
			.projects
			.insert(project.into(), policy);
		Ok(())
	}

	/// `EnsureProject`: lazily loads a project layer if not already
	/// present. Idempotent; a no-op for an empty name.
	pub async fn ensure_project(&self, project: &str) -> Result<(), PolicyError> {
		if project.is_empty() {
			return Ok(());
		}
		if self.layers.read().await.projects.contains_key(project) {
			return Ok(());
		}
		self.reload_project(project).await
	}

	/// `ReloadAll`: rebuilds global and every project the lister knows
	/// about. Does not touch token layers. Returns the first error but
	/// still attempts every remaining project.
	pub async fn reload_all(&self) -> Result<(), PolicyError> {
		let mut first_err = self.reload_global().await.err();

		let names = match self.projects.list_projects().await {
			Ok(names) => names,
			Err(e) => {
				warn!("listing projects for reload failed: {e}");
				return Err(first_err.unwrap_or(e));
			},
		};

		for name in names {
			if let Err(e) = self.reload_project(&name).await {
				warn!("reloading project {name:?} failed: {e}");
				first_err.get_or_insert(e);
			}
		}

		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	/// `RevokeToken`: drops a token's session layer. A re-issued token
	/// must never inherit a stale session policy (spec.md §9).
	pub async fn revoke_token(&self, token: &str) {
		self.layers.write().await.tokens.remove(token);
	}
}

fn build_layer(
	config: Result<RawDecisions, PolicyError>,
	decisions: Result<RawDecisions, PolicyError>,
) -> Result<ProxyPolicy, PolicyError> {
	let config = config?;
	let decisions = decisions?;
	let allow = config.allow.iter().chain(decisions.allow.iter());
	let deny = config.deny.iter().chain(decisions.deny.iter());
	Ok(ProxyPolicy::new(
		DomainSet::from_entries(allow)?,
		DomainSet::from_entries(deny)?,
	))
}

/// Expands `domain` to a `*.parent` pattern when it has at least
/// `min_labels` labels; otherwise returns the raw domain (spec.md §4.C:
/// "the domain may be expanded ... when Wildcard is true and the domain
/// has ≥ 3 labels; otherwise the raw domain is recorded").
fn wildcard_entry(domain: &str, min_labels: usize) -> String {
	let labels: Vec<&str> = domain.split('.').collect();
	if labels.len() >= min_labels {
		format!("*.{}", labels[1..].join("."))
	} else {
		domain.to_string()
	}
}
