//! In-memory half of component D: token identity and the live registry
//! consulted on every CONNECT request (spec.md §4.D).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::instrument;

use crate::Strng;
use crate::error::TokenError;

/// A 256-bit bearer token, hex-encoded to 64 lowercase characters.
fn generate_token() -> String {
	let mut bytes = [0u8; 32];
	rand::rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

/// `{CloisterName, ProjectName, WorkspacePath}` from spec.md §3, plus
/// the bookkeeping the idle-reaper and restart rehydration need.
/// `last_seen` tracks the idle-timeout clock separately from
/// `issued_at` so a long-lived but active tunnel is never revoked.
#[derive(Debug, Clone)]
pub struct TokenInfo {
	pub cloister: Strng,
	pub project: Strng,
	pub workspace: Strng,
	pub issued_at: Instant,
	last_seen: Instant,
}

impl TokenInfo {
	fn new(cloister: Strng, project: Strng, workspace: Strng) -> Self {
		let now = Instant::now();
		Self {
			cloister,
			project,
			workspace,
			issued_at: now,
			last_seen: now,
		}
	}

	pub fn idle_for(&self) -> Duration {
		self.last_seen.elapsed()
	}
}

/// The live, in-memory token → identity map consulted on every CONNECT
/// request. Every entry here must have a matching on-disk
/// [`crate::store::TokenFile`]. `TokenRegistry` itself never touches
/// disk; the `guardian` binary keeps the two in sync by calling
/// `issue`/`restore`/`revoke` alongside its own persistence wrapper.
#[derive(Debug, Default)]
pub struct TokenRegistry {
	tokens: tokio::sync::RwLock<HashMap<Strng, TokenInfo>>,
}

impl TokenRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// `Register`/`RegisterFull` from spec.md §4.D: mints a fresh token
	/// bound to `(cloister, project, workspace)`. Retries generation on
	/// the astronomically unlikely event of a collision with a live
	/// token.
	#[instrument(level = "debug", skip(self))]
	pub async fn issue(
		&self,
		cloister: impl Into<Strng>,
		project: impl Into<Strng>,
		workspace: impl Into<Strng>,
	) -> Result<String, TokenError> {
		let cloister = cloister.into();
		let project = project.into();
		let workspace = workspace.into();
		let mut tokens = self.tokens.write().await;
		for _ in 0..8 {
			let candidate = generate_token();
			if !tokens.contains_key(candidate.as_str()) {
				tokens.insert(
					Strng::from(candidate.as_str()),
					TokenInfo::new(cloister, project, workspace),
				);
				return Ok(candidate);
			}
		}
		Err(TokenError::Generation(anyhow::anyhow!(
			"failed to mint a unique token after 8 attempts"
		)))
	}

	/// Re-registers a token loaded from disk (at startup, or via the
	/// admin API's `register-full`), preserving no prior issue time
	/// since the registry never persisted one; idle accounting simply
	/// restarts from the moment of restore.
	pub async fn restore(
		&self,
		token: impl Into<Strng>,
		cloister: impl Into<Strng>,
		project: impl Into<Strng>,
		workspace: impl Into<Strng>,
	) {
		let mut tokens = self.tokens.write().await;
		tokens.insert(
			token.into(),
			TokenInfo::new(cloister.into(), project.into(), workspace.into()),
		);
	}

	/// Looks up a token's identity and marks it as seen just now. Returns
	/// `None` for an unknown or revoked token.
	pub async fn touch(&self, token: &str) -> Option<TokenInfo> {
		let mut tokens = self.tokens.write().await;
		let info = tokens.get_mut(token)?;
		info.last_seen = Instant::now();
		Some(info.clone())
	}

	/// `Lookup`: returns the token's identity without affecting the idle
	/// clock. `Validate(t) = Lookup(t).ok`, per spec.md §8.
	pub async fn lookup(&self, token: &str) -> Option<TokenInfo> {
		self.tokens.read().await.get(token).cloned()
	}

	/// `Validate`: existence test. `Validate(t) = true` iff
	/// `Lookup(t).ok = true` (spec.md §8).
	pub async fn validate(&self, token: &str) -> bool {
		self.tokens.read().await.contains_key(token)
	}

	/// Alias of [`TokenRegistry::validate`], kept for call sites that
	/// read better as a containment check than a validation step.
	pub async fn contains(&self, token: &str) -> bool {
		self.validate(token).await
	}

	/// `Revoke`: removes the token, returning whether it existed.
	/// Idempotent: revoking an absent token simply returns `false`.
	pub async fn revoke(&self, token: &str) -> bool {
		self.tokens.write().await.remove(token).is_some()
	}

	/// Tokens idle longer than `max_idle`, for the idle-reaper sweep.
	pub async fn idle_tokens(&self, max_idle: Duration) -> Vec<Strng> {
		self
			.tokens
			.read()
			.await
			.iter()
			.filter(|(_, info)| info.idle_for() >= max_idle)
			.map(|(token, _)| token.clone())
			.collect()
	}

	/// `Count`.
	pub async fn count(&self) -> usize {
		self.tokens.read().await.len()
	}

	/// Kept alongside [`TokenRegistry::count`] since most call sites
	/// read more naturally as "how many tokens" than "the count".
	pub async fn len(&self) -> usize {
		self.count().await
	}

	pub async fn is_empty(&self) -> bool {
		self.count().await == 0
	}

	/// `List`: a deep copy of every live token's identity.
	pub async fn list(&self) -> Vec<(Strng, TokenInfo)> {
		self
			.tokens
			.read()
			.await
			.iter()
			.map(|(token, info)| (token.clone(), info.clone()))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn issue_then_touch_roundtrips_identity() {
		let registry = TokenRegistry::new();
		let token = registry.issue("cloister-a", "proj-a", "/ws/a").await.unwrap();
		assert_eq!(token.len(), 64);
		let info = registry.touch(&token).await.unwrap();
		assert_eq!(info.cloister.as_str(), "cloister-a");
		assert_eq!(info.project.as_str(), "proj-a");
		assert_eq!(info.workspace.as_str(), "/ws/a");
	}

	#[tokio::test]
	async fn validate_matches_lookup_ok() {
		let registry = TokenRegistry::new();
		let token = registry.issue("c", "proj-a", "").await.unwrap();
		assert_eq!(registry.validate(&token).await, registry.lookup(&token).await.is_some());
		assert!(registry.validate(&token).await);
		assert!(!registry.validate("nonexistent").await);
	}

	#[tokio::test]
	async fn revoke_forgets_token_and_is_idempotent() {
		let registry = TokenRegistry::new();
		let token = registry.issue("c", "proj-a", "").await.unwrap();
		assert!(registry.revoke(&token).await);
		assert_eq!(registry.touch(&token).await.map(|_| ()), None);
		assert!(!registry.revoke(&token).await);
	}

	#[tokio::test]
	async fn idle_tokens_reports_only_past_threshold() {
		let registry = TokenRegistry::new();
		let token = registry.issue("c", "proj-a", "").await.unwrap();
		assert!(registry.idle_tokens(Duration::from_secs(60)).await.is_empty());
		assert_eq!(
			registry.idle_tokens(Duration::from_secs(0)).await,
			vec![Strng::from(token.as_str())]
		);
	}

	#[tokio::test]
	async fn unknown_token_is_not_found() {
		let registry = TokenRegistry::new();
		assert_eq!(registry.touch("deadbeef").await.map(|_| ()), None);
		assert!(!registry.contains("deadbeef").await);
	}

	#[tokio::test]
	async fn list_is_a_deep_copy() {
		let registry = TokenRegistry::new();
		let token = registry.issue("c", "proj-a", "/ws").await.unwrap();
		let listed = registry.list().await;
		assert_eq!(listed.len(), 1);
		assert_eq!(listed[0].0.as_str(), token.as_str());
		registry.revoke(&token).await;
		assert_eq!(listed.len(), 1, "the earlier copy is unaffected by the revoke");
	}
}
