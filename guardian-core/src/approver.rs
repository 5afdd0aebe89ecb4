//! Bridges an AskHuman verdict from [`crate::policy::PolicyEngine`] to
//! the [`crate::approval::ApprovalQueue`] and back (spec.md §4.F).

use std::sync::Arc;

use tracing::instrument;

use crate::Strng;
use crate::approval::{ApprovalQueue, ApprovalResponse, validate_domain};
use crate::error::ApprovalError;
use crate::policy::{PolicyEngine, RecordDecisionArgs, Scope, Verdict};

/// Holds the two collaborators and exposes the single entry point the
/// proxy calls on an `AskHuman` verdict. Never touches the engine's
/// lock directly; it only calls `RecordDecision`, which takes its own
/// lock internally, so a slow or disconnected human never blocks a
/// `Check` on a different connection.
pub struct DomainApprover {
	engine: Arc<PolicyEngine>,
	queue: Arc<ApprovalQueue>,
}

impl DomainApprover {
	pub fn new(engine: Arc<PolicyEngine>, queue: Arc<ApprovalQueue>) -> Self {
		Self { engine, queue }
	}

	/// Parks `domain` for human review and waits for a decision. Maps
	/// the response to Allow/Deny per spec.md §4.F, recording the
	/// decision for every scope except an approved `Once`.
	#[instrument(level = "info", skip(self), fields(project, domain))]
	pub async fn request(
		&self,
		token: &str,
		project: &str,
		cloister: &str,
		domain: &str,
	) -> Result<Verdict, ApprovalError> {
		validate_domain(domain)?;

		let (id, mut recv) = self
			.queue
			.add(
				Strng::from(token),
				Strng::from(project),
				Strng::from(cloister),
				Strng::from(domain),
			)
			.await;

		let response = recv.recv().await.unwrap_or(ApprovalResponse::TimedOut);
		// The queue already removed the entry when it resolved (via its
		// own timeout watcher or an external Resolve call); this is a
		// belt-and-braces cleanup for any path that left it parked.
		self.queue.remove(&id).await;

		match response {
			ApprovalResponse::Approved {
				scope: Scope::Once, ..
			} => Ok(Verdict::Allow),
			ApprovalResponse::Approved { scope, wildcard } => {
				self.record(token, project, domain, scope, true, wildcard).await;
				Ok(Verdict::Allow)
			},
			ApprovalResponse::Denied { scope, wildcard } => {
				self.record(token, project, domain, scope, false, wildcard).await;
				Ok(Verdict::Deny)
			},
			ApprovalResponse::TimedOut => Ok(Verdict::Deny),
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn record(
		&self,
		token: &str,
		project: &str,
		domain: &str,
		scope: Scope,
		allowed: bool,
		wildcard: bool,
	) {
		let result = self
			.engine
			.record_decision(RecordDecisionArgs {
				token: token.to_string(),
				project: project.to_string(),
				domain: domain.to_string(),
				scope,
				allowed,
				wildcard,
			})
			.await;
		if let Err(e) = result {
			tracing::warn!("recording approval decision for {domain:?} failed: {e}");
		}
	}
}
