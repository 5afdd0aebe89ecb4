//! Structured audit trail. Guardian has no separate audit-log process;
//! this module *is* the sink's contract spec.md §3 describes: each
//! call site in `proxy`/`approver` wiring emits one `AuditEvent` via
//! `tracing`, at the level spec.md §7 assigns to that error kind.
//! Whatever the operator points at Guardian's stderr (journald, a log
//! shipper) is the real audit store.

use serde::Serialize;
use tracing::{info, warn};

/// A single audited decision. Tokens are represented only by their
/// first 8 hex characters, spec.md's "never the token" rule applies
/// to the audit trail as much as to error logs.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent<'a> {
	pub kind: &'a str,
	pub token_hash: &'a str,
	pub project: &'a str,
	pub domain: &'a str,
	pub detail: &'a str,
}

/// Truncates a full token down to the prefix safe to log.
pub fn token_hash(token: &str) -> &str {
	&token[..token.len().min(8)]
}

impl AuditEvent<'_> {
	pub fn emit_info(&self) {
		info!(
			kind = self.kind,
			token_hash = self.token_hash,
			project = self.project,
			domain = self.domain,
			detail = self.detail,
			"audit"
		);
	}

	pub fn emit_warn(&self) {
		warn!(
			kind = self.kind,
			token_hash = self.token_hash,
			project = self.project,
			domain = self.domain,
			detail = self.detail,
			"audit"
		);
	}
}
