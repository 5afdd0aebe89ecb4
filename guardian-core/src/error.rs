use thiserror::Error;

/// Errors raised while building or mutating a policy layer.
#[derive(Debug, Error)]
pub enum PolicyError {
	#[error("invalid wildcard pattern {0:?}: must be *.label(.label)+")]
	InvalidPattern(String),
	#[error("loading global config failed: {0}")]
	GlobalConfigLoad(#[source] anyhow::Error),
	#[error("loading project config for {project:?} failed: {source}")]
	ProjectConfigLoad {
		project: String,
		#[source]
		source: anyhow::Error,
	},
	#[error("loading global decisions failed: {0}")]
	GlobalDecisionsLoad(#[source] anyhow::Error),
	#[error("loading project decisions for {project:?} failed: {source}")]
	ProjectDecisionsLoad {
		project: String,
		#[source]
		source: anyhow::Error,
	},
	#[error("persisting decision failed: {0}")]
	Disk(#[source] anyhow::Error),
	#[error("listing projects failed: {0}")]
	ProjectList(#[source] anyhow::Error),
}

/// Errors raised by the token registry / token store.
#[derive(Debug, Error)]
pub enum TokenError {
	#[error("token generation failed: {0}")]
	Generation(#[source] anyhow::Error),
	#[error("persisting token file for {cloister:?} failed: {source}")]
	Persist {
		cloister: String,
		#[source]
		source: anyhow::Error,
	},
	#[error("loading token store failed: {0}")]
	Load(#[source] anyhow::Error),
	#[error("unknown token")]
	Unknown,
}

/// Errors raised while parking or resolving an approval request.
#[derive(Debug, Error)]
pub enum ApprovalError {
	#[error("domain is not well-formed: {0:?}")]
	InvalidDomain(String),
	#[error("approval request timed out")]
	TimedOut,
	#[error("approval request {0} not found")]
	NotFound(String),
}
