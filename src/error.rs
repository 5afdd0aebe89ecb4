use thiserror::Error;

/// Errors raised while handling a single CONNECT connection. Every
/// variant maps to exactly one wire outcome in [`crate::proxy`]; none
/// of them ever panics the accept loop or another connection.
#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("client transport error: {0}")]
	Transport(#[source] std::io::Error),
	#[error("malformed request: {0}")]
	ClientProtocol(String),
	#[error("proxy authentication missing")]
	AuthMissing,
	#[error("proxy authentication invalid")]
	AuthInvalid,
	#[error("policy denied {domain:?}")]
	PolicyDeny { domain: String },
	#[error("approval timed out for {domain:?}")]
	ApprovalTimeout { domain: String },
	#[error("upstream dial to {target:?} timed out")]
	UpstreamTimeout { target: String },
	#[error("upstream {target:?} unreachable: {source}")]
	UpstreamUnreachable {
		target: String,
		#[source]
		source: std::io::Error,
	},
}
