//! Domain model for Guardian's network-access broker: domain matching,
//! the layered policy evaluator, token identity, and the human-approval
//! queue. No file or network I/O lives here: callers inject loaders and
//! persistence so this crate stays testable without a filesystem.

pub mod prelude;

pub mod approval;
pub mod approver;
pub mod domain;
pub mod error;
pub mod policy;
pub mod store;
pub mod token;

/// Cheaply-clonable interned-ish string used for domains, tokens, and
/// names that get copied across lock boundaries on every policy check.
pub type Strng = arcstr::ArcStr;

pub use approval::{ApprovalQueue, ApprovalResponse, ApprovalStatus, PendingApproval};
pub use approver::DomainApprover;
pub use domain::DomainSet;
pub use error::{ApprovalError, PolicyError, TokenError};
pub use policy::{
	ConfigLoader, DecisionLoader, PolicyEngine, ProjectLister, ProxyPolicy, RawDecisions, Scope,
	Verdict,
};
pub use store::{TokenFile, TokenStore};
pub use token::{TokenInfo, TokenRegistry};
