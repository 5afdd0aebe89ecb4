//! Loopback-only HTTP surface for token lifecycle and approval
//! resolution (SPEC_FULL.md §4(new)J), the concrete contract spec.md
//! §6's "Token API" and "UI approval queue" describe as external
//! collaborators.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use guardian_core::store::{TokenFile, TokenStore};
use guardian_core::{ApprovalResponse, ApprovalQueue, PolicyEngine, Scope, TokenRegistry};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub struct AdminState {
	pub engine: Arc<PolicyEngine>,
	pub registry: Arc<TokenRegistry>,
	pub store: Arc<TokenStore>,
	pub approvals: Arc<ApprovalQueue>,
}

pub fn router(state: Arc<AdminState>) -> axum::Router {
	axum::Router::new()
		.route("/tokens", post(register_token).get(list_tokens))
		.route("/tokens/full", post(register_token_full))
		.route("/tokens/{cloister}", delete(revoke_token))
		.route("/approvals", get(list_approvals))
		.route("/approvals/{id}/decide", post(decide_approval))
		.route("/approvals/stream", get(stream_approvals))
		.with_state(state)
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
	cloister: String,
	project: String,
	#[serde(default)]
	workspace: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
	token: String,
}

async fn register_token(
	State(state): State<Arc<AdminState>>,
	Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AdminError> {
	let token = state
		.registry
		.issue(req.cloister.as_str(), req.project.as_str(), req.workspace.as_str())
		.await?;
	state
		.store
		.save_full(
			&req.cloister,
			&TokenFile {
				token: token.clone(),
				project: req.project,
				workspace: req.workspace,
			},
		)
		.await?;
	Ok(Json(RegisterResponse { token }))
}

#[derive(Debug, Deserialize)]
struct RegisterFullRequest {
	token: String,
	cloister: String,
	project: String,
	#[serde(default)]
	workspace: String,
}

async fn register_token_full(
	State(state): State<Arc<AdminState>>,
	Json(req): Json<RegisterFullRequest>,
) -> Result<StatusCode, AdminError> {
	state
		.store
		.save_full(
			&req.cloister,
			&TokenFile {
				token: req.token.clone(),
				project: req.project.clone(),
				workspace: req.workspace.clone(),
			},
		)
		.await?;
	state
		.registry
		.restore(req.token, req.cloister, req.project, req.workspace)
		.await;
	Ok(StatusCode::NO_CONTENT)
}

async fn revoke_token(
	State(state): State<Arc<AdminState>>,
	Path(cloister): Path<String>,
) -> Result<StatusCode, AdminError> {
	let Some(file) = state.store.load_one(&cloister).await? else {
		return Ok(StatusCode::NOT_FOUND);
	};
	state.store.remove(&cloister).await?;
	state.registry.revoke(&file.token).await;
	state.engine.revoke_token(&file.token).await;
	Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct TokenSummary {
	cloister: String,
	project: String,
	workspace: String,
	token_prefix: String,
}

async fn list_tokens(State(state): State<Arc<AdminState>>) -> Result<Json<Vec<TokenSummary>>, AdminError> {
	let files = state.store.list_cloisters().await?;
	Ok(Json(
		files
			.into_iter()
			.map(|(cloister, f)| TokenSummary {
				cloister,
				project: f.project,
				workspace: f.workspace,
				token_prefix: crate::audit::token_hash(&f.token).to_string(),
			})
			.collect(),
	))
}

#[derive(Debug, Serialize)]
struct PendingApprovalView {
	id: String,
	project: String,
	cloister: String,
	domain: String,
}

async fn list_approvals(State(state): State<Arc<AdminState>>) -> Json<Vec<PendingApprovalView>> {
	Json(
		state
			.approvals
			.list()
			.await
			.into_iter()
			.map(|a| PendingApprovalView {
				id: a.id.to_string(),
				project: a.project.to_string(),
				cloister: a.cloister.to_string(),
				domain: a.domain.to_string(),
			})
			.collect(),
	)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DecideStatus {
	Approved,
	Denied,
}

#[derive(Debug, Deserialize)]
struct DecideRequest {
	status: DecideStatus,
	scope: Scope,
	#[serde(default)]
	wildcard: bool,
}

async fn decide_approval(
	State(state): State<Arc<AdminState>>,
	Path(id): Path<String>,
	Json(req): Json<DecideRequest>,
) -> Result<StatusCode, AdminError> {
	let response = match req.status {
		DecideStatus::Approved => ApprovalResponse::Approved {
			scope: req.scope,
			wildcard: req.wildcard,
		},
		DecideStatus::Denied => ApprovalResponse::Denied {
			scope: req.scope,
			wildcard: req.wildcard,
		},
	};
	match state.approvals.resolve(&id, response).await {
		Ok(()) => Ok(StatusCode::NO_CONTENT),
		Err(_) => Ok(StatusCode::NOT_FOUND),
	}
}

async fn stream_approvals(State(state): State<Arc<AdminState>>) -> Response {
	let Some(rx) = state.approvals.subscribe() else {
		return (StatusCode::SERVICE_UNAVAILABLE, "approval event hub not installed").into_response();
	};
	let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|event| async move {
		let event = event.ok()?;
		serde_json::to_string(&ApprovalEventView::from(event))
			.ok()
			.map(|mut line| {
				line.push('\n');
				Ok::<_, std::io::Error>(Bytes::from(line))
			})
	});
	let body = axum::body::Body::from_stream(stream);
	Response::builder()
		.header("content-type", "application/x-ndjson")
		.body(body)
		.unwrap()
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind")]
enum ApprovalEventView {
	Added {
		id: String,
		project: String,
		cloister: String,
		domain: String,
	},
	Removed {
		id: String,
	},
}

impl From<guardian_core::approval::QueueEvent> for ApprovalEventView {
	fn from(event: guardian_core::approval::QueueEvent) -> Self {
		match event {
			guardian_core::approval::QueueEvent::Added(a) => ApprovalEventView::Added {
				id: a.id.to_string(),
				project: a.project.to_string(),
				cloister: a.cloister.to_string(),
				domain: a.domain.to_string(),
			},
			guardian_core::approval::QueueEvent::Removed(id) => ApprovalEventView::Removed { id: id.to_string() },
		}
	}
}

#[derive(Debug)]
struct AdminError(anyhow::Error);

impl IntoResponse for AdminError {
	fn into_response(self) -> Response {
		warn!("admin API error: {}", self.0);
		(StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
	}
}

impl<E> From<E> for AdminError
where
	E: Into<anyhow::Error>,
{
	fn from(e: E) -> Self {
		Self(e.into())
	}
}
