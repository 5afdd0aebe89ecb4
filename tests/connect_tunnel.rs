//! End-to-end CONNECT tunnel scenarios (spec.md §8, the 8 concrete
//! seed tests). Exercises the full stack (TCP accept, Proxy-
//! Authorization parsing, `PolicyEngine::check`, `DomainApprover`, and
//! the tunnel copy loop) over real loopback sockets, rather than
//! mocking the socket layer.
//!
//! The policy layers here allow/deny the loopback address itself
//! (`127.0.0.1`) since the proxy dials the literal CONNECT target, and
//! these tests have no real DNS/upstream beyond a local echo listener.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use guardian::decisions::{FileConfigLoader, FileDecisionLoader, FileProjectLister};
use guardian::proxy::{self, ProxyDeps};
use guardian_core::policy::{RecordDecisionArgs, Scope};
use guardian_core::{ApprovalQueue, ApprovalResponse, DomainApprover, PolicyEngine, TokenRegistry};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

struct Harness {
	addr: SocketAddr,
	engine: Arc<PolicyEngine>,
	tokens: Arc<TokenRegistry>,
	approvals: Arc<ApprovalQueue>,
	shutdown: CancellationToken,
	config_root: tempfile::TempDir,
}

impl Harness {
	fn global_decisions_path(&self) -> std::path::PathBuf {
		self.config_root.path().join("decisions").join("global.yaml")
	}
}

async fn write_yaml(path: &Path, body: &str) {
	tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
	tokio::fs::write(path, body).await.unwrap();
}

async fn spawn_harness(approval_timeout: Duration, idle_timeout: Duration) -> Harness {
	spawn_harness_with(approval_timeout, idle_timeout, &[]).await
}

/// Builds a harness, writing `files` (paths relative to the config
/// root, e.g. `config/global.yaml`) before the engine's initial load
/// runs.
async fn spawn_harness_with(
	approval_timeout: Duration,
	idle_timeout: Duration,
	files: &[(&str, &str)],
) -> Harness {
	let config_root = tempfile::tempdir().unwrap();
	for (relative, body) in files {
		write_yaml(&config_root.path().join(relative), body).await;
	}

	let config_dir = config_root.path().join("config");
	let project_config_dir = config_dir.join("projects");
	let decisions_dir = config_root.path().join("decisions");
	let project_decisions_dir = decisions_dir.join("projects");

	let config_loader = Arc::new(FileConfigLoader::new(&config_dir, &project_config_dir));
	let decision_loader = Arc::new(FileDecisionLoader::new(&decisions_dir, &project_decisions_dir));
	let project_lister = Arc::new(FileProjectLister::new(&project_config_dir, &project_decisions_dir));

	let engine = Arc::new(
		PolicyEngine::new(config_loader, decision_loader, project_lister, 3)
			.await
			.unwrap(),
	);
	let tokens = Arc::new(TokenRegistry::new());
	let approvals = ApprovalQueue::with_timeout(approval_timeout);
	let approver = Arc::new(DomainApprover::new(engine.clone(), approvals.clone()));

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let deps = Arc::new(ProxyDeps {
		engine: engine.clone(),
		tokens: tokens.clone(),
		approver,
		realm: "guardian-test".to_string(),
		dial_timeout: Duration::from_secs(5),
		idle_timeout,
		header_timeout: Duration::from_secs(5),
	});
	let shutdown = CancellationToken::new();
	tokio::spawn(proxy::serve(listener, deps, shutdown.clone(), Duration::from_secs(5)));

	Harness {
		addr,
		engine,
		tokens,
		approvals,
		shutdown,
		config_root,
	}
}

/// Accepts loopback connections and echoes every byte back, standing
/// in for the "upstream" a CONNECT tunnel would otherwise reach over
/// the internet.
async fn spawn_echo_upstream() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				break;
			};
			tokio::spawn(async move {
				let mut buf = [0u8; 4096];
				loop {
					match stream.read(&mut buf).await {
						Ok(0) | Err(_) => break,
						Ok(n) => {
							if stream.write_all(&buf[..n]).await.is_err() {
								break;
							}
						},
					}
				}
			});
		}
	});
	addr
}

struct Response {
	status_line: String,
	headers: Vec<String>,
	stream: TcpStream,
}

async fn send_connect(proxy_addr: SocketAddr, target: &str, token: Option<&str>) -> Response {
	let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
	let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
	if let Some(token) = token {
		let encoded = BASE64.encode(format!("any:{token}"));
		request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
	}
	request.push_str("\r\n");
	stream.write_all(request.as_bytes()).await.unwrap();

	let mut reader = BufReader::new(stream);
	let mut status_line = String::new();
	reader.read_line(&mut status_line).await.unwrap();

	let mut headers = Vec::new();
	loop {
		let mut line = String::new();
		let n = reader.read_line(&mut line).await.unwrap();
		if n == 0 || line.trim().is_empty() {
			break;
		}
		headers.push(line.trim().to_string());
	}

	Response {
		status_line: status_line.trim().to_string(),
		headers,
		stream: reader.into_inner(),
	}
}

#[tokio::test]
async fn happy_tunnel_allows_and_echoes_bytes_in_both_directions() {
	let upstream = spawn_echo_upstream().await;
	let global = format!("allow: [\"{}\"]\ndeny: []\n", upstream.ip());
	let h = spawn_harness_with(
		Duration::from_secs(5),
		Duration::from_secs(5),
		&[("config/global.yaml", &global)],
	)
	.await;

	let token = h.tokens.issue("cloister", "proj", "").await.unwrap();
	let mut resp = send_connect(h.addr, &upstream.to_string(), Some(&token)).await;
	assert_eq!(resp.status_line, "HTTP/1.1 200 Connection Established");

	let payload = vec![0x5au8; 64 * 1024];
	let write = resp.stream.write_all(&payload);
	let mut echoed = vec![0u8; payload.len()];
	let read = resp.stream.read_exact(&mut echoed);
	let (write_result, read_result) = tokio::join!(write, read);
	write_result.unwrap();
	read_result.unwrap();
	assert_eq!(echoed, payload);

	h.shutdown.cancel();
}

#[tokio::test]
async fn deny_wins_over_project_allow() {
	let h = spawn_harness_with(
		Duration::from_secs(5),
		Duration::from_secs(5),
		&[
			("config/global.yaml", "allow: []\ndeny: [\"127.0.0.1\"]\n"),
			("config/projects/p.yaml", "allow: [\"127.0.0.1\"]\ndeny: []\n"),
		],
	)
	.await;
	h.engine.ensure_project("p").await.unwrap();
	let token = h.tokens.issue("cloister", "p", "").await.unwrap();

	let resp = send_connect(h.addr, "127.0.0.1:1", Some(&token)).await;
	assert_eq!(resp.status_line, "HTTP/1.1 403 Forbidden");
	h.shutdown.cancel();
}

#[tokio::test]
async fn approval_allow_session_is_scoped_to_the_asking_token() {
	let upstream = spawn_echo_upstream().await;
	let h = spawn_harness(Duration::from_secs(5), Duration::from_secs(5)).await;
	let token_a = h.tokens.issue("cloister", "proj", "").await.unwrap();
	let token_b = h.tokens.issue("cloister", "proj", "").await.unwrap();

	let addr = h.addr;
	let target = upstream.to_string();
	let target_for_task = target.clone();
	let task = tokio::spawn(async move { send_connect(addr, &target_for_task, Some(&token_a)).await });

	// Wait for the CONNECT to park on the approval queue, then approve it
	// for Session scope (as if a human answered via the UI).
	let pending = loop {
		let pending = h.approvals.list().await;
		if let Some(p) = pending.into_iter().next() {
			break p;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	};
	h.approvals
		.resolve(
			&pending.id,
			ApprovalResponse::Approved {
				scope: Scope::Session,
				wildcard: false,
			},
		)
		.await
		.unwrap();
	let resp = task.await.unwrap();
	assert_eq!(resp.status_line, "HTTP/1.1 200 Connection Established");

	// The same token's next CONNECT to the same domain is now fast-pathed.
	let resp2 = send_connect(h.addr, &target, Some(&token_a)).await;
	assert_eq!(resp2.status_line, "HTTP/1.1 200 Connection Established");
	assert_eq!(h.approvals.len().await, 0);

	// A different token still blocks on approval for the same domain.
	let task_b = tokio::spawn(async move { send_connect(addr, &target, Some(&token_b)).await });
	tokio::time::sleep(Duration::from_millis(30)).await;
	assert_eq!(h.approvals.len().await, 1);
	let pending_b = h.approvals.list().await.into_iter().next().unwrap();
	h
		.approvals
		.resolve(
			&pending_b.id,
			ApprovalResponse::Denied {
				scope: Scope::Once,
				wildcard: false,
			},
		)
		.await
		.unwrap();
	let resp_b = task_b.await.unwrap();
	assert_eq!(resp_b.status_line, "HTTP/1.1 403 Forbidden");

	h.shutdown.cancel();
}

#[tokio::test]
async fn approval_timeout_is_deny_and_queue_empties() {
	let upstream = spawn_echo_upstream().await;
	let h = spawn_harness(Duration::from_millis(100), Duration::from_secs(5)).await;
	let token = h.tokens.issue("cloister", "proj", "").await.unwrap();

	let resp = send_connect(h.addr, &upstream.to_string(), Some(&token)).await;
	assert_eq!(resp.status_line, "HTTP/1.1 403 Forbidden");
	assert_eq!(h.approvals.len().await, 0);

	h.shutdown.cancel();
}

#[tokio::test]
async fn wildcard_deny_blocks_subdomains_fast_without_approval() {
	let h = spawn_harness(Duration::from_secs(30), Duration::from_secs(5)).await;
	h
		.engine
		.record_decision(RecordDecisionArgs {
			token: String::new(),
			project: String::new(),
			domain: "api.evil.example.com".to_string(),
			scope: Scope::Global,
			allowed: false,
			wildcard: true,
		})
		.await
		.unwrap();
	let token = h.tokens.issue("cloister", "proj", "").await.unwrap();

	let start = std::time::Instant::now();
	let resp = send_connect(h.addr, "other.evil.example.com:443", Some(&token)).await;
	assert_eq!(resp.status_line, "HTTP/1.1 403 Forbidden");
	assert!(start.elapsed() < Duration::from_secs(1), "deny should be immediate, not wait on approval");
	assert_eq!(h.approvals.len().await, 0);

	h.shutdown.cancel();
}

#[tokio::test]
async fn reload_picks_up_file_edits_without_reapproval() {
	let h = spawn_harness_with(
		Duration::from_secs(5),
		Duration::from_secs(5),
		&[("decisions/global.yaml", "allow: []\ndeny: [\"127.0.0.1\"]\n")],
	)
	.await;
	let token = h.tokens.issue("cloister", "proj", "").await.unwrap();

	let resp = send_connect(h.addr, "127.0.0.1:1", Some(&token)).await;
	assert_eq!(resp.status_line, "HTTP/1.1 403 Forbidden");

	// Simulate a human editing the decisions file directly on disk, then
	// the reload signal (SignalReloader calls exactly this on SIGHUP).
	write_yaml(&h.global_decisions_path(), "allow: [\"127.0.0.1\"]\ndeny: []\n").await;
	h.engine.reload_all().await.unwrap();

	let resp2 = send_connect(h.addr, "127.0.0.1:1", Some(&token)).await;
	assert_ne!(resp2.status_line, "HTTP/1.1 403 Forbidden");

	h.shutdown.cancel();
}

#[tokio::test]
async fn unauthenticated_request_gets_407_with_challenge() {
	let h = spawn_harness(Duration::from_secs(5), Duration::from_secs(5)).await;
	let resp = send_connect(h.addr, "example.com:443", None).await;
	assert_eq!(resp.status_line, "HTTP/1.1 407 Proxy Authentication Required");
	assert!(
		resp
			.headers
			.iter()
			.any(|h| h.starts_with("Proxy-Authenticate: Basic realm=")),
		"missing Proxy-Authenticate challenge: {:?}",
		resp.headers
	);
	h.shutdown.cancel();
}

#[tokio::test]
async fn idle_timeout_closes_the_tunnel() {
	let upstream = spawn_echo_upstream().await;
	let global = format!("allow: [\"{}\"]\ndeny: []\n", upstream.ip());
	let h = spawn_harness_with(
		Duration::from_secs(5),
		Duration::from_millis(150),
		&[("config/global.yaml", &global)],
	)
	.await;
	let token = h.tokens.issue("cloister", "proj", "").await.unwrap();

	let mut resp = send_connect(h.addr, &upstream.to_string(), Some(&token)).await;
	assert_eq!(resp.status_line, "HTTP/1.1 200 Connection Established");

	let mut buf = [0u8; 16];
	let read = tokio::time::timeout(Duration::from_secs(2), resp.stream.read(&mut buf))
		.await
		.expect("idle timeout should close the tunnel well within 2s")
		.unwrap();
	assert_eq!(read, 0, "expected EOF once the idle timeout elapses");

	h.shutdown.cancel();
}
