//! The CONNECT proxy listener (spec.md §4.G). Handled directly over
//! `tokio::net::TcpStream`, not through an HTTP framework: once the
//! tunnel is established we need the literal bytes already read off the
//! wire (anything pipelined right after the blank line, e.g. a TLS
//! ClientHello sent in the same segment as the CONNECT) so they can be
//! forwarded to the upstream instead of silently discarded (an HTTP
//! server abstraction would already have consumed that trailing buffer).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use guardian_core::{DomainApprover, PolicyEngine, TokenRegistry, Verdict, domain};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditEvent, token_hash};
use crate::error::ProxyError;

const MAX_HEADER_BYTES: usize = 8 * 1024;
const COPY_BUF_SIZE: usize = 16 * 1024;

/// Everything a connection handler needs; shared across every accepted
/// connection via `Arc`.
pub struct ProxyDeps {
	pub engine: Arc<PolicyEngine>,
	pub tokens: Arc<TokenRegistry>,
	pub approver: Arc<DomainApprover>,
	pub realm: String,
	pub dial_timeout: Duration,
	pub idle_timeout: Duration,
	pub header_timeout: Duration,
}

/// Runs the accept loop until `cancel` fires, then stops accepting and
/// gives in-flight connections `shutdown_timeout` to finish before
/// aborting whatever remains (spec.md §4.G "Shutdown").
pub async fn serve(
	listener: TcpListener,
	deps: Arc<ProxyDeps>,
	cancel: CancellationToken,
	shutdown_timeout: Duration,
) {
	let mut connections: JoinSet<()> = JoinSet::new();
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						let deps = deps.clone();
						connections.spawn(async move {
							if let Err(e) = handle_connection(stream, peer, &deps).await {
								debug!(%peer, error = %e, "connection ended");
							}
						});
					},
					Err(e) => {
						warn!("accept error: {e}");
					},
				}
			}
			_ = cancel.cancelled() => {
				info!("proxy listener shutting down, draining connections");
				break;
			}
		}
	}

	if tokio::time::timeout(shutdown_timeout, async {
		while connections.join_next().await.is_some() {}
	})
	.await
	.is_err()
	{
		warn!("shutdown drain window elapsed, aborting remaining connections");
		connections.shutdown().await;
	}
}

#[instrument(level = "debug", skip(stream, deps), fields(%peer))]
async fn handle_connection(stream: TcpStream, peer: SocketAddr, deps: &ProxyDeps) -> Result<(), ProxyError> {
	let mut reader = BufReader::new(stream);

	let request_line = read_line_bounded(&mut reader, deps.header_timeout).await?;
	let (method, target) = parse_request_line(&request_line)?;
	if !method.eq_ignore_ascii_case("CONNECT") {
		write_simple(reader.get_mut(), 405, "Method Not Allowed").await.ok();
		return Err(ProxyError::ClientProtocol(format!("unsupported method {method:?}")));
	}

	let headers = read_headers_bounded(&mut reader, deps.header_timeout, request_line.len()).await?;
	let proxy_auth = headers.into_iter().find_map(|(name, value)| {
		name.eq_ignore_ascii_case("Proxy-Authorization").then_some(value)
	});

	let token = match authenticate(proxy_auth.as_deref()) {
		Ok(token) => token,
		Err(e) => {
			write_auth_challenge(reader.get_mut(), &deps.realm).await.ok();
			return Err(e);
		},
	};

	let Some(identity) = deps.tokens.touch(&token).await else {
		write_auth_challenge(reader.get_mut(), &deps.realm).await.ok();
		return Err(ProxyError::AuthInvalid);
	};
	let project = identity.project.to_string();
	let cloister = identity.cloister.to_string();

	let (host, _port) = parse_host_port(&target)?;
	let domain = domain::canonicalize(&host);

	let verdict = deps.engine.check(&token, &project, &domain).await;
	let verdict = match verdict {
		Verdict::AskHuman => deps
			.approver
			.request(&token, &project, &cloister, &domain)
			.await
			.unwrap_or(Verdict::Deny),
		other => other,
	};

	if verdict != Verdict::Allow {
		AuditEvent {
			kind: "policy_deny",
			token_hash: token_hash(&token),
			project: &project,
			domain: &domain,
			detail: &target,
		}
		.emit_info();
		write_simple(reader.get_mut(), 403, "Forbidden").await.ok();
		return Err(ProxyError::PolicyDeny { domain });
	}

	let upstream = match tokio::time::timeout(deps.dial_timeout, TcpStream::connect(&target)).await {
		Ok(Ok(stream)) => stream,
		Ok(Err(e)) => {
			write_simple(reader.get_mut(), 502, "Bad Gateway").await.ok();
			return Err(ProxyError::UpstreamUnreachable { target, source: e });
		},
		Err(_) => {
			write_simple(reader.get_mut(), 504, "Gateway Timeout").await.ok();
			return Err(ProxyError::UpstreamTimeout { target });
		},
	};

	AuditEvent {
		kind: "tunnel_open",
		token_hash: token_hash(&token),
		project: &project,
		domain: &domain,
		detail: &target,
	}
	.emit_info();

	reader
		.get_mut()
		.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
		.await
		.map_err(ProxyError::Transport)?;

	let leftover = reader.buffer().to_vec();
	let client = reader.into_inner();
	let mut upstream = upstream;

	if !leftover.is_empty() {
		upstream
			.write_all(&leftover)
			.await
			.map_err(ProxyError::Transport)?;
	}

	let (client_read, client_write) = client.into_split();
	tunnel(client_read, client_write, upstream, deps.idle_timeout).await;
	Ok(())
}

/// Copies bytes in both directions until either side closes or sits
/// idle past `idle_timeout`, half-closing the peer's write side as each
/// direction ends (spec.md §4.G step 9).
async fn tunnel(
	client_read: impl tokio::io::AsyncRead + Unpin + Send + 'static,
	client_write: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
	upstream: TcpStream,
	idle_timeout: Duration,
) {
	let (upstream_read, upstream_write) = upstream.into_split();

	let mut set = JoinSet::new();
	set.spawn(copy_idle(client_read, upstream_write, idle_timeout));
	set.spawn(copy_idle(upstream_read, client_write, idle_timeout));
	while set.join_next().await.is_some() {}
}

async fn copy_idle(
	mut from: impl tokio::io::AsyncRead + Unpin + Send + 'static,
	mut to: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
	idle_timeout: Duration,
) {
	let mut buf = [0u8; COPY_BUF_SIZE];
	loop {
		let read = match tokio::time::timeout(idle_timeout, from.read(&mut buf)).await {
			Ok(Ok(0)) | Err(_) => break,
			Ok(Ok(n)) => n,
			Ok(Err(_)) => break,
		};
		if to.write_all(&buf[..read]).await.is_err() {
			break;
		}
	}
	let _ = to.shutdown().await;
}

async fn read_line_bounded(reader: &mut BufReader<TcpStream>, timeout: Duration) -> Result<String, ProxyError> {
	let mut line = String::new();
	let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
		.await
		.map_err(|_| ProxyError::ClientProtocol("timed out reading request line".to_string()))?
		.map_err(ProxyError::Transport)?;
	if read == 0 {
		return Err(ProxyError::ClientProtocol("connection closed before request".to_string()));
	}
	if line.len() > MAX_HEADER_BYTES {
		return Err(ProxyError::ClientProtocol("request line too large".to_string()));
	}
	Ok(line)
}

async fn read_headers_bounded(
	reader: &mut BufReader<TcpStream>,
	timeout: Duration,
	already_read: usize,
) -> Result<Vec<(String, String)>, ProxyError> {
	let mut headers = Vec::new();
	let mut total = already_read;
	loop {
		let mut line = String::new();
		let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
			.await
			.map_err(|_| ProxyError::ClientProtocol("timed out reading headers".to_string()))?
			.map_err(ProxyError::Transport)?;
		total += read;
		if total > MAX_HEADER_BYTES {
			return Err(ProxyError::ClientProtocol("headers too large".to_string()));
		}
		let trimmed = line.trim();
		if trimmed.is_empty() {
			break;
		}
		if let Some((name, value)) = trimmed.split_once(':') {
			headers.push((name.trim().to_string(), value.trim().to_string()));
		}
	}
	Ok(headers)
}

fn parse_request_line(line: &str) -> Result<(String, String), ProxyError> {
	let mut parts = line.trim().split_whitespace();
	let method = parts
		.next()
		.ok_or_else(|| ProxyError::ClientProtocol("empty request line".to_string()))?;
	let target = parts
		.next()
		.ok_or_else(|| ProxyError::ClientProtocol("missing CONNECT target".to_string()))?;
	Ok((method.to_string(), target.to_string()))
}

/// Splits a `host:port` (or bracketed IPv6) CONNECT target. Returns the
/// host without brackets or port.
fn parse_host_port(target: &str) -> Result<(String, u16), ProxyError> {
	if let Some(end) = target.find(']') {
		if let Some(start) = target.find('[') {
			let host = target[start + 1..end].to_string();
			let port = target[end + 1..]
				.strip_prefix(':')
				.unwrap_or("443")
				.parse()
				.map_err(|_| ProxyError::ClientProtocol(format!("invalid port in {target:?}")))?;
			return Ok((host, port));
		}
	}
	match target.rsplit_once(':') {
		Some((host, port)) => {
			let port = port
				.parse()
				.map_err(|_| ProxyError::ClientProtocol(format!("invalid port in {target:?}")))?;
			Ok((host.to_string(), port))
		},
		None => Ok((target.to_string(), 443)),
	}
}

/// Parses `Proxy-Authorization: Basic base64(user:token)`, returning the
/// password half as the bearer token (spec.md §6).
fn authenticate(header: Option<&str>) -> Result<String, ProxyError> {
	let header = header.ok_or(ProxyError::AuthMissing)?;
	let encoded = header
		.strip_prefix("Basic ")
		.or_else(|| header.strip_prefix("basic "))
		.ok_or(ProxyError::AuthInvalid)?;
	let decoded = BASE64.decode(encoded.trim()).map_err(|_| ProxyError::AuthInvalid)?;
	let decoded = String::from_utf8(decoded).map_err(|_| ProxyError::AuthInvalid)?;
	let (_user, token) = decoded.split_once(':').ok_or(ProxyError::AuthInvalid)?;
	if token.is_empty() {
		return Err(ProxyError::AuthInvalid);
	}
	Ok(token.to_string())
}

async fn write_simple(stream: &mut TcpStream, status: u16, reason: &str) -> std::io::Result<()> {
	let body = format!(
		"HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reason}",
		reason.len()
	);
	stream.write_all(body.as_bytes()).await
}

async fn write_auth_challenge(stream: &mut TcpStream, realm: &str) -> std::io::Result<()> {
	let body = format!(
		"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"{realm}\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
	);
	stream.write_all(body.as_bytes()).await
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_request_line_extracts_method_and_target() {
		let (method, target) = parse_request_line("CONNECT example.com:443 HTTP/1.1\r\n").unwrap();
		assert_eq!(method, "CONNECT");
		assert_eq!(target, "example.com:443");
	}

	#[test]
	fn parse_host_port_defaults_to_443() {
		let (host, port) = parse_host_port("example.com").unwrap();
		assert_eq!(host, "example.com");
		assert_eq!(port, 443);
	}

	#[test]
	fn parse_host_port_handles_ipv6_literal() {
		let (host, port) = parse_host_port("[::1]:8443").unwrap();
		assert_eq!(host, "::1");
		assert_eq!(port, 8443);
	}

	#[test]
	fn authenticate_extracts_password_as_token() {
		let encoded = BASE64.encode("any:deadbeef");
		let header = format!("Basic {encoded}");
		assert_eq!(authenticate(Some(&header)).unwrap(), "deadbeef");
	}

	#[test]
	fn authenticate_rejects_missing_header() {
		assert!(matches!(authenticate(None), Err(ProxyError::AuthMissing)));
	}

	#[test]
	fn authenticate_rejects_malformed_basic() {
		assert!(matches!(
			authenticate(Some("Basic not-base64!!")),
			Err(ProxyError::AuthInvalid)
		));
	}
}
