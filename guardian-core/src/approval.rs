//! The parking lot for AskHuman verdicts: pending approvals, their
//! timeout watchers, and the broadcast feed a UI can tail (spec.md §4.E).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use rand::RngCore;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::Strng;
use crate::error::ApprovalError;
use crate::policy::Scope;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// `Id` from spec.md §3: "a fresh 8-byte random identifier in hex".
fn generate_id() -> String {
	let mut bytes = [0u8; 8];
	rand::rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

/// The decision a human (or the timeout watcher) delivers back through
/// a [`PendingApproval`]'s sink. `wildcard` asks `RecordDecision` to
/// expand the domain to a `*.parent` pattern (spec.md §3
/// "ApprovalResponse"); it's ignored for `Once` scope and by the
/// timeout watcher, which never records anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResponse {
	Approved { scope: Scope, wildcard: bool },
	Denied { scope: Scope, wildcard: bool },
	TimedOut,
}

/// Current disposition of a queued entry, for listing/UI display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
	Pending,
	Resolved,
}

/// One request parked waiting on a human decision. Cloneable for
/// `List()`; the response sink is only reachable through the queue
/// itself, never copied out, per spec.md's "List (copy without the
/// ResponseSink)".
#[derive(Debug, Clone)]
pub struct PendingApproval {
	pub id: Strng,
	pub token: Strng,
	pub project: Strng,
	pub cloister: Strng,
	pub domain: Strng,
	pub created_at: SystemTime,
	pub expires_at: SystemTime,
	pub status: ApprovalStatus,
}

/// Broadcast event for UI streaming (spec.md §4.E "event fan-out").
#[derive(Debug, Clone)]
pub enum QueueEvent {
	Added(PendingApproval),
	Removed(Strng),
}

struct Entry {
	approval: PendingApproval,
	sink: mpsc::Sender<ApprovalResponse>,
	cancel: CancellationToken,
	watcher: AbortHandle,
}

/// The queue of requests awaiting a human decision. `Add` spawns a
/// timeout watcher per entry; `Remove` cancels it. An optional
/// broadcast hub fans out add/remove events to anyone tailing the
/// approval stream. Always lives behind an `Arc` (`new`/`with_timeout`
/// return one directly) so the timeout watcher can hold a `Weak` handle
/// back to the queue and remove its own entry when it fires.
pub struct ApprovalQueue {
	entries: tokio::sync::Mutex<HashMap<Strng, Entry>>,
	default_timeout: Duration,
	hub: tokio::sync::OnceCell<broadcast::Sender<QueueEvent>>,
	self_ref: Weak<ApprovalQueue>,
}

impl ApprovalQueue {
	pub fn new() -> Arc<Self> {
		Self::with_timeout(DEFAULT_TIMEOUT)
	}

	pub fn with_timeout(default_timeout: Duration) -> Arc<Self> {
		Arc::new_cyclic(|weak| Self {
			entries: tokio::sync::Mutex::new(HashMap::new()),
			default_timeout,
			hub: tokio::sync::OnceCell::new(),
			self_ref: weak.clone(),
		})
	}

	/// Installs the broadcast hub used for UI streaming. Meant to be
	/// called exactly once at startup, before any request is parked
	/// (calling it after entries have already been added is undefined
	/// behavior per spec.md §4.E, and is not guarded against here). A
	/// second call silently keeps the first hub (the `OnceCell` just
	/// refuses the later `set`) and returns a receiver subscribed to it.
	pub fn set_event_hub(&self, capacity: usize) -> broadcast::Receiver<QueueEvent> {
		let (tx, rx) = broadcast::channel(capacity);
		match self.hub.set(tx) {
			Ok(()) => rx,
			Err(_already_set) => self.subscribe().expect("hub was just observed to be set"),
		}
	}

	/// Subscribes to the already-installed event hub, for every caller
	/// after the first (e.g. a second UI client opening the approvals
	/// stream). Returns `None` if no hub has been installed yet.
	pub fn subscribe(&self) -> Option<broadcast::Receiver<QueueEvent>> {
		self.hub.get().map(|tx| tx.subscribe())
	}

	/// Parks a new request, assigns it an Id, and starts its timeout
	/// watcher. Returns the Id and a receiver the caller awaits for the
	/// eventual [`ApprovalResponse`].
	#[instrument(level = "debug", skip(self))]
	pub async fn add(
		&self,
		token: Strng,
		project: Strng,
		cloister: Strng,
		domain: Strng,
	) -> (Strng, mpsc::Receiver<ApprovalResponse>) {
		self
			.add_with_timeout(token, project, cloister, domain, self.default_timeout)
			.await
	}

	pub async fn add_with_timeout(
		&self,
		token: Strng,
		project: Strng,
		cloister: Strng,
		domain: Strng,
		timeout: Duration,
	) -> (Strng, mpsc::Receiver<ApprovalResponse>) {
		let (sink, recv) = mpsc::channel(1);
		let cancel = CancellationToken::new();
		let now = SystemTime::now();

		let mut entries = self.entries.lock().await;
		let id: Strng = loop {
			let candidate: Strng = generate_id().into();
			if !entries.contains_key(&candidate) {
				break candidate;
			}
		};

		let approval = PendingApproval {
			id: id.clone(),
			token,
			project,
			cloister,
			domain,
			created_at: now,
			expires_at: now + timeout,
			status: ApprovalStatus::Pending,
		};

		let watcher = {
			let id = id.clone();
			let cancel = cancel.clone();
			let self_ref = self.self_ref.clone();
			tokio::spawn(async move {
				tokio::select! {
					_ = tokio::time::sleep(timeout) => {
						if let Some(queue) = self_ref.upgrade() {
							queue.timeout_remove(&id).await;
						}
					}
					_ = cancel.cancelled() => {}
				}
			})
			.abort_handle()
		};

		entries.insert(
			id.clone(),
			Entry {
				approval: approval.clone(),
				sink,
				cancel,
				watcher,
			},
		);
		drop(entries);

		self.emit(QueueEvent::Added(approval));
		(id, recv)
	}

	pub async fn get(&self, id: &str) -> Option<PendingApproval> {
		self.entries.lock().await.get(id).map(|e| e.approval.clone())
	}

	pub async fn list(&self) -> Vec<PendingApproval> {
		self.entries.lock().await.values().map(|e| e.approval.clone()).collect()
	}

	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}

	/// Delivers a resolution to the waiting sink, then removes the
	/// entry. Idempotent: resolving a now-absent or already-resolved
	/// entry is a no-op that returns `NotFound`.
	pub async fn resolve(&self, id: &str, response: ApprovalResponse) -> Result<(), ApprovalError> {
		let entry = self.entries.lock().await.remove(id);
		let Some(entry) = entry else {
			return Err(ApprovalError::NotFound(id.to_string()));
		};
		entry.cancel.cancel();
		entry.watcher.abort();
		let _ = entry.sink.try_send(response);
		self.emit(QueueEvent::Removed(entry.approval.id.clone()));
		Ok(())
	}

	/// Cancels the watcher and deletes the entry without delivering a
	/// response. Idempotent.
	pub async fn remove(&self, id: &str) {
		if let Some(entry) = self.entries.lock().await.remove(id) {
			entry.cancel.cancel();
			entry.watcher.abort();
			self.emit(QueueEvent::Removed(entry.approval.id.clone()));
		}
	}

	/// Called by an entry's own timeout watcher when it fires first. If
	/// the entry is still parked (nobody resolved or removed it in the
	/// meantime), delivers `TimedOut` to the sink, deletes the entry, and
	/// emits `Removed` (spec.md §4.E "on timeout, removes the entry and
	/// non-blockingly emits `{TimedOut}`"). A no-op if the entry was
	/// already resolved or removed, since that path cancelled this
	/// watcher before it could reach here.
	async fn timeout_remove(&self, id: &str) {
		let entry = self.entries.lock().await.remove(id);
		if let Some(entry) = entry {
			let _ = entry.sink.try_send(ApprovalResponse::TimedOut);
			self.emit(QueueEvent::Removed(entry.approval.id.clone()));
		}
	}

	fn emit(&self, event: QueueEvent) {
		if let Some(hub) = self.hub.get() {
			// A broadcast channel with no receivers errors on send; that's
			// expected when no UI is attached and is not a failure.
			let _ = hub.send(event);
		} else {
			let _ = event;
		}
	}
}

pub(crate) fn validate_domain(domain: &str) -> Result<(), ApprovalError> {
	if domain.is_empty() || domain.len() > 253 || domain.bytes().any(|b| b.is_ascii_control()) {
		return Err(ApprovalError::InvalidDomain(domain.to_string()));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn add_then_resolve_delivers_response() {
		let queue = ApprovalQueue::new();
		let (id, mut recv) = queue.add("tok".into(), "proj".into(), "cloister".into(), "example.com".into()).await;
		assert_eq!(queue.len().await, 1);

		queue
			.resolve(
				&id,
				ApprovalResponse::Approved {
					scope: Scope::Once,
					wildcard: false,
				},
			)
			.await
			.unwrap();
		assert_eq!(queue.len().await, 0);
		assert_eq!(
			recv.recv().await,
			Some(ApprovalResponse::Approved {
				scope: Scope::Once,
				wildcard: false,
			})
		);
	}

	#[tokio::test]
	async fn remove_is_idempotent() {
		let queue = ApprovalQueue::new();
		let (id, _recv) = queue.add("tok".into(), "proj".into(), "cloister".into(), "example.com".into()).await;
		queue.remove(&id).await;
		queue.remove(&id).await;
		assert_eq!(queue.len().await, 0);
	}

	#[tokio::test]
	async fn resolve_on_missing_id_reports_not_found() {
		let queue = ApprovalQueue::new();
		assert!(matches!(
			queue.resolve("missing", ApprovalResponse::TimedOut).await,
			Err(ApprovalError::NotFound(_))
		));
	}

	#[tokio::test(start_paused = true)]
	async fn timeout_watcher_delivers_timed_out() {
		let queue = ApprovalQueue::with_timeout(Duration::from_millis(10));
		let (_id, mut recv) = queue.add("tok".into(), "proj".into(), "cloister".into(), "example.com".into()).await;
		tokio::time::advance(Duration::from_millis(20)).await;
		assert_eq!(recv.recv().await, Some(ApprovalResponse::TimedOut));
	}

	#[tokio::test]
	async fn event_hub_sees_add_and_remove() {
		let queue = ApprovalQueue::new();
		let mut rx = queue.set_event_hub(8);
		let (id, _recv) = queue.add("tok".into(), "proj".into(), "cloister".into(), "example.com".into()).await;
		match rx.recv().await.unwrap() {
			QueueEvent::Added(a) => assert_eq!(a.id, id),
			other => panic!("unexpected event: {other:?}"),
		}
		queue.remove(&id).await;
		match rx.recv().await.unwrap() {
			QueueEvent::Removed(removed) => assert_eq!(removed, id),
			other => panic!("unexpected event: {other:?}"),
		}
	}
}
