//! `SignalReloader`: listens for a reload signal and re-runs the policy
//! engine's full reload (spec.md §4.H).

use std::sync::Arc;

use guardian_core::PolicyEngine;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Called after a successful `ReloadAll`, e.g. to clear a derived cache
/// the proxy keeps alongside the engine. A no-op hook is fine; this
/// exists purely so the proxy can plug itself in without the reloader
/// knowing anything about it.
pub type PostReloadHook = Arc<dyn Fn() + Send + Sync>;

pub struct SignalReloader {
	engine: Arc<PolicyEngine>,
	hook: Option<PostReloadHook>,
}

impl SignalReloader {
	pub fn new(engine: Arc<PolicyEngine>, hook: Option<PostReloadHook>) -> Self {
		Self { engine, hook }
	}

	/// Runs until `cancel` fires. On each SIGHUP, calls `ReloadAll`;
	/// failures are logged but never stop the loop.
	pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
		let mut hangup = signal(SignalKind::hangup())?;
		loop {
			tokio::select! {
				_ = cancel.cancelled() => {
					info!("signal reloader shutting down");
					return Ok(());
				}
				signal = hangup.recv() => {
					if signal.is_none() {
						// The underlying signal stream closed; nothing more to listen for.
						return Ok(());
					}
					match self.engine.reload_all().await {
						Ok(()) => {
							info!("policy reload complete");
							if let Some(hook) = &self.hook {
								hook();
							}
						},
						Err(e) => warn!("policy reload failed: {e}"),
					}
				}
			}
		}
	}
}
