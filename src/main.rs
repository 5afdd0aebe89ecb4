//! `guardian` binary: CLI entry point, process wiring for components
//! A–J (spec.md §2, SPEC_FULL.md §4(new)K), graceful shutdown on
//! SIGINT/SIGTERM, reload on SIGHUP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use guardian::config::GuardianConfig;
use guardian::decisions::{FileConfigLoader, FileDecisionLoader, FileProjectLister};
use guardian::proxy::{self, ProxyDeps};
use guardian::admin;
use guardian::reload::SignalReloader;
use guardian_core::store::TokenStore;
use guardian_core::{ApprovalQueue, DomainApprover, PolicyEngine, TokenRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "guardian", about = "Host-side network-access broker for sandboxes")]
struct Args {
	/// Path to the YAML config file; built-in defaults are used if absent.
	#[arg(short, long, value_name = "file", global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Start the CONNECT proxy, admin API, and signal reloader.
	Run,
	/// Manage sandbox tokens via the loopback admin API.
	Token {
		#[command(subcommand)]
		action: TokenAction,
	},
}

#[derive(Subcommand, Debug)]
enum TokenAction {
	/// Mint a token for a sandbox and print it.
	Register {
		#[arg(long)]
		cloister: String,
		#[arg(long)]
		project: String,
		#[arg(long, default_value = "")]
		workspace: String,
	},
	/// Revoke a sandbox's token by cloister name.
	Revoke {
		#[arg(long)]
		cloister: String,
	},
	/// List registered sandboxes.
	List,
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_ansi(false)
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	let cfg = GuardianConfig::load(args.config.as_deref())?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			match args.command {
				Commands::Run => run(cfg).await,
				Commands::Token { action } => token_cli(cfg, action).await,
			}
		})
}

/// Builds components B–J and serves until SIGINT/SIGTERM (spec.md §6
/// "Signals"), then drains in-flight connections within
/// `shutdown_timeout` before returning.
async fn run(cfg: GuardianConfig) -> anyhow::Result<()> {
	info!(instance_id = %cfg.instance_id, "starting guardian");

	let config_loader = Arc::new(FileConfigLoader::new(cfg.config_dir(), cfg.project_config_dir()));
	let decision_loader = Arc::new(FileDecisionLoader::new(
		cfg.decisions_dir(),
		cfg.project_decisions_dir(),
	));
	let project_lister = Arc::new(FileProjectLister::new(
		cfg.project_config_dir(),
		cfg.project_decisions_dir(),
	));
	let engine = Arc::new(
		PolicyEngine::new(
			config_loader,
			decision_loader,
			project_lister,
			cfg.wildcard_min_labels,
		)
		.await?,
	);

	let store = Arc::new(TokenStore::new(cfg.tokens_dir()));
	let registry = Arc::new(TokenRegistry::new());
	for (cloister, file) in store.list_cloisters().await? {
		registry
			.restore(file.token, cloister, file.project, file.workspace)
			.await;
	}
	info!(tokens = registry.len().await, "rehydrated token registry");

	let approvals = ApprovalQueue::with_timeout(cfg.approval_timeout);
	// Installed once here, before any connection is handled, so every
	// `/approvals/stream` caller subscribes to the same live sender
	// instead of racing to install their own.
	let _ = approvals.set_event_hub(64);
	let approver = Arc::new(DomainApprover::new(engine.clone(), approvals.clone()));

	let shutdown = CancellationToken::new();

	let proxy_listener = TcpListener::bind(&cfg.listen_addr).await?;
	info!(addr = %cfg.listen_addr, "CONNECT proxy listening");
	let proxy_deps = Arc::new(ProxyDeps {
		engine: engine.clone(),
		tokens: registry.clone(),
		approver,
		realm: cfg.realm.clone(),
		dial_timeout: cfg.dial_timeout,
		idle_timeout: cfg.idle_timeout,
		header_timeout: cfg.header_timeout,
	});
	let proxy_task = tokio::spawn(proxy::serve(
		proxy_listener,
		proxy_deps,
		shutdown.clone(),
		cfg.shutdown_timeout,
	));

	let admin_state = Arc::new(admin::AdminState {
		engine: engine.clone(),
		registry: registry.clone(),
		store,
		approvals,
	});
	let admin_listener = TcpListener::bind(&cfg.admin_listen_addr).await?;
	info!(addr = %cfg.admin_listen_addr, "admin API listening");
	let admin_shutdown = shutdown.clone();
	let admin_task = tokio::spawn(async move {
		axum::serve(admin_listener, admin::router(admin_state))
			.with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
			.await
	});

	let reloader = SignalReloader::new(engine, None);
	let reload_task = tokio::spawn(reloader.run(shutdown.clone()));

	wait_for_shutdown_signal().await;
	info!("shutdown signal received, draining");
	shutdown.cancel();

	let _ = proxy_task.await;
	let _ = admin_task.await;
	let _ = reload_task.await;
	Ok(())
}

/// Waits for either SIGINT or SIGTERM (spec.md §6 "Signals").
async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut sig) => {
				sig.recv().await;
			},
			Err(e) => warn!("failed to install SIGTERM handler: {e}"),
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

/// Thin HTTP client over the loopback admin API (SPEC_FULL.md §4(new)K):
/// the out-of-scope host CLI would talk to the same endpoints this binary
/// exposes under `guardian::admin`, so `token` subcommands reuse them
/// rather than touching the token store directly.
async fn token_cli(cfg: GuardianConfig, action: TokenAction) -> anyhow::Result<()> {
	let client = reqwest::Client::new();
	let base = format!("http://{}", cfg.admin_listen_addr);

	match action {
		TokenAction::Register {
			cloister,
			project,
			workspace,
		} => {
			let resp: serde_json::Value = client
				.post(format!("{base}/tokens"))
				.json(&serde_json::json!({ "cloister": cloister, "project": project, "workspace": workspace }))
				.send()
				.await?
				.error_for_status()?
				.json()
				.await?;
			println!("{}", resp["token"].as_str().unwrap_or_default());
		},
		TokenAction::Revoke { cloister } => {
			client
				.delete(format!("{base}/tokens/{cloister}"))
				.send()
				.await?
				.error_for_status()?;
			println!("revoked {cloister}");
		},
		TokenAction::List => {
			let resp: serde_json::Value = client
				.get(format!("{base}/tokens"))
				.send()
				.await?
				.error_for_status()?
				.json()
				.await?;
			println!("{}", serde_json::to_string_pretty(&resp)?);
		},
	}
	Ok(())
}
