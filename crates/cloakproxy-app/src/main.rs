use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cloakproxy::config::Config;
use cloakproxy::detect::hybrid::{HybridConfig, HybridDetector};
use cloakproxy::detect::ner::NerSession;
use cloakproxy::management::admin::{self, Stats};
use cloakproxy::policy::PolicyEngine;
use cloakproxy::proxy::frontend::{Proxy, ProxyInputs};
use cloakproxy::proxy::inspect::{Inspector, Passthrough, SanitizingInspector};
use cloakproxy::proxy::mitm::MitmHandler;
use cloakproxy::proxy::build_client;
use cloakproxy::sanitize::Engine;
use cloakproxy::sanitize::session::SessionStore;
use cloakproxy::telemetry::audit::AuditSink;
use cloakproxy::tls::ca::CaStore;

#[derive(Parser)]
#[command(
	name = "cloakproxy",
	about = "Local forward proxy that redacts sensitive values from LLM API traffic",
	version
)]
struct Args {
	/// Config file (YAML or JSON). Defaults to ~/.cloakproxy/config.yaml.
	#[arg(long, short)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
	/// Run the proxy in the foreground.
	Daemon,
	/// Check whether a proxy is answering on the configured port.
	Status,
	/// Print the tail of the audit log.
	Logs {
		/// Number of entries to show.
		#[arg(short = 'n', long, default_value_t = 20)]
		lines: usize,
	},
	/// Root CA management.
	Ca {
		#[command(subcommand)]
		command: CaCommand,
	},
}

#[derive(Subcommand)]
enum CaCommand {
	/// Generate the root CA if it does not exist yet.
	Init,
	/// Show where the root certificate lives and how to trust it.
	Print,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	let config_path = args.config.clone().unwrap_or_else(Config::default_path);
	let config = Config::load(&config_path)?;

	match args.command.unwrap_or(Command::Daemon) {
		Command::Daemon => run(config).await,
		Command::Status => status(config).await,
		Command::Logs { lines } => logs(config, lines),
		Command::Ca { command } => ca(config, command),
	}
}

async fn status(config: Config) -> anyhow::Result<()> {
	let client = build_client()?;
	let uri: cloakproxy::http::Uri = format!("http://127.0.0.1:{}/health", config.port).parse()?;
	let resp = tokio::time::timeout(std::time::Duration::from_secs(2), client.get(uri)).await;
	match resp {
		Ok(Ok(resp)) if resp.status().is_success() => {
			println!("running on port {}", config.port);
			Ok(())
		},
		Ok(Ok(resp)) => anyhow::bail!("unexpected health response: {}", resp.status()),
		Ok(Err(e)) => anyhow::bail!("not running on port {}: {e}", config.port),
		Err(_) => anyhow::bail!("not running on port {}: health check timed out", config.port),
	}
}

fn logs(config: Config, lines: usize) -> anyhow::Result<()> {
	let path = config.log_file();
	let raw = std::fs::read_to_string(&path)
		.with_context(|| format!("no audit log at {}", path.display()))?;
	let all: Vec<&str> = raw.lines().collect();
	for line in all.iter().skip(all.len().saturating_sub(lines)) {
		println!("{line}");
	}
	Ok(())
}

fn ca(config: Config, command: CaCommand) -> anyhow::Result<()> {
	let store = CaStore::new(config.ca_dir());
	match command {
		CaCommand::Init => {
			store.ensure_root()?;
			println!("root CA ready: {}", store.cert_path().display());
		},
		CaCommand::Print => {
			store.ensure_root()?;
			println!("certificate: {}", store.cert_path().display());
			println!("private key: {}", store.key_path().display());
			println!();
			println!("To intercept TLS the certificate must be trusted by the client.");
			println!("macOS:  security add-trusted-cert -d -k ~/Library/Keychains/login.keychain-db {}", store.cert_path().display());
			println!("Linux:  cp {} /usr/local/share/ca-certificates/cloakproxy.crt && update-ca-certificates", store.cert_path().display());
			println!("curl:   curl --cacert {} …", store.cert_path().display());
		},
	}
	Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
	let stats = Arc::new(Stats::default());
	let audit = Arc::new(AuditSink::new(config.log_file()));
	let sessions = SessionStore::new();
	let client = build_client()?;

	let ner_cfg = &config.sanitizer.detectors.onnx_ner;
	let ner = if ner_cfg.enabled {
		let session = NerSession::discover(&config.model_dir())
			.context("failed to load NER model")?;
		if session.is_none() {
			warn!(dir = %config.model_dir().display(), "NER enabled but model files missing");
		}
		session
	} else {
		None
	};
	let detector = Arc::new(HybridDetector::standard(
		ner,
		HybridConfig {
			ner_enabled: ner_cfg.enabled,
			max_bytes: ner_cfg.max_bytes,
			timeout: ner_cfg.timeout(),
			min_score: ner_cfg.min_score,
		},
	));

	let inspector: Arc<dyn Inspector> = if config.sanitizer.enabled {
		Arc::new(SanitizingInspector::new(
			Engine::new(detector, &config.sanitizer),
			sessions.clone(),
			config.sanitizer.restore_responses,
		))
	} else {
		Arc::new(Passthrough)
	};

	let mitm = if config.mitm.enabled {
		// A broken CA is a startup error; MITM must not come up half-working.
		let ca = Arc::new(CaStore::new(config.ca_dir()));
		ca.ensure_root().context("failed to initialize root CA")?;
		Some(Arc::new(MitmHandler::new(
			ca,
			inspector.clone(),
			client.clone(),
			audit.clone(),
			stats.clone(),
		)))
	} else {
		None
	};

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
	tokio::spawn({
		let shutdown_tx = shutdown_tx.clone();
		async move {
			wait_for_signal().await;
			info!("shutdown requested");
			let _ = shutdown_tx.send(true);
		}
	});

	{
		let stats = stats.clone();
		let mut rx = shutdown_rx.clone();
		let port = config.stats_port;
		tokio::spawn(async move {
			let shutdown = async move {
				let _ = rx.wait_for(|v| *v).await;
			};
			if let Err(e) = admin::serve(port, stats, shutdown).await {
				warn!(error = %e, "stats endpoint failed");
			}
		});
	}

	let listener =
		tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], config.port))).await?;
	let proxy = Proxy::new(ProxyInputs {
		policy: PolicyEngine::new(&config.rules),
		inspector,
		mitm,
		mitm_domains: config.mitm.domains.clone(),
		audit,
		stats,
		client,
	});
	proxy.run(listener, shutdown_rx).await
}

async fn wait_for_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		let mut term = match signal(SignalKind::terminate()) {
			Ok(term) => term,
			Err(_) => {
				let _ = tokio::signal::ctrl_c().await;
				return;
			},
		};
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {},
			_ = term.recv() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}
