//! Loopback admin surface: read-only process counters.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Default)]
pub struct Stats {
	pub requests: AtomicU64,
	pub sanitized_requests: AtomicU64,
	pub blocked: AtomicU64,
	pub mitm_connections: AtomicU64,
	pub tunneled_connections: AtomicU64,
}

impl Stats {
	pub fn incr(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}
}

#[derive(Debug, Serialize)]
struct StatsSnapshot {
	requests: u64,
	sanitized_requests: u64,
	blocked: u64,
	mitm_connections: u64,
	tunneled_connections: u64,
}

async fn stats_handler(State(stats): State<Arc<Stats>>) -> axum::Json<StatsSnapshot> {
	axum::Json(StatsSnapshot {
		requests: stats.requests.load(Ordering::Relaxed),
		sanitized_requests: stats.sanitized_requests.load(Ordering::Relaxed),
		blocked: stats.blocked.load(Ordering::Relaxed),
		mitm_connections: stats.mitm_connections.load(Ordering::Relaxed),
		tunneled_connections: stats.tunneled_connections.load(Ordering::Relaxed),
	})
}

pub fn router(stats: Arc<Stats>) -> Router {
	Router::new()
		.route("/api/stats", get(stats_handler))
		.with_state(stats)
}

/// Serve the stats endpoint on a loopback port until `shutdown` resolves.
pub async fn serve(
	port: u16,
	stats: Arc<Stats>,
	shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
	let addr = SocketAddr::from(([127, 0, 0, 1], port));
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(%addr, "stats endpoint listening");
	axum::serve(listener, router(stats))
		.with_graceful_shutdown(shutdown)
		.await?;
	Ok(())
}
