//! The listening side: accepts proxy clients, answers CONNECT with either a
//! blind tunnel or a TLS-intercepting hand-off, and reverse-proxies plain
//! HTTP requests through the inspector.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::http::{Body, DropBody, Method, Request, Response, StatusCode, strip_port};
use crate::management::admin::Stats;
use crate::policy::{Decision, PolicyEngine, Verdict};
use crate::proxy::inspect::{Inspector, RequestContext};
use crate::proxy::mitm::MitmHandler;
use crate::proxy::{
	HttpClient, ProxyError, READ_HEADER_TIMEOUT, UPSTREAM_DIAL_TIMEOUT, round_trip,
};
use crate::telemetry::audit::{AuditEntry, AuditSink};
use crate::telemetry::trace::{RequestTrace, SealOnDrop};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProxyInputs {
	pub policy: PolicyEngine,
	pub inspector: Arc<dyn Inspector>,
	pub mitm: Option<Arc<MitmHandler>>,
	/// Suffix-matched; empty means every mitm-decided host is intercepted.
	pub mitm_domains: Vec<String>,
	pub audit: Arc<AuditSink>,
	pub stats: Arc<Stats>,
	pub client: HttpClient,
}

pub struct Proxy {
	inputs: Arc<ProxyInputs>,
}

impl Proxy {
	pub fn new(inputs: ProxyInputs) -> Proxy {
		Proxy {
			inputs: Arc::new(inputs),
		}
	}

	/// Accept loop: one task per connection, cooperative shutdown with a
	/// bounded drain.
	pub async fn run(
		&self,
		listener: TcpListener,
		mut shutdown: watch::Receiver<bool>,
	) -> anyhow::Result<()> {
		info!(addr = %listener.local_addr()?, "proxy listening");
		let active = Arc::new(AtomicUsize::new(0));

		loop {
			tokio::select! {
				accepted = listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(ok) => ok,
						Err(e) => {
							warn!(error = %e, "accept failed");
							continue;
						},
					};
					debug!(%peer, "accepted connection");
					let inputs = self.inputs.clone();
					let active = active.clone();
					active.fetch_add(1, Ordering::SeqCst);
					tokio::spawn(async move {
						serve_connection(inputs, stream).await;
						active.fetch_sub(1, Ordering::SeqCst);
					});
				},
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						break;
					}
				},
			}
		}

		info!("draining in-flight connections");
		let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
		while active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		Ok(())
	}
}

async fn serve_connection(inputs: Arc<ProxyInputs>, stream: TcpStream) {
	let service = service_fn(move |req| handle(inputs.clone(), req));
	let conn = hyper::server::conn::http1::Builder::new()
		.timer(TokioTimer::new())
		.header_read_timeout(READ_HEADER_TIMEOUT)
		.serve_connection(TokioIo::new(stream), service)
		.with_upgrades();
	if let Err(e) = conn.await {
		debug!(error = %e, "connection closed with error");
	}
}

async fn handle(
	inputs: Arc<ProxyInputs>,
	req: ::http::Request<Incoming>,
) -> Result<Response, Infallible> {
	if req.method() == Method::CONNECT {
		return Ok(handle_connect(inputs, req).await);
	}
	if req.uri().authority().is_none() {
		// Not a proxied request: only the health probe lives here.
		if req.uri().path() == "/health" {
			return Ok(plain(StatusCode::OK, "OK"));
		}
		return Ok(plain(StatusCode::BAD_REQUEST, "proxy request expected"));
	}
	Ok(handle_plain(inputs, req).await)
}

/// CONNECT: policy decides between 403, a blind byte splice, and the
/// TLS-intercepting handler. The enclosing CONNECT is audited here; the MITM
/// handler audits the tunnelled requests it serves.
async fn handle_connect(inputs: Arc<ProxyInputs>, req: ::http::Request<Incoming>) -> Response {
	let trace_start = std::time::Instant::now();
	let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
		return plain(StatusCode::BAD_REQUEST, "CONNECT target missing");
	};
	let host = strip_port(&authority).to_string();
	let port = authority
		.rsplit_once(':')
		.and_then(|(_, p)| p.parse::<u16>().ok())
		.unwrap_or(443);
	let target = format!("{host}:{port}");

	let verdict = inputs.policy.evaluate(&host);
	let audit_connect = |status: StatusCode, verdict: &Verdict| {
		inputs.audit.log(&AuditEntry {
			time: AuditEntry::now(),
			method: "CONNECT".to_string(),
			host: host.clone(),
			path: String::new(),
			decision: verdict.decision.as_str().to_string(),
			rule_id: verdict.rule_id.clone(),
			status: status.as_u16(),
			sanitize_ms: 0,
			upstream_ms: 0,
			total_ms: trace_start.elapsed().as_millis() as u64,
			sanitized: false,
			items: Vec::new(),
		});
	};

	if verdict.decision == Decision::Block {
		Stats::incr(&inputs.stats.blocked);
		info!(%host, rule = %verdict.rule_id, "blocked CONNECT");
		audit_connect(StatusCode::FORBIDDEN, &verdict);
		return plain(
			StatusCode::FORBIDDEN,
			&format!("cloakproxy: connection to {host} blocked ({})", verdict.reason),
		);
	}

	let use_mitm = verdict.decision == Decision::Mitm
		&& inputs.mitm.is_some()
		&& domain_matches(&host, &inputs.mitm_domains);

	if use_mitm {
		let mitm = inputs.mitm.clone().expect("checked above");
		let rule_id = verdict.rule_id.clone();
		let mitm_host = host.clone();
		tokio::spawn(async move {
			match hyper::upgrade::on(req).await {
				Ok(upgraded) => {
					if let Err(e) = mitm.serve(upgraded, mitm_host.clone(), port, rule_id).await {
						debug!(host = %mitm_host, error = %e, "mitm session ended with error");
					}
				},
				Err(e) => warn!(error = %e, "CONNECT upgrade failed"),
			}
		});
		audit_connect(StatusCode::OK, &verdict);
		return connect_established();
	}

	// Blind tunnel: dial first so dial errors still reach the client.
	let upstream =
		match tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
			Ok(Ok(stream)) => stream,
			Ok(Err(e)) => {
				audit_connect(StatusCode::BAD_GATEWAY, &verdict);
				return ProxyError::Dial(e.to_string()).into_response();
			},
			Err(_) => {
				audit_connect(StatusCode::BAD_GATEWAY, &verdict);
				return ProxyError::Dial(format!("timed out connecting to {target}")).into_response();
			},
		};
	Stats::incr(&inputs.stats.tunneled_connections);
	let tunnel_host = host.clone();
	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => {
				let mut upgraded = TokioIo::new(upgraded);
				let mut upstream = upstream;
				if let Err(e) =
					tokio::io::copy_bidirectional(&mut upgraded, &mut upstream).await
				{
					debug!(host = %tunnel_host, error = %e, "tunnel closed with error");
				}
			},
			Err(e) => warn!(error = %e, "CONNECT upgrade failed"),
		}
	});
	audit_connect(StatusCode::OK, &verdict);
	connect_established()
}

/// Plain (absolute-form) HTTP proxying with inspection.
async fn handle_plain(inputs: Arc<ProxyInputs>, req: ::http::Request<Incoming>) -> Response {
	Stats::incr(&inputs.stats.requests);
	let host = req.uri().host().unwrap_or_default().to_string();
	let method = req.method().to_string();
	let path = req.uri().path().to_string();

	let verdict = inputs.policy.evaluate(&host);
	let trace = RequestTrace::start(&method, &host);
	let mut ctx = RequestContext::new();

	let resp = if verdict.decision == Decision::Block {
		Stats::incr(&inputs.stats.blocked);
		ProxyError::Blocked(verdict.reason.clone()).into_response()
	} else {
		let (parts, body) = req.into_parts();
		let req: Request = Request::from_parts(parts, Body::new(body));
		match round_trip(&inputs.client, &inputs.inspector, req, &mut ctx, &trace).await {
			Ok(resp) => resp,
			Err(e) => {
				warn!(%host, error = %e, "proxied request failed");
				e.into_response()
			},
		}
	};

	if ctx.sanitized {
		Stats::incr(&inputs.stats.sanitized_requests);
	}
	inputs.audit.log(&AuditEntry {
		time: AuditEntry::now(),
		method,
		host,
		path,
		decision: verdict.decision.as_str().to_string(),
		rule_id: verdict.rule_id,
		status: resp.status().as_u16(),
		sanitize_ms: trace.sanitize_ms(),
		upstream_ms: trace.upstream_ms(),
		total_ms: trace.total_ms(),
		sanitized: ctx.sanitized,
		items: ctx.items.clone(),
	});

	trace.response_start();
	let (parts, body) = resp.into_parts();
	Response::from_parts(parts, Body::new(DropBody::new(body, SealOnDrop(trace))))
}

fn domain_matches(host: &str, domains: &[String]) -> bool {
	if domains.is_empty() {
		return true;
	}
	domains.iter().any(|d| host.ends_with(d.as_str()))
}

fn plain(status: StatusCode, body: &str) -> Response {
	::http::Response::builder()
		.status(status)
		.header(crate::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(body.to_string()))
		.expect("static response should build")
}

fn connect_established() -> Response {
	let mut resp = ::http::Response::builder()
		.status(StatusCode::OK)
		.body(Body::empty())
		.expect("static response should build");
	resp
		.extensions_mut()
		.insert(hyper::ext::ReasonPhrase::from_static(
			b"Connection Established",
		));
	resp
}
