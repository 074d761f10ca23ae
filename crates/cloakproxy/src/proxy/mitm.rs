//! TLS interception for a CONNECT tunnel: terminate the client's TLS with a
//! locally-minted leaf, serve HTTP/1.1 on the spliced connection, and
//! round-trip each request to the real upstream through the inspector.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::http::{Body, DropBody, Request, Response};
use crate::policy::provider_family;
use crate::proxy::inspect::{Inspector, RequestContext};
use crate::proxy::{HttpClient, ProxyError, round_trip};
use crate::telemetry::audit::{AuditEntry, AuditSink};
use crate::telemetry::trace::{RequestTrace, SealOnDrop};
use crate::management::admin::Stats;
use crate::tls::ca::CaStore;

pub struct MitmHandler {
	ca: Arc<CaStore>,
	inspector: Arc<dyn Inspector>,
	client: HttpClient,
	audit: Arc<AuditSink>,
	stats: Arc<Stats>,
}

impl MitmHandler {
	pub fn new(
		ca: Arc<CaStore>,
		inspector: Arc<dyn Inspector>,
		client: HttpClient,
		audit: Arc<AuditSink>,
		stats: Arc<Stats>,
	) -> MitmHandler {
		MitmHandler {
			ca,
			inspector,
			client,
			audit,
			stats,
		}
	}

	/// Serve one hijacked CONNECT stream. The HTTP server runs on this single
	/// connection until the client closes it, so keep-alive requests are
	/// served sequentially without ever accepting a second socket.
	pub async fn serve(
		self: Arc<Self>,
		upgraded: hyper::upgrade::Upgraded,
		host: String,
		port: u16,
		rule_id: String,
	) -> anyhow::Result<()> {
		let config = self.ca.leaf(&host)?;
		let tls = TlsAcceptor::from(config)
			.accept(TokioIo::new(upgraded))
			.await?;
		Stats::incr(&self.stats.mitm_connections);
		debug!(%host, "TLS established on intercepted connection");

		let authority = if port == 443 {
			host
		} else {
			format!("{host}:{port}")
		};
		let authority = Arc::<str>::from(authority);
		let rule_id = Arc::<str>::from(rule_id);
		let this = self.clone();
		let service = service_fn(move |req: ::http::Request<Incoming>| {
			let this = this.clone();
			let authority = authority.clone();
			let rule_id = rule_id.clone();
			async move { Ok::<_, Infallible>(this.handle(req, &authority, &rule_id).await) }
		});

		hyper::server::conn::http1::Builder::new()
			.serve_connection(TokioIo::new(tls), service)
			.await?;
		Ok(())
	}

	async fn handle(
		&self,
		req: ::http::Request<Incoming>,
		authority: &str,
		rule_id: &str,
	) -> Response {
		Stats::incr(&self.stats.requests);
		let host = crate::http::strip_port(authority).to_string();
		let method = req.method().to_string();
		let path = req
			.uri()
			.path_and_query()
			.map(|pq| pq.to_string())
			.unwrap_or_else(|| "/".to_string());
		let trace = RequestTrace::start(&method, &host);
		let mut ctx = RequestContext::new();

		let result = self
			.handle_inner(req, authority, &path, &mut ctx, &trace)
			.await;
		let resp = match result {
			Ok(resp) => resp,
			Err(e) => {
				warn!(%host, error = %e, "intercepted request failed");
				e.into_response()
			},
		};

		if ctx.sanitized {
			Stats::incr(&self.stats.sanitized_requests);
		}
		self.audit.log(&AuditEntry {
			time: AuditEntry::now(),
			method,
			host: host.clone(),
			path,
			decision: "mitm".to_string(),
			rule_id: rule_id.to_string(),
			status: resp.status().as_u16(),
			sanitize_ms: trace.sanitize_ms(),
			upstream_ms: trace.upstream_ms(),
			total_ms: trace.total_ms(),
			sanitized: ctx.sanitized,
			items: ctx.items.clone(),
		});
		debug!(
			%host,
			provider = provider_family(&host),
			status = resp.status().as_u16(),
			"intercepted request complete"
		);

		// Seal the trace when the client finishes reading the body.
		trace.response_start();
		let (parts, body) = resp.into_parts();
		Response::from_parts(parts, Body::new(DropBody::new(body, SealOnDrop(trace))))
	}

	async fn handle_inner(
		&self,
		req: ::http::Request<Incoming>,
		authority: &str,
		path: &str,
		ctx: &mut RequestContext,
		trace: &RequestTrace,
	) -> Result<Response, ProxyError> {
		let (mut parts, body) = req.into_parts();
		parts.uri = format!("https://{authority}{path}")
			.parse()
			.map_err(|_| ProxyError::InvalidRequest)?;
		let req: Request = Request::from_parts(parts, Body::new(body));
		round_trip(&self.client, &self.inspector, req, ctx, trace).await
	}
}
