pub mod frontend;
pub mod inspect;
pub mod mitm;

use std::sync::Arc;
use std::time::Duration;

use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

use crate::http::{Body, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, header};
use crate::proxy::inspect::{Inspector, RequestContext};
use crate::telemetry::trace::RequestTrace;

pub const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("blocked by policy: {0}")]
	Blocked(String),
	#[error("request body too large")]
	BodyTooLarge,
	#[error("invalid request")]
	InvalidRequest,
	#[error("upstream dial failed: {0}")]
	Dial(String),
	#[error("upstream request failed: {0}")]
	Upstream(String),
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::Blocked(_) => StatusCode::FORBIDDEN,
			ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,
			ProxyError::Dial(_) | ProxyError::Upstream(_) | ProxyError::Internal(_) => {
				StatusCode::BAD_GATEWAY
			},
		}
	}

	pub fn into_response(self) -> Response {
		::http::Response::builder()
			.status(self.status())
			.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
			.body(Body::from(self.to_string()))
			.expect("static response should build")
	}
}

pub type HttpClient =
	hyper_util::client::legacy::Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

pub fn build_client() -> anyhow::Result<HttpClient> {
	let mut http = HttpConnector::new();
	http.enforce_http(false);
	http.set_connect_timeout(Some(UPSTREAM_DIAL_TIMEOUT));
	let https = hyper_rustls::HttpsConnectorBuilder::new()
		.with_native_roots()?
		.https_or_http()
		.enable_http1()
		.wrap_connector(http);
	Ok(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https))
}

/// Client with an explicit TLS config, for callers that pin their own roots.
pub fn build_client_with_tls(tls: rustls::ClientConfig) -> HttpClient {
	let mut http = HttpConnector::new();
	http.enforce_http(false);
	http.set_connect_timeout(Some(UPSTREAM_DIAL_TIMEOUT));
	let https = hyper_rustls::HttpsConnectorBuilder::new()
		.with_tls_config(tls)
		.https_or_http()
		.enable_http1()
		.wrap_connector(http);
	hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https)
}

fn hop_by_hop() -> [HeaderName; 8] {
	[
		header::CONNECTION,
		HeaderName::from_static("keep-alive"),
		header::PROXY_AUTHENTICATE,
		header::PROXY_AUTHORIZATION,
		HeaderName::from_static("proxy-connection"),
		header::TE,
		header::TRAILER,
		header::UPGRADE,
	]
}

/// Remove hop-by-hop headers, including any token named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	let named: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|t| HeaderName::try_from(t.trim()).ok())
		.collect();
	for name in named {
		headers.remove(&name);
	}
	for name in hop_by_hop() {
		headers.remove(&name);
	}
	// Let the upstream answer in identity encoding; the proxy must be able
	// to read (and the client to reuse) every byte that passes through.
	headers.remove(header::ACCEPT_ENCODING);
}

/// Fill in browser-plausible defaults for headers the client did not send.
pub fn apply_client_defaults(headers: &mut HeaderMap, host: &str) {
	let defaults: &[(HeaderName, HeaderValue)] = &[
		(
			header::USER_AGENT,
			HeaderValue::from_static(
				"Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
			),
		),
		(header::ACCEPT, HeaderValue::from_static("application/json, text/plain, */*")),
		(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9")),
		(HeaderName::from_static("sec-fetch-dest"), HeaderValue::from_static("empty")),
		(HeaderName::from_static("sec-fetch-mode"), HeaderValue::from_static("cors")),
		(HeaderName::from_static("sec-fetch-site"), HeaderValue::from_static("same-origin")),
	];
	for (name, value) in defaults {
		if !headers.contains_key(name) {
			headers.insert(name.clone(), value.clone());
		}
	}
	if !headers.contains_key(header::REFERER)
		&& let Ok(referer) = HeaderValue::try_from(format!("https://{host}/"))
	{
		headers.insert(header::REFERER, referer);
	}
}

/// The shared request path once a request is addressed at its upstream:
/// header hygiene, request inspection, the upstream round trip, streaming
/// detection and response inspection.
pub(crate) async fn round_trip(
	client: &HttpClient,
	inspector: &Arc<dyn Inspector>,
	mut req: Request,
	ctx: &mut RequestContext,
	trace: &RequestTrace,
) -> Result<Response, ProxyError> {
	let host = req.uri().host().unwrap_or_default().to_string();
	strip_hop_by_hop(req.headers_mut());
	apply_client_defaults(req.headers_mut(), &host);

	trace.sanitize_start();
	let req = inspector.inspect_request(req, ctx).await?;
	trace.sanitize_end();

	trace.upstream_start();
	let resp = client
		.request(req)
		.await
		.map_err(|e| match e.is_connect() {
			true => ProxyError::Dial(e.to_string()),
			false => ProxyError::Upstream(e.to_string()),
		})?;
	trace.first_byte();

	let (parts, body) = resp.into_parts();
	let mut resp = Response::from_parts(parts, Body::new(body));
	let streaming = matches!(
		crate::http::classify_content_type(resp.headers()),
		crate::http::WellKnownContentTypes::Sse
	);
	ctx.streaming = streaming;
	trace.set_streaming(streaming);

	resp = inspector.inspect_response(resp, ctx).await;
	trace.upstream_end();
	Ok(resp)
}
