//! In-process upstream servers and a raw HTTP/1.1 test client.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use cloakproxy::config::SanitizerConfig;
use cloakproxy::detect::hybrid::{HybridConfig, HybridDetector};
use cloakproxy::http::Body;
use cloakproxy::management::admin::Stats;
use cloakproxy::policy::PolicyEngine;
use cloakproxy::proxy::build_client;
use cloakproxy::proxy::frontend::{Proxy, ProxyInputs};
use cloakproxy::proxy::inspect::{Inspector, SanitizingInspector};
use cloakproxy::sanitize::Engine;
use cloakproxy::sanitize::session::SessionStore;
use cloakproxy::telemetry::audit::AuditSink;

/// A recording echo server. POST bodies come back verbatim; requests carrying
/// `x-respond-sse: 1` get their body echoed as a two-chunk event stream split
/// down the middle.
pub struct Upstream {
	pub addr: SocketAddr,
	pub bodies: Arc<Mutex<Vec<String>>>,
}

async fn echo(
	req: http::Request<Incoming>,
	bodies: Arc<Mutex<Vec<String>>>,
) -> Result<http::Response<Body>, Infallible> {
	let sse = req.headers().contains_key("x-respond-sse");
	let body = req.into_body().collect().await.unwrap().to_bytes();
	bodies
		.lock()
		.unwrap()
		.push(String::from_utf8_lossy(&body).to_string());

	let resp = if sse {
		let mid = body.len() / 2;
		let frames = vec![
			Ok::<_, std::io::Error>(http_body::Frame::data(body.slice(..mid))),
			Ok(http_body::Frame::data(body.slice(mid..))),
		];
		http::Response::builder()
			.status(200)
			.header(http::header::CONTENT_TYPE, "text/event-stream")
			.body(Body::new(http_body_util::StreamBody::new(
				futures_util::stream::iter(frames),
			)))
			.unwrap()
	} else {
		http::Response::builder()
			.status(200)
			.header(http::header::CONTENT_TYPE, "application/json")
			.header(http::header::CONTENT_LENGTH, body.len())
			.body(Body::from(body))
			.unwrap()
	};
	Ok(resp)
}

pub async fn spawn_upstream() -> Upstream {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let bodies: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
	let recorded = bodies.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			let bodies = recorded.clone();
			tokio::spawn(async move {
				let service =
					service_fn(move |req| echo(req, bodies.clone()));
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	Upstream { addr, bodies }
}

/// TLS echo server whose leaf comes from its own CA; returns the CA root so
/// the proxy's upstream client can be pointed at it.
pub async fn spawn_tls_upstream(
	ca_dir: PathBuf,
) -> (Upstream, rustls_pki_types::CertificateDer<'static>) {
	use cloakproxy::tls::ca::CaStore;

	let ca = CaStore::new(ca_dir);
	let server_config = ca.leaf("127.0.0.1").unwrap();
	let root = ca.root_cert_der().unwrap();

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let bodies: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
	let recorded = bodies.clone();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			let acceptor = tokio_rustls::TlsAcceptor::from(server_config.clone());
			let bodies = recorded.clone();
			tokio::spawn(async move {
				let Ok(tls) = acceptor.accept(stream).await else {
					return;
				};
				let service =
					service_fn(move |req| echo(req, bodies.clone()));
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(tls), service)
					.await;
			});
		}
	});
	(Upstream { addr, bodies }, root)
}

pub fn sanitizing_inspector(sessions: SessionStore) -> Arc<dyn Inspector> {
	let detector = Arc::new(HybridDetector::standard(None, HybridConfig::default()));
	let engine = Engine::new(detector, &SanitizerConfig::default());
	Arc::new(SanitizingInspector::new(engine, sessions, true))
}

pub struct TestProxy {
	pub addr: SocketAddr,
	pub audit_path: PathBuf,
	shutdown: watch::Sender<bool>,
	_tmp: tempfile::TempDir,
}

impl TestProxy {
	pub fn stop(&self) {
		let _ = self.shutdown.send(true);
	}
}

/// Proxy with the sanitizing inspector, no MITM, and the given policy rules.
pub async fn spawn_proxy(rules: Vec<cloakproxy::config::RuleConfig>) -> TestProxy {
	let tmp = tempfile::tempdir().unwrap();
	let audit_path = tmp.path().join("audit.log");
	let inputs = ProxyInputs {
		policy: PolicyEngine::new(&rules),
		inspector: sanitizing_inspector(SessionStore::new()),
		mitm: None,
		mitm_domains: Vec::new(),
		audit: Arc::new(AuditSink::new(audit_path.clone())),
		stats: Arc::new(Stats::default()),
		client: build_client().unwrap(),
	};
	spawn_proxy_with(inputs, audit_path, tmp).await
}

pub async fn spawn_proxy_with(
	inputs: ProxyInputs,
	audit_path: PathBuf,
	tmp: tempfile::TempDir,
) -> TestProxy {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let (tx, rx) = watch::channel(false);
	let proxy = Proxy::new(inputs);
	tokio::spawn(async move {
		let _ = proxy.run(listener, rx).await;
	});
	TestProxy {
		addr,
		audit_path,
		shutdown: tx,
		_tmp: tmp,
	}
}

#[derive(Debug)]
pub struct RawResponse {
	pub status: u16,
	pub reason: String,
	pub headers: Vec<(String, String)>,
	pub body: Vec<u8>,
}

impl RawResponse {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn body_string(&self) -> String {
		String::from_utf8_lossy(&self.body).to_string()
	}
}

/// Read only the header section of a response. A successful CONNECT reply
/// has no body and the connection stays open, so nothing past the terminator
/// may be consumed.
pub async fn read_connect_response<S>(stream: &mut S) -> anyhow::Result<RawResponse>
where
	S: AsyncRead + Unpin,
{
	read_head(stream).await
}

/// Read one HTTP/1.1 response including its body (Content-Length, chunked,
/// or close-delimited).
pub async fn read_response<S>(stream: &mut S) -> anyhow::Result<RawResponse>
where
	S: AsyncRead + Unpin,
{
	let mut resp = read_head(stream).await?;
	if let Some(te) = resp.header("transfer-encoding")
		&& te.eq_ignore_ascii_case("chunked")
	{
		resp.body = read_chunked(stream).await?;
	} else if let Some(cl) = resp.header("content-length") {
		let len: usize = cl.parse()?;
		let mut body = vec![0u8; len];
		stream.read_exact(&mut body).await?;
		resp.body = body;
	} else {
		stream.read_to_end(&mut resp.body).await?;
	}
	Ok(resp)
}

async fn read_head<S>(stream: &mut S) -> anyhow::Result<RawResponse>
where
	S: AsyncRead + Unpin,
{
	let head = read_until_crlf_crlf(stream).await?;
	let head = String::from_utf8_lossy(&head).to_string();
	let mut lines = head.split("\r\n");
	let status_line = lines.next().unwrap_or_default();
	let mut status_parts = status_line.splitn(3, ' ');
	status_parts.next(); // HTTP/1.1
	let status: u16 = status_parts.next().unwrap_or("0").parse()?;
	let reason = status_parts.next().unwrap_or("").to_string();
	let headers: Vec<(String, String)> = lines
		.filter(|l| !l.is_empty())
		.filter_map(|l| {
			l.split_once(':')
				.map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
		})
		.collect();

	Ok(RawResponse {
		status,
		reason,
		headers,
		body: Vec::new(),
	})
}

async fn read_until_crlf_crlf<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<Vec<u8>> {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await?;
		anyhow::ensure!(n == 1, "connection closed before headers completed");
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n\r\n") {
			buf.truncate(buf.len() - 4);
			return Ok(buf);
		}
		anyhow::ensure!(buf.len() < 65536, "header section too large");
	}
}

async fn read_chunked<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<Vec<u8>> {
	let mut out = Vec::new();
	loop {
		let line = read_line(stream).await?;
		let size = usize::from_str_radix(line.trim(), 16)?;
		if size == 0 {
			// Trailing CRLF after the last chunk.
			let _ = read_line(stream).await;
			return Ok(out);
		}
		let mut chunk = vec![0u8; size];
		stream.read_exact(&mut chunk).await?;
		out.extend_from_slice(&chunk);
		let mut crlf = [0u8; 2];
		stream.read_exact(&mut crlf).await?;
	}
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> anyhow::Result<String> {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await?;
		anyhow::ensure!(n == 1, "connection closed mid-line");
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n") {
			buf.truncate(buf.len() - 2);
			return Ok(String::from_utf8_lossy(&buf).to_string());
		}
	}
}

/// POST a JSON body through the proxy (absolute-form) and return the parsed
/// response.
pub async fn proxy_post_json(
	proxy: SocketAddr,
	upstream: SocketAddr,
	path: &str,
	body: &str,
	extra_headers: &[(&str, &str)],
) -> anyhow::Result<RawResponse> {
	let mut stream = tokio::net::TcpStream::connect(proxy).await?;
	let mut req = format!(
		"POST http://{upstream}{path} HTTP/1.1\r\nHost: {upstream}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
		body.len()
	);
	for (k, v) in extra_headers {
		req.push_str(&format!("{k}: {v}\r\n"));
	}
	req.push_str("\r\n");
	stream.write_all(req.as_bytes()).await?;
	stream.write_all(body.as_bytes()).await?;
	read_response(&mut stream).await
}
