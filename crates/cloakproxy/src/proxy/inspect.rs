//! The seam between the proxy and the sanitizer pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::http::{
	Body, DEFAULT_BODY_LIMIT, DropBody, Method, Request, Response, WellKnownContentTypes,
	classify_content_type, content_length, header, is_text_like, read_body_with_limit,
};
use crate::proxy::ProxyError;
use crate::sanitize::session::SessionStore;
use crate::sanitize::stream::{RestoreBody, Restorer};
use crate::sanitize::{Engine, SanitizedItem, mapping};
use crate::telemetry::audit::AuditItem;

/// Mutable per-request state threaded between the two inspection points and
/// the surrounding handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
	pub session_id: String,
	pub sanitized: bool,
	pub items: Vec<AuditItem>,
	/// Oversize or unknown-length request: body goes through untouched and
	/// the response is never rewritten.
	pub skip_restore: bool,
	pub streaming: bool,
}

impl RequestContext {
	pub fn new() -> RequestContext {
		RequestContext {
			session_id: SessionStore::new_id(),
			sanitized: false,
			items: Vec::new(),
			skip_restore: false,
			streaming: false,
		}
	}
}

impl Default for RequestContext {
	fn default() -> Self {
		RequestContext::new()
	}
}

#[async_trait]
pub trait Inspector: Send + Sync {
	async fn inspect_request(
		&self,
		req: Request,
		ctx: &mut RequestContext,
	) -> Result<Request, ProxyError>;

	async fn inspect_response(&self, resp: Response, ctx: &RequestContext) -> Response;
}

/// Forwards everything untouched.
pub struct Passthrough;

#[async_trait]
impl Inspector for Passthrough {
	async fn inspect_request(
		&self,
		req: Request,
		_ctx: &mut RequestContext,
	) -> Result<Request, ProxyError> {
		Ok(req)
	}

	async fn inspect_response(&self, resp: Response, _ctx: &RequestContext) -> Response {
		resp
	}
}

/// Masks request bodies and restores response bodies through the session
/// store it was constructed with.
pub struct SanitizingInspector {
	engine: Engine,
	sessions: SessionStore,
	restore_responses: bool,
	max_body: usize,
}

impl SanitizingInspector {
	pub fn new(engine: Engine, sessions: SessionStore, restore_responses: bool) -> Self {
		SanitizingInspector {
			engine,
			sessions,
			restore_responses,
			max_body: DEFAULT_BODY_LIMIT,
		}
	}

	#[cfg(test)]
	pub fn with_max_body(mut self, max_body: usize) -> Self {
		self.max_body = max_body;
		self
	}

	fn finish_request(
		&self,
		ctx: &mut RequestContext,
		parts: ::http::request::Parts,
		items: Vec<SanitizedItem>,
		body: String,
	) -> Request {
		let mut parts = parts;
		self.sessions.set(&ctx.session_id, &mapping(&items));
		ctx.sanitized = true;
		ctx.items = items
			.iter()
			.map(|i| AuditItem {
				kind: i.kind.clone(),
				placeholder: i.placeholder.clone(),
			})
			.collect();
		set_content_length(&mut parts.headers, body.len());
		Request::from_parts(parts, Body::from(body))
	}
}

fn set_content_length(headers: &mut crate::http::HeaderMap, len: usize) {
	headers.insert(header::CONTENT_LENGTH, len.into());
	headers.remove(header::TRANSFER_ENCODING);
}

#[async_trait]
impl Inspector for SanitizingInspector {
	async fn inspect_request(
		&self,
		req: Request,
		ctx: &mut RequestContext,
	) -> Result<Request, ProxyError> {
		if req.method() != Method::POST {
			return Ok(req);
		}
		let len = content_length(req.headers());
		if len < 0 || len > self.max_body as i64 {
			// Oversize or unknown length: forward byte-identical, skip the
			// response rewrite too.
			ctx.skip_restore = true;
			return Ok(req);
		}
		if len == 0 {
			return Ok(req);
		}
		if !matches!(
			classify_content_type(req.headers()),
			WellKnownContentTypes::Json
		) {
			return Ok(req);
		}

		let (parts, body) = req.into_parts();
		let bytes = read_body_with_limit(body, self.max_body)
			.await
			.map_err(|_| ProxyError::InvalidRequest)?;
		let Ok(text) = std::str::from_utf8(&bytes) else {
			// Not text after all; forward as-is.
			return Ok(Request::from_parts(parts, Body::from(bytes)));
		};

		let (masked, items) = self.engine.sanitize_body(text).await;
		if items.is_empty() {
			return Ok(Request::from_parts(parts, Body::from(bytes)));
		}
		debug!(
			session = %ctx.session_id,
			items = items.len(),
			"sanitized request body"
		);
		Ok(self.finish_request(ctx, parts, items, masked))
	}

	async fn inspect_response(&self, resp: Response, ctx: &RequestContext) -> Response {
		if !self.restore_responses || ctx.skip_restore {
			self.sessions.delete(&ctx.session_id);
			return resp;
		}
		let Some(session) = self.sessions.get(&ctx.session_id) else {
			return resp;
		};
		if session.replacements.is_empty() {
			self.sessions.delete(&ctx.session_id);
			return resp;
		}

		if ctx.streaming {
			// Restore inside the stream; headers and status pass verbatim.
			// The session is released when the client stops reading.
			let sessions = self.sessions.clone();
			let session_id = ctx.session_id.clone();
			let (parts, body) = resp.into_parts();
			let restored = RestoreBody::new(body, Restorer::new(&session.replacements));
			let guard = ReleaseSession {
				sessions,
				session_id,
			};
			return Response::from_parts(parts, Body::new(DropBody::new(restored, guard)));
		}

		// Buffered path: the session is done after this exchange either way.
		self.sessions.delete(&ctx.session_id);

		let len = content_length(resp.headers());
		if !is_text_like(resp.headers()) || len > self.max_body as i64 {
			return resp;
		}
		let (mut parts, body) = resp.into_parts();
		let bytes = match read_body_with_limit(body, self.max_body).await {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(error = %e, "failed to buffer response body; returning error body");
				return ProxyError::Upstream(e.to_string()).into_response();
			},
		};

		let mut restorer = Restorer::new(&session.replacements);
		let mut out = restorer.push(&bytes);
		out.extend(restorer.finish());
		set_content_length(&mut parts.headers, out.len());
		Response::from_parts(parts, Body::from(Bytes::from(out)))
	}
}

struct ReleaseSession {
	sessions: SessionStore,
	session_id: String,
}

impl Drop for ReleaseSession {
	fn drop(&mut self) {
		self.sessions.delete(&self.session_id);
	}
}
