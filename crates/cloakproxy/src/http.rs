use std::fmt::Debug;
use std::pin::Pin;
use std::task::{Context, Poll};

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};
use bytes::Bytes;
use http_body::{Frame, SizeHint};

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

/// Default cap for bodies the inspector is willing to buffer.
pub const DEFAULT_BODY_LIMIT: usize = 1_048_576;

pub async fn read_body_with_limit(body: Body, limit: usize) -> Result<Bytes, Error> {
	axum::body::to_bytes(body, limit).await
}

#[derive(Debug, PartialEq, Eq)]
pub enum WellKnownContentTypes {
	Json,
	Sse,
	Unknown,
}

pub fn classify_content_type(h: &HeaderMap) -> WellKnownContentTypes {
	let Some(ct) = content_type(h) else {
		return WellKnownContentTypes::Unknown;
	};
	if ct.contains("text/event-stream") {
		WellKnownContentTypes::Sse
	} else if ct.contains("json") {
		WellKnownContentTypes::Json
	} else {
		WellKnownContentTypes::Unknown
	}
}

pub fn content_type(h: &HeaderMap) -> Option<&str> {
	h.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

/// Whether a response body is worth buffering for placeholder restoration.
pub fn is_text_like(h: &HeaderMap) -> bool {
	match content_type(h) {
		// No content type: assume text; restoration is a no-op on binary anyway.
		None => true,
		Some(ct) => {
			ct.starts_with("text/")
				|| ct.contains("json")
				|| ct.contains("xml")
				|| ct.contains("x-www-form-urlencoded")
		},
	}
}

/// Parsed Content-Length, mirroring the -1 convention for "unknown".
pub fn content_length(h: &HeaderMap) -> i64 {
	h.get(header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<i64>().ok())
		.unwrap_or(-1)
}

// copied from private `http` method
pub fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split always has at least 1 item");

	if host_port.as_bytes().first() == Some(&b'[') {
		let i = host_port
			.find(']')
			.expect("parsing should validate brackets");
		&host_port[0..i + 1]
	} else {
		host_port
			.split(':')
			.next()
			.expect("split always has at least 1 item")
	}
}

pin_project_lite::pin_project! {
	/// DropBody is simply a Body wrapper that holds onto another item such that it is dropped when the body
	/// is complete.
	#[derive(Debug)]
	pub struct DropBody<B, D> {
		#[pin]
		body: B,
		dropper: D,
	}
}

impl<B, D> DropBody<B, D> {
	pub fn new(body: B, dropper: D) -> Self {
		Self { body, dropper }
	}
}

impl<B: http_body::Body + Debug + Unpin, D> http_body::Body for DropBody<B, D>
where
	B::Data: Debug,
{
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		this.body.poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}
