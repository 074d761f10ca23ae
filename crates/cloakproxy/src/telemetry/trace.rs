//! Per-request timing. A trace is sealed exactly once, either when the
//! handler completes or when the response body is finally dropped, whichever
//! the wiring dictates; sealing twice is harmless.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::RngExt;
use tracing::debug;

const SAMPLE_RATE: f64 = 0.1;

#[derive(Debug, Default)]
struct TraceInner {
	sanitize_start: Option<Instant>,
	sanitize_end: Option<Instant>,
	upstream_start: Option<Instant>,
	first_byte: Option<Instant>,
	upstream_end: Option<Instant>,
	response_start: Option<Instant>,
	response_end: Option<Instant>,
	streaming: bool,
	emitted: bool,
}

#[derive(Debug, Clone)]
pub struct RequestTrace {
	received: Instant,
	sampled: bool,
	method: Arc<str>,
	host: Arc<str>,
	inner: Arc<Mutex<TraceInner>>,
}

impl RequestTrace {
	pub fn start(method: &str, host: &str) -> RequestTrace {
		RequestTrace {
			received: Instant::now(),
			sampled: rand::rng().random_bool(SAMPLE_RATE),
			method: method.into(),
			host: host.into(),
			inner: Arc::new(Mutex::new(TraceInner::default())),
		}
	}

	pub fn sanitize_start(&self) {
		self.inner.lock().sanitize_start = Some(Instant::now());
	}

	pub fn sanitize_end(&self) {
		self.inner.lock().sanitize_end = Some(Instant::now());
	}

	pub fn upstream_start(&self) {
		self.inner.lock().upstream_start = Some(Instant::now());
	}

	pub fn first_byte(&self) {
		let mut inner = self.inner.lock();
		if inner.first_byte.is_none() {
			inner.first_byte = Some(Instant::now());
		}
	}

	pub fn upstream_end(&self) {
		self.inner.lock().upstream_end = Some(Instant::now());
	}

	pub fn set_streaming(&self, streaming: bool) {
		self.inner.lock().streaming = streaming;
	}

	pub fn response_start(&self) {
		let mut inner = self.inner.lock();
		if inner.response_start.is_none() {
			inner.response_start = Some(Instant::now());
		}
	}

	pub fn sanitize_ms(&self) -> u64 {
		let inner = self.inner.lock();
		span_ms(inner.sanitize_start, inner.sanitize_end)
	}

	pub fn upstream_ms(&self) -> u64 {
		let inner = self.inner.lock();
		span_ms(inner.upstream_start, inner.upstream_end)
	}

	pub fn total_ms(&self) -> u64 {
		self.received.elapsed().as_millis() as u64
	}

	/// Seal the trace. Idempotent; only the first call emits.
	pub fn finish(&self) {
		let mut inner = self.inner.lock();
		if inner.response_end.is_none() {
			inner.response_end = Some(Instant::now());
		}
		if inner.emitted {
			return;
		}
		inner.emitted = true;
		if self.sampled {
			debug!(
				method = %self.method,
				host = %self.host,
				streaming = inner.streaming,
				sanitize_ms = span_ms(inner.sanitize_start, inner.sanitize_end),
				upstream_ms = span_ms(inner.upstream_start, inner.upstream_end),
				ttfb_ms = span_ms(inner.upstream_start, inner.first_byte),
				response_ms = span_ms(inner.response_start, inner.response_end),
				total_ms = self.received.elapsed().as_millis() as u64,
				"request trace",
			);
		}
	}
}

fn span_ms(start: Option<Instant>, end: Option<Instant>) -> u64 {
	match (start, end) {
		(Some(s), Some(e)) => e.duration_since(s).as_millis() as u64,
		_ => 0,
	}
}

/// Drop guard that seals a trace when the response body goes away. Pairs with
/// [`crate::http::DropBody`].
pub struct SealOnDrop(pub RequestTrace);

impl Drop for SealOnDrop {
	fn drop(&mut self) {
		self.0.finish();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn finish_is_idempotent() {
		let t = RequestTrace::start("POST", "api.example.com");
		t.sanitize_start();
		t.sanitize_end();
		t.finish();
		let first = t.inner.lock().response_end;
		t.finish();
		assert_eq!(t.inner.lock().response_end, first);
	}

	#[test]
	fn span_math() {
		let t = RequestTrace::start("GET", "h");
		t.upstream_start();
		std::thread::sleep(std::time::Duration::from_millis(5));
		t.first_byte();
		t.upstream_end();
		assert!(t.upstream_ms() >= 5);
		// Unset spans read as zero.
		assert_eq!(t.sanitize_ms(), 0);
	}

	#[test]
	fn seal_on_drop_seals() {
		let t = RequestTrace::start("GET", "h");
		{
			let _guard = SealOnDrop(t.clone());
		}
		assert!(t.inner.lock().response_end.is_some());
	}
}
