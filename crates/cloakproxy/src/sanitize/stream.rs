//! Streaming placeholder restoration.
//!
//! The transducer holds back just enough bytes (`carry`) to never emit a
//! placeholder prefix that a later chunk might complete, so restoration is
//! correct for any chunking of the upstream body at a worst-case added
//! latency of max_token_len - 1 bytes.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use http_body::Frame;

use crate::http::Body;

/// Restartable restore state machine, independent of any body type so the
/// same logic can serve request-side streaming later.
#[derive(Debug)]
pub struct Restorer {
	tokens: Vec<(Vec<u8>, Vec<u8>)>,
	max_token_len: usize,
	carry: Vec<u8>,
}

impl Restorer {
	pub fn new<'a>(map: impl IntoIterator<Item = (&'a String, &'a String)>) -> Restorer {
		let tokens: Vec<(Vec<u8>, Vec<u8>)> = map
			.into_iter()
			.map(|(ph, orig)| (ph.as_bytes().to_vec(), orig.as_bytes().to_vec()))
			.collect();
		let max_token_len = tokens.iter().map(|(ph, _)| ph.len()).max().unwrap_or(0);
		Restorer {
			tokens,
			max_token_len,
			carry: Vec::new(),
		}
	}

	pub fn is_passthrough(&self) -> bool {
		self.tokens.is_empty()
	}

	/// Feed one chunk; returns the bytes safe to emit now.
	pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
		if self.is_passthrough() {
			return chunk.to_vec();
		}
		let mut combined = std::mem::take(&mut self.carry);
		combined.extend_from_slice(chunk);

		let tail = self.tail_len(&combined);
		let emit = &combined[..combined.len() - tail];
		let out = self.replace_all(emit);
		self.carry = combined[combined.len() - tail..].to_vec();
		out
	}

	/// Flush the held-back suffix at end of stream.
	pub fn finish(&mut self) -> Vec<u8> {
		let carry = std::mem::take(&mut self.carry);
		self.replace_all(&carry)
	}

	/// Length of the longest suffix of `data` that is a strict prefix of some
	/// placeholder.
	fn tail_len(&self, data: &[u8]) -> usize {
		let upper = self.max_token_len.saturating_sub(1).min(data.len());
		for len in (1..=upper).rev() {
			let suffix = &data[data.len() - len..];
			if self
				.tokens
				.iter()
				.any(|(ph, _)| ph.len() > len && ph.starts_with(suffix))
			{
				return len;
			}
		}
		0
	}

	fn replace_all(&self, data: &[u8]) -> Vec<u8> {
		let mut out = data.to_vec();
		for (placeholder, original) in &self.tokens {
			out = replace_bytes(&out, placeholder, original);
		}
		out
	}
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
	if needle.is_empty() || haystack.len() < needle.len() {
		return haystack.to_vec();
	}
	let mut out = Vec::with_capacity(haystack.len());
	let mut i = 0;
	while i < haystack.len() {
		if haystack[i..].starts_with(needle) {
			out.extend_from_slice(replacement);
			i += needle.len();
		} else {
			out.push(haystack[i]);
			i += 1;
		}
	}
	out
}

pin_project_lite::pin_project! {
	/// Body adapter applying a [`Restorer`] to each data frame, flushing the
	/// carry before end of stream (and before any trailers).
	#[derive(Debug)]
	pub struct RestoreBody {
		#[pin]
		inner: Body,
		restorer: Restorer,
		queued: VecDeque<Frame<Bytes>>,
		done: bool,
	}
}

impl RestoreBody {
	pub fn new(inner: Body, restorer: Restorer) -> RestoreBody {
		RestoreBody {
			inner,
			restorer,
			queued: VecDeque::new(),
			done: false,
		}
	}
}

impl http_body::Body for RestoreBody {
	type Data = Bytes;
	type Error = crate::http::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();
		loop {
			if let Some(frame) = this.queued.pop_front() {
				return Poll::Ready(Some(Ok(frame)));
			}
			if *this.done {
				return Poll::Ready(None);
			}
			match ready!(this.inner.as_mut().poll_frame(cx)) {
				Some(Ok(frame)) => match frame.into_data() {
					Ok(data) => {
						let out = this.restorer.push(&data);
						if !out.is_empty() {
							return Poll::Ready(Some(Ok(Frame::data(Bytes::from(out)))));
						}
						// Everything was held back; poll for more input.
					},
					Err(frame) => {
						// Trailers: flush the carry first so body bytes
						// keep their order.
						let tail = this.restorer.finish();
						*this.done = true;
						if !tail.is_empty() {
							this.queued.push_back(frame);
							return Poll::Ready(Some(Ok(Frame::data(Bytes::from(tail)))));
						}
						return Poll::Ready(Some(Ok(frame)));
					},
				},
				Some(Err(e)) => return Poll::Ready(Some(Err(e))),
				None => {
					*this.done = true;
					let tail = this.restorer.finish();
					if !tail.is_empty() {
						return Poll::Ready(Some(Ok(Frame::data(Bytes::from(tail)))));
					}
					return Poll::Ready(None);
				},
			}
		}
	}
}
