pub mod json;
pub mod session;
pub mod stream;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::config::SanitizerConfig;
use crate::detect::hybrid::HybridDetector;
use crate::detect::Entity;

/// The record of one replacement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SanitizedItem {
	#[serde(rename = "type")]
	pub kind: String,
	pub original: String,
	pub placeholder: String,
}

/// Placeholder allocator shared across every value of one request, so
/// numbering stays dense (1..k per type, in order of first occurrence) no
/// matter how many JSON fields the request carries.
pub struct Sanitizer {
	threshold: f32,
	max_replacements: usize,
	replaced: usize,
	counters: HashMap<String, usize>,
	interned: HashMap<(String, String), String>,
	items: Vec<SanitizedItem>,
}

impl Sanitizer {
	pub fn new(threshold: f32, max_replacements: usize) -> Sanitizer {
		Sanitizer {
			threshold,
			max_replacements,
			replaced: 0,
			counters: HashMap::new(),
			interned: HashMap::new(),
			items: Vec::new(),
		}
	}

	/// Substitute the given spans in `text`. Spans below the confidence
	/// threshold are dropped, overlaps keep the earliest (longest-first)
	/// span, and replacement stops once max_replacements is reached.
	pub fn mask(&mut self, text: &str, entities: &[Entity]) -> String {
		let mut spans: Vec<&Entity> = entities
			.iter()
			.filter(|e| e.score >= self.threshold)
			.collect();
		spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

		let mut out = String::with_capacity(text.len());
		let mut cursor = 0;
		for span in spans {
			if span.start < cursor || span.end > text.len() {
				continue;
			}
			if self.replaced >= self.max_replacements {
				break;
			}
			out.push_str(&text[cursor..span.start]);
			let original = &text[span.start..span.end];
			let placeholder = self.placeholder(&span.kind, original);
			out.push_str(&placeholder);
			cursor = span.end;
			self.replaced += 1;
		}
		out.push_str(&text[cursor..]);
		out
	}

	fn placeholder(&mut self, kind: &str, original: &str) -> String {
		let key = (kind.to_string(), original.to_string());
		if let Some(existing) = self.interned.get(&key) {
			return existing.clone();
		}
		let tag = kind.to_ascii_uppercase();
		let n = self.counters.entry(tag.clone()).or_insert(0);
		*n += 1;
		let placeholder = format!("[{}_{}]", tag, n);
		self.interned.insert(key, placeholder.clone());
		self.items.push(SanitizedItem {
			kind: kind.to_ascii_lowercase(),
			original: original.to_string(),
			placeholder: placeholder.clone(),
		});
		placeholder
	}

	pub fn has_items(&self) -> bool {
		!self.items.is_empty()
	}

	/// Items, sorted by placeholder string.
	pub fn into_items(self) -> Vec<SanitizedItem> {
		let mut items = self.items;
		items.sort_by(|a, b| a.placeholder.cmp(&b.placeholder));
		items
	}
}

/// placeholder -> original, for the restore path.
pub fn mapping(items: &[SanitizedItem]) -> HashMap<String, String> {
	items
		.iter()
		.map(|i| (i.placeholder.clone(), i.original.clone()))
		.collect()
}

/// Literal substring restoration. Idempotent on text without placeholders.
pub fn restore(text: &str, map: &HashMap<String, String>) -> String {
	let mut out = text.to_string();
	for (placeholder, original) in map {
		out = out.replace(placeholder, original);
	}
	out
}

/// Detection plus masking for one request: owns the type filter and the
/// JSON-aware walk.
pub struct Engine {
	detector: Arc<HybridDetector>,
	threshold: f32,
	max_replacements: usize,
	types: HashSet<String>,
	sanitize_keys: HashSet<String>,
	skip_keys: HashSet<String>,
}

impl Engine {
	pub fn new(detector: Arc<HybridDetector>, cfg: &SanitizerConfig) -> Engine {
		Engine {
			detector,
			threshold: cfg.confidence_threshold,
			max_replacements: cfg.max_replacements,
			types: cfg
				.types
				.iter()
				.map(|t| t.to_ascii_uppercase())
				.collect(),
			sanitize_keys: cfg.sanitize_keys.iter().cloned().collect(),
			skip_keys: cfg.skip_keys.iter().cloned().collect(),
		}
	}

	async fn detect_filtered(&self, text: &str) -> Vec<Entity> {
		let mut spans = self.detector.detect(text).await;
		if !self.types.is_empty() {
			spans.retain(|s| self.types.contains(&s.kind));
		}
		spans
	}

	/// Whole-text sanitization (the non-JSON fallback).
	pub async fn sanitize_text(&self, text: &str) -> (String, Vec<SanitizedItem>) {
		let mut sanitizer = Sanitizer::new(self.threshold, self.max_replacements);
		let spans = self.detect_filtered(text).await;
		let out = sanitizer.mask(text, &spans);
		(out, sanitizer.into_items())
	}

	/// JSON-aware sanitization of a request body. Malformed JSON falls back
	/// to whole-body masking. The returned string is the body to forward.
	pub async fn sanitize_body(&self, body: &str) -> (String, Vec<SanitizedItem>) {
		let Ok(mut doc) = serde_json::from_str::<serde_json::Value>(body) else {
			return self.sanitize_text(body).await;
		};

		let targets = json::collect_targets(&doc, &self.sanitize_keys, &self.skip_keys);
		if targets.is_empty() {
			return (body.to_string(), Vec::new());
		}

		let mut sanitizer = Sanitizer::new(self.threshold, self.max_replacements);
		let mut changed = false;
		for target in targets {
			let Some(value) = json::lookup_mut(&mut doc, &target.path) else {
				continue;
			};
			let spans = self.detect_filtered(&target.text).await;
			if spans.is_empty() {
				continue;
			}
			let masked = sanitizer.mask(&target.text, &spans);
			if masked != target.text {
				*value = serde_json::Value::String(masked);
				changed = true;
			}
		}

		if !changed {
			return (body.to_string(), Vec::new());
		}
		let out = serde_json::to_string(&doc).unwrap_or_else(|_| body.to_string());
		(out, sanitizer.into_items())
	}
}
