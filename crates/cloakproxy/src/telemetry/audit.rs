//! Append-only JSON-lines audit log. Writes are serialized under a mutex so
//! records never interleave; a write failure is reported on stderr and never
//! fails the request being audited.

use std::io::Write;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditItem {
	#[serde(rename = "type")]
	pub kind: String,
	pub placeholder: String,
}

/// One request outcome. Original values never appear here, only the
/// placeholder names.
#[derive(Debug, Serialize)]
pub struct AuditEntry {
	pub time: String,
	pub method: String,
	pub host: String,
	pub path: String,
	pub decision: String,
	pub rule_id: String,
	pub status: u16,
	pub sanitize_ms: u64,
	pub upstream_ms: u64,
	pub total_ms: u64,
	pub sanitized: bool,
	pub items: Vec<AuditItem>,
}

impl AuditEntry {
	pub fn now() -> String {
		Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
	}
}

pub struct AuditSink {
	path: PathBuf,
	lock: Mutex<()>,
}

impl AuditSink {
	pub fn new(path: PathBuf) -> AuditSink {
		AuditSink {
			path,
			lock: Mutex::new(()),
		}
	}

	pub fn log(&self, entry: &AuditEntry) {
		let line = match serde_json::to_string(entry) {
			Ok(line) => line,
			Err(e) => {
				error!(error = %e, "failed to encode audit entry");
				return;
			},
		};
		let _guard = self.lock.lock();
		let res = std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.path)
			.and_then(|mut f| writeln!(f, "{line}"));
		if let Err(e) = res {
			error!(error = %e, path = %self.path.display(), "failed to write audit entry");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(host: &str) -> AuditEntry {
		AuditEntry {
			time: AuditEntry::now(),
			method: "POST".to_string(),
			host: host.to_string(),
			path: "/v1/chat/completions".to_string(),
			decision: "mitm".to_string(),
			rule_id: "r1".to_string(),
			status: 200,
			sanitize_ms: 2,
			upstream_ms: 40,
			total_ms: 45,
			sanitized: true,
			items: vec![AuditItem {
				kind: "email".to_string(),
				placeholder: "[EMAIL_1]".to_string(),
			}],
		}
	}

	#[test]
	fn entries_are_one_json_object_per_line() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("audit.log");
		let sink = AuditSink::new(path.clone());
		sink.log(&entry("api.openai.com"));
		sink.log(&entry("api.anthropic.com"));

		let raw = std::fs::read_to_string(&path).unwrap();
		let lines: Vec<&str> = raw.lines().collect();
		assert_eq!(lines.len(), 2);
		for line in &lines {
			let v: serde_json::Value = serde_json::from_str(line).unwrap();
			assert_eq!(v["items"][0]["placeholder"], "[EMAIL_1]");
			// Values never appear.
			assert!(v["items"][0].get("original").is_none());
		}
		assert!(lines[0].contains("api.openai.com"));
		assert!(lines[1].contains("api.anthropic.com"));
	}

	#[test]
	fn timestamps_are_rfc3339_nanos_utc() {
		let t = AuditEntry::now();
		assert!(t.ends_with('Z'));
		let dot = t.find('.').unwrap();
		// Nanosecond precision: nine fractional digits.
		assert_eq!(t.len() - dot - 2, 9);
	}

	#[test]
	fn concurrent_writes_never_interleave() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("audit.log");
		let sink = std::sync::Arc::new(AuditSink::new(path.clone()));
		let mut handles = Vec::new();
		for _ in 0..8 {
			let sink = sink.clone();
			handles.push(std::thread::spawn(move || {
				for _ in 0..50 {
					sink.log(&entry("host.example"));
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		let raw = std::fs::read_to_string(&path).unwrap();
		assert_eq!(raw.lines().count(), 400);
		for line in raw.lines() {
			serde_json::from_str::<serde_json::Value>(line).unwrap();
		}
	}
}
