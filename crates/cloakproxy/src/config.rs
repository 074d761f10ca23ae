use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top level configuration, loadable from YAML or JSON.
///
/// Every path accepts `~` and defaults to a location under the application
/// directory (`~/.cloakproxy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
	/// Proxy listen port.
	pub port: u16,
	/// Loopback port for the read-only stats endpoint.
	pub stats_port: u16,
	/// Audit log file (JSON lines).
	pub log_file: String,
	/// Directory holding the root CA material.
	pub ca_dir: String,
	/// Ordered policy rules; first match wins.
	pub rules: Vec<RuleConfig>,
	pub mitm: MitmConfig,
	pub sanitizer: SanitizerConfig,
	pub notifications: NotificationsConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			port: 8080,
			stats_port: 8081,
			log_file: "~/.cloakproxy/audit.log".to_string(),
			ca_dir: "~/.cloakproxy/ca".to_string(),
			rules: Vec::new(),
			mitm: MitmConfig::default(),
			sanitizer: SanitizerConfig::default(),
			notifications: NotificationsConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RuleConfig {
	pub id: String,
	/// Exact host match (case-insensitive). Empty matches everything.
	pub host: String,
	/// Substring host match (case-insensitive). Empty matches everything.
	pub host_contains: String,
	/// One of allow, block, mitm. Anything else blocks.
	pub action: String,
}

impl Default for RuleConfig {
	fn default() -> Self {
		RuleConfig {
			id: String::new(),
			host: String::new(),
			host_contains: String::new(),
			action: "allow".to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct MitmConfig {
	pub enabled: bool,
	/// Suffix-matched domains eligible for interception. Empty means all.
	pub domains: Vec<String>,
}

impl Default for MitmConfig {
	fn default() -> Self {
		MitmConfig {
			enabled: false,
			domains: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SanitizerConfig {
	pub enabled: bool,
	/// Entity types to act on; empty enables every detector.
	pub types: Vec<String>,
	pub confidence_threshold: f32,
	pub max_replacements: usize,
	pub restore_responses: bool,
	pub sanitize_keys: Vec<String>,
	pub skip_keys: Vec<String>,
	pub detectors: DetectorsConfig,
}

pub fn default_sanitize_keys() -> Vec<String> {
	["prompt", "input", "content", "text", "message", "parts"]
		.iter()
		.map(|s| s.to_string())
		.collect()
}

pub fn default_skip_keys() -> Vec<String> {
	[
		"authorization",
		"access_token",
		"session_token",
		"token",
		"bearer",
		"id_token",
		"refresh_token",
		"api_key",
		"apikey",
		"x-api-key",
		"cookie",
		"set-cookie",
		"model",
		"role",
		"type",
		"id",
		"object",
		"created",
		"system_fingerprint",
	]
	.iter()
	.map(|s| s.to_string())
	.collect()
}

impl Default for SanitizerConfig {
	fn default() -> Self {
		SanitizerConfig {
			enabled: true,
			types: Vec::new(),
			confidence_threshold: 0.5,
			max_replacements: 100,
			restore_responses: true,
			sanitize_keys: default_sanitize_keys(),
			skip_keys: default_skip_keys(),
			detectors: DetectorsConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct DetectorsConfig {
	pub onnx_ner: OnnxNerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct OnnxNerConfig {
	pub enabled: bool,
	/// Directory holding model.onnx, labels.json and tokenizer.json.
	pub model_dir: String,
	/// Texts larger than this skip the model.
	pub max_bytes: usize,
	pub timeout_ms: u64,
	pub min_score: f32,
}

impl OnnxNerConfig {
	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}
}

impl Default for OnnxNerConfig {
	fn default() -> Self {
		OnnxNerConfig {
			enabled: false,
			model_dir: "~/.cloakproxy/models/default".to_string(),
			max_bytes: 16_384,
			timeout_ms: 25,
			min_score: 0.5,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct NotificationsConfig {
	pub enabled: bool,
}

impl Config {
	/// Load from a YAML or JSON file. A missing file yields the defaults.
	pub fn load(path: &Path) -> anyhow::Result<Config> {
		if !path.exists() {
			return Ok(Config::default());
		}
		let raw = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read config {}", path.display()))?;
		let cfg = if path.extension().is_some_and(|e| e == "json") {
			serde_json::from_str(&raw)
				.with_context(|| format!("failed to parse config {}", path.display()))?
		} else {
			serde_yaml::from_str(&raw)
				.with_context(|| format!("failed to parse config {}", path.display()))?
		};
		Ok(cfg)
	}

	pub fn default_path() -> PathBuf {
		expand("~/.cloakproxy/config.yaml")
	}

	pub fn log_file(&self) -> PathBuf {
		expand(&self.log_file)
	}

	pub fn ca_dir(&self) -> PathBuf {
		expand(&self.ca_dir)
	}

	pub fn model_dir(&self) -> PathBuf {
		expand(&self.sanitizer.detectors.onnx_ner.model_dir)
	}
}

pub fn expand(path: &str) -> PathBuf {
	PathBuf::from(shellexpand::tilde(path).into_owned())
}
