use serde::Serialize;

use crate::config::RuleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
	Allow,
	Block,
	Mitm,
}

impl Decision {
	pub fn as_str(&self) -> &'static str {
		match self {
			Decision::Allow => "allow",
			Decision::Block => "block",
			Decision::Mitm => "mitm",
		}
	}
}

#[derive(Debug, Clone)]
pub struct Verdict {
	pub decision: Decision,
	pub rule_id: String,
	pub reason: String,
}

#[derive(Debug, Clone)]
struct Rule {
	id: String,
	host: String,
	host_contains: String,
	action: String,
}

/// Ordered first-match-wins host policy. Stateless and shareable.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
	rules: Vec<Rule>,
}

impl PolicyEngine {
	pub fn new(rules: &[RuleConfig]) -> PolicyEngine {
		PolicyEngine {
			rules: rules
				.iter()
				.map(|r| Rule {
					id: r.id.clone(),
					host: r.host.to_ascii_lowercase(),
					host_contains: r.host_contains.to_ascii_lowercase(),
					action: r.action.clone(),
				})
				.collect(),
		}
	}

	pub fn evaluate(&self, host: &str) -> Verdict {
		let host = host.to_ascii_lowercase();
		for rule in &self.rules {
			if !rule.matches(&host) {
				continue;
			}
			let decision = match rule.action.as_str() {
				"allow" => Decision::Allow,
				"block" => Decision::Block,
				"mitm" => Decision::Mitm,
				_ => {
					return Verdict {
						decision: Decision::Block,
						rule_id: rule.id.clone(),
						reason: "invalid action".to_string(),
					};
				},
			};
			return Verdict {
				decision,
				rule_id: rule.id.clone(),
				reason: format!("matched rule {}", rule.id),
			};
		}
		Verdict {
			decision: Decision::Allow,
			rule_id: "default".to_string(),
			reason: "no rule matched".to_string(),
		}
	}
}

impl Rule {
	fn matches(&self, host: &str) -> bool {
		if !self.host.is_empty() {
			return self.host == host;
		}
		if !self.host_contains.is_empty() {
			return host.contains(&self.host_contains);
		}
		// A rule with no matcher applies to everything.
		true
	}
}

/// Informational provider-family tag for a host, used in audit and stats.
pub fn provider_family(host: &str) -> &'static str {
	let host = host.to_ascii_lowercase();
	if host.contains("openai.com") || host.contains("oaiusercontent") {
		"openai"
	} else if host.contains("anthropic.com") || host.contains("claude.ai") {
		"anthropic"
	} else if host.contains("googleapis.com")
		|| host.contains("gemini.google.com")
		|| host.contains("generativelanguage")
	{
		"google"
	} else if host.contains("azure.com") || host.contains("microsoft.com") {
		"azure"
	} else if host.contains("mistral.ai") {
		"mistral"
	} else if host.contains("cohere.com") || host.contains("cohere.ai") {
		"cohere"
	} else if host.contains("meta.ai") || host.contains("llama") {
		"meta"
	} else {
		"other"
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(id: &str, host: &str, contains: &str, action: &str) -> RuleConfig {
		RuleConfig {
			id: id.to_string(),
			host: host.to_string(),
			host_contains: contains.to_string(),
			action: action.to_string(),
		}
	}

	#[test]
	fn no_rules_defaults_to_allow() {
		let p = PolicyEngine::new(&[]);
		let v = p.evaluate("api.openai.com");
		assert_eq!(v.decision, Decision::Allow);
		assert_eq!(v.rule_id, "default");
	}

	#[test]
	fn first_match_wins_regardless_of_specificity() {
		let p = PolicyEngine::new(&[
			rule("broad", "", "openai", "mitm"),
			rule("narrow", "api.openai.com", "", "block"),
		]);
		assert_eq!(p.evaluate("api.openai.com").decision, Decision::Mitm);
		assert_eq!(p.evaluate("api.openai.com").rule_id, "broad");
	}

	#[test]
	fn exact_match_is_case_insensitive() {
		let p = PolicyEngine::new(&[rule("r1", "API.OpenAI.com", "", "block")]);
		assert_eq!(p.evaluate("api.openai.com").decision, Decision::Block);
		assert_eq!(p.evaluate("api.openai.com.evil").decision, Decision::Allow);
	}

	#[test]
	fn empty_rule_matches_everything() {
		let p = PolicyEngine::new(&[rule("all", "", "", "block")]);
		assert_eq!(p.evaluate("anything.example").decision, Decision::Block);
	}

	#[test]
	fn invalid_action_blocks() {
		let p = PolicyEngine::new(&[rule("bad", "", "", "observe")]);
		let v = p.evaluate("example.com");
		assert_eq!(v.decision, Decision::Block);
		assert_eq!(v.reason, "invalid action");
	}

	#[test]
	fn provider_families() {
		assert_eq!(provider_family("api.openai.com"), "openai");
		assert_eq!(provider_family("api.anthropic.com"), "anthropic");
		assert_eq!(provider_family("generativelanguage.googleapis.com"), "google");
		assert_eq!(provider_family("internal.example"), "other");
	}
}
