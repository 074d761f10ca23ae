//! WordPiece encoding with byte offsets, plus the BIO tag to span reduction
//! used by the NER session.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, bail};

use super::{Entity, Source};

pub const MAX_SEQ_LEN: usize = 512;
pub const MAX_WORD_LEN: usize = 100;

/// A word in the input text, as byte offsets (end exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word {
	pub start: usize,
	pub end: usize,
}

#[derive(Debug, Clone)]
pub struct Encoding {
	pub input_ids: Vec<i64>,
	pub attention_mask: Vec<i64>,
	pub token_type_ids: Vec<i64>,
	/// For each emitted position, the index of the word it came from, or -1
	/// for [CLS]/[SEP].
	pub word_index: Vec<i32>,
	pub words: Vec<Word>,
}

pub struct Tokenizer {
	vocab: HashMap<String, i64>,
	lowercase: bool,
	continuing_prefix: String,
	unk: i64,
	cls: i64,
	sep: i64,
}

impl Tokenizer {
	/// Load a HuggingFace-style tokenizer.json (WordPiece model).
	pub fn from_file(path: &Path) -> anyhow::Result<Tokenizer> {
		let raw = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read {}", path.display()))?;
		let doc: serde_json::Value = serde_json::from_str(&raw)
			.with_context(|| format!("failed to parse {}", path.display()))?;

		let model = doc
			.get("model")
			.context("tokenizer.json missing model section")?;
		let vocab_obj = model
			.get("vocab")
			.and_then(|v| v.as_object())
			.context("tokenizer.json missing vocab")?;
		let mut vocab = HashMap::with_capacity(vocab_obj.len());
		for (token, id) in vocab_obj {
			let id = id.as_i64().context("non-integer vocab id")?;
			vocab.insert(token.clone(), id);
		}

		let unk_token = model
			.get("unk_token")
			.and_then(|v| v.as_str())
			.unwrap_or("[UNK]");
		let continuing_prefix = model
			.get("continuing_subword_prefix")
			.and_then(|v| v.as_str())
			.unwrap_or("##")
			.to_string();

		let lookup = |tok: &str| -> anyhow::Result<i64> {
			vocab
				.get(tok)
				.copied()
				.with_context(|| format!("vocab missing {tok}"))
		};
		let unk = lookup(unk_token)?;
		let cls = lookup("[CLS]")?;
		let sep = lookup("[SEP]")?;

		Ok(Tokenizer {
			lowercase: normalizer_lowercases(doc.get("normalizer")),
			vocab,
			continuing_prefix,
			unk,
			cls,
			sep,
		})
	}

	/// Build from an ordered token list; ids are list positions. Test helper
	/// kept public for callers embedding a fixed vocabulary.
	pub fn from_vocab(tokens: &[&str], lowercase: bool) -> anyhow::Result<Tokenizer> {
		let vocab: HashMap<String, i64> = tokens
			.iter()
			.enumerate()
			.map(|(i, t)| (t.to_string(), i as i64))
			.collect();
		let Some((&unk, &cls, &sep)) = vocab
			.get("[UNK]")
			.zip(vocab.get("[CLS]"))
			.zip(vocab.get("[SEP]"))
			.map(|((a, b), c)| (a, b, c))
		else {
			bail!("vocab must contain [UNK], [CLS] and [SEP]");
		};
		Ok(Tokenizer {
			vocab,
			lowercase,
			continuing_prefix: "##".to_string(),
			unk,
			cls,
			sep,
		})
	}

	pub fn encode(&self, text: &str) -> Encoding {
		let words = split_words(text);

		let mut input_ids = Vec::with_capacity(words.len() + 2);
		let mut word_index = Vec::with_capacity(words.len() + 2);
		input_ids.push(self.cls);
		word_index.push(-1);

		'words: for (wi, word) in words.iter().enumerate() {
			for id in self.wordpiece(&text[word.start..word.end]) {
				if input_ids.len() >= MAX_SEQ_LEN - 1 {
					break 'words;
				}
				input_ids.push(id);
				word_index.push(wi as i32);
			}
		}

		input_ids.push(self.sep);
		word_index.push(-1);

		let len = input_ids.len();
		Encoding {
			input_ids,
			attention_mask: vec![1; len],
			token_type_ids: vec![0; len],
			word_index,
			words,
		}
	}

	fn wordpiece(&self, word: &str) -> Vec<i64> {
		let normalized = if self.lowercase {
			word.to_lowercase()
		} else {
			word.to_string()
		};
		let chars: Vec<char> = normalized.chars().collect();
		if chars.len() > MAX_WORD_LEN {
			return vec![self.unk];
		}

		let mut pieces = Vec::new();
		let mut start = 0;
		while start < chars.len() {
			let mut end = chars.len();
			let mut found = None;
			while start < end {
				let mut piece: String = chars[start..end].iter().collect();
				if start > 0 {
					piece.insert_str(0, &self.continuing_prefix);
				}
				if let Some(id) = self.vocab.get(&piece) {
					found = Some(*id);
					break;
				}
				end -= 1;
			}
			match found {
				Some(id) => {
					pieces.push(id);
					start = end;
				},
				// Any unknown piece collapses the whole word to a single [UNK].
				None => return vec![self.unk],
			}
		}
		pieces
	}
}

fn normalizer_lowercases(normalizer: Option<&serde_json::Value>) -> bool {
	fn walk(v: &serde_json::Value) -> bool {
		if let Some(b) = v.get("lowercase").and_then(|b| b.as_bool()) {
			return b;
		}
		if let Some(seq) = v.get("normalizers").and_then(|s| s.as_array()) {
			return seq.iter().any(walk);
		}
		v.get("type").and_then(|t| t.as_str()) == Some("Lowercase")
	}
	normalizer.map(walk).unwrap_or(false)
}

/// Maximal runs of letters-or-digits, with byte offsets.
pub fn split_words(text: &str) -> Vec<Word> {
	let mut words = Vec::new();
	let mut start = None;
	for (i, c) in text.char_indices() {
		if c.is_alphanumeric() {
			if start.is_none() {
				start = Some(i);
			}
		} else if let Some(s) = start.take() {
			words.push(Word { start: s, end: i });
		}
	}
	if let Some(s) = start {
		words.push(Word {
			start: s,
			end: text.len(),
		});
	}
	words
}

/// A per-token model label, already mapped from the label id.
#[derive(Debug, Clone)]
pub struct TokenLabel {
	pub tag: String,
	pub score: f32,
}

/// Collapse source tag vocabularies into the types this pipeline emits.
pub fn normalize_tag(tag: &str) -> String {
	match tag.to_ascii_uppercase().as_str() {
		"PER" | "PERSON" => "PERSON".to_string(),
		"LOC" | "GPE" => "LOC".to_string(),
		"ORG" => "ORG".to_string(),
		"MISC" => "MISC".to_string(),
		other => other.to_string(),
	}
}

/// BIO tag scan: B opens, I extends a matching open span, O closes. The span
/// covers the first member word's start through the last member word's end,
/// scored by the arithmetic mean of member token scores.
pub fn reduce_bio(encoding: &Encoding, labels: &[TokenLabel]) -> Vec<Entity> {
	struct Open {
		kind: String,
		first_word: usize,
		last_word: usize,
		scores: Vec<f32>,
	}

	let mut spans = Vec::new();
	let mut open: Option<Open> = None;

	let close = |open: &mut Option<Open>, spans: &mut Vec<Entity>| {
		if let Some(o) = open.take() {
			let score = o.scores.iter().sum::<f32>() / o.scores.len() as f32;
			spans.push(Entity {
				start: encoding.words[o.first_word].start,
				end: encoding.words[o.last_word].end,
				kind: o.kind,
				score,
				source: Source::OnnxNer,
			});
		}
	};

	for (pos, label) in labels.iter().enumerate().take(encoding.word_index.len()) {
		let word = encoding.word_index[pos];
		if word < 0 {
			continue;
		}
		let word = word as usize;

		match label.tag.split_once('-') {
			Some(("B", tag)) => {
				close(&mut open, &mut spans);
				open = Some(Open {
					kind: normalize_tag(tag),
					first_word: word,
					last_word: word,
					scores: vec![label.score],
				});
			},
			Some(("I", tag)) => {
				let kind = normalize_tag(tag);
				match open.as_mut() {
					Some(o) if o.kind == kind => {
						o.last_word = word;
						o.scores.push(label.score);
					},
					_ => {
						close(&mut open, &mut spans);
						open = Some(Open {
							kind,
							first_word: word,
							last_word: word,
							scores: vec![label.score],
						});
					},
				}
			},
			_ => close(&mut open, &mut spans),
		}
	}
	close(&mut open, &mut spans);
	spans
}
