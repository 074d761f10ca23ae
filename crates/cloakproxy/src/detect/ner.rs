//! Sequence-labeling NER session. The inference backend is an external
//! collaborator behind [`NerBackend`]; everything else (model directory
//! discovery, softmax, label mapping, BIO reduction) lives here.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;

use super::Entity;
use super::tokenizer::{TokenLabel, Tokenizer, reduce_bio};

/// Contract: given equal-length int64 input_ids / attention_mask /
/// token_type_ids, return an N x L matrix of raw logits.
pub trait NerBackend: Send + Sync {
	fn infer(
		&self,
		input_ids: &[i64],
		attention_mask: &[i64],
		token_type_ids: &[i64],
	) -> anyhow::Result<Vec<Vec<f32>>>;
}

pub struct NerSession {
	tokenizer: Tokenizer,
	labels: Vec<String>,
	backend: Box<dyn NerBackend>,
}

impl NerSession {
	/// Look for model.onnx, labels.json and tokenizer.json under `dir`.
	/// Any missing piece means the session is unavailable (None), which the
	/// hybrid detector treats as regex-only.
	pub fn discover(dir: &Path) -> anyhow::Result<Option<NerSession>> {
		let model = dir.join("model.onnx");
		let labels = dir.join("labels.json");
		let tokenizer = dir.join("tokenizer.json");
		if !model.exists() || !labels.exists() || !tokenizer.exists() {
			return Ok(None);
		}

		let tokenizer = Tokenizer::from_file(&tokenizer)?;
		let labels = load_labels(&labels)?;

		#[cfg(feature = "onnx")]
		{
			let backend = onnx::OrtBackend::open(&model)?;
			Ok(Some(NerSession {
				tokenizer,
				labels,
				backend: Box::new(backend),
			}))
		}
		#[cfg(not(feature = "onnx"))]
		{
			let _ = (tokenizer, labels);
			tracing::debug!(model = %model.display(), "onnx feature disabled; NER session unavailable");
			Ok(None)
		}
	}

	pub fn with_backend(
		tokenizer: Tokenizer,
		labels: Vec<String>,
		backend: Box<dyn NerBackend>,
	) -> NerSession {
		NerSession {
			tokenizer,
			labels,
			backend,
		}
	}

	/// Encode, infer, take the per-token argmax over the softmaxed logits and
	/// reduce BIO tags to spans.
	pub fn detect(&self, text: &str) -> anyhow::Result<Vec<Entity>> {
		let encoding = self.tokenizer.encode(text);
		let logits = self.backend.infer(
			&encoding.input_ids,
			&encoding.attention_mask,
			&encoding.token_type_ids,
		)?;

		let labels: Vec<TokenLabel> = logits
			.iter()
			.map(|row| {
				let probs = softmax(row);
				let (best, score) = argmax(&probs);
				TokenLabel {
					tag: self
						.labels
						.get(best)
						.cloned()
						.unwrap_or_else(|| "O".to_string()),
					score,
				}
			})
			.collect();

		Ok(reduce_bio(&encoding, &labels))
	}
}

fn load_labels(path: &Path) -> anyhow::Result<Vec<String>> {
	let raw = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read {}", path.display()))?;
	let byid: HashMap<String, String> =
		serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
	let mut labels = vec!["O".to_string(); byid.len()];
	for (id, tag) in byid {
		let id: usize = id
			.parse()
			.with_context(|| format!("non-numeric label id {id}"))?;
		if id >= labels.len() {
			labels.resize(id + 1, "O".to_string());
		}
		labels[id] = tag;
	}
	Ok(labels)
}

/// Numerically stable softmax: subtract the row max before exponentiation;
/// if the denominator underflows to zero, fall back to uniform.
pub fn softmax(row: &[f32]) -> Vec<f32> {
	if row.is_empty() {
		return Vec::new();
	}
	let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
	let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
	let sum: f32 = exps.iter().sum();
	if sum == 0.0 || !sum.is_finite() {
		return vec![1.0 / row.len() as f32; row.len()];
	}
	exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(probs: &[f32]) -> (usize, f32) {
	let mut best = 0;
	let mut score = f32::NEG_INFINITY;
	for (i, p) in probs.iter().enumerate() {
		if *p > score {
			best = i;
			score = *p;
		}
	}
	(best, score)
}

#[cfg(feature = "onnx")]
mod onnx {
	use std::path::Path;

	use ort::session::Session;
	use ort::session::builder::GraphOptimizationLevel;
	use ort::value::Tensor;
	use parking_lot::Mutex;

	use super::NerBackend;

	pub struct OrtBackend {
		session: Mutex<Session>,
	}

	impl OrtBackend {
		pub fn open(model: &Path) -> anyhow::Result<OrtBackend> {
			let session = Session::builder()?
				.with_optimization_level(GraphOptimizationLevel::Level3)?
				.with_intra_threads(1)?
				.commit_from_file(model)?;
			Ok(OrtBackend {
				session: Mutex::new(session),
			})
		}
	}

	impl NerBackend for OrtBackend {
		fn infer(
			&self,
			input_ids: &[i64],
			attention_mask: &[i64],
			token_type_ids: &[i64],
		) -> anyhow::Result<Vec<Vec<f32>>> {
			let n = input_ids.len();
			let ids = ndarray::Array2::from_shape_vec((1, n), input_ids.to_vec())?;
			let mask = ndarray::Array2::from_shape_vec((1, n), attention_mask.to_vec())?;
			let types = ndarray::Array2::from_shape_vec((1, n), token_type_ids.to_vec())?;

			let mut session = self.session.lock();
			let outputs = session.run(ort::inputs![
				"input_ids" => Tensor::from_array(ids)?,
				"attention_mask" => Tensor::from_array(mask)?,
				"token_type_ids" => Tensor::from_array(types)?,
			])?;

			let logits = outputs[0].try_extract_array::<f32>()?;
			let shape = logits.shape().to_vec();
			anyhow::ensure!(shape.len() == 3 && shape[1] == n, "unexpected logits shape {shape:?}");
			let l = shape[2];
			let flat: Vec<f32> = logits.iter().copied().collect();
			Ok((0..n).map(|i| flat[i * l..(i + 1) * l].to_vec()).collect())
		}
	}
}
