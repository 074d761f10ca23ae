//! Key-aware selection of the string values a JSON body is allowed to mask.
//!
//! The walk descends into every object and array. An array element inherits
//! the key of the enclosing object, so the elements of a `messages` array are
//! inspected because their own `content` field is visited. A string value is
//! masked iff its current key is in the sanitize set and not in the skip set;
//! the skip set always wins.

use std::collections::HashSet;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Seg {
	Key(String),
	Index(usize),
}

/// One maskable string value and where it lives.
#[derive(Debug, Clone)]
pub struct Target {
	pub path: Vec<Seg>,
	pub text: String,
}

pub fn collect_targets(
	doc: &Value,
	sanitize_keys: &HashSet<String>,
	skip_keys: &HashSet<String>,
) -> Vec<Target> {
	let mut out = Vec::new();
	let mut path = Vec::new();
	walk(doc, None, sanitize_keys, skip_keys, &mut path, &mut out);
	out
}

fn walk(
	value: &Value,
	current_key: Option<&str>,
	sanitize_keys: &HashSet<String>,
	skip_keys: &HashSet<String>,
	path: &mut Vec<Seg>,
	out: &mut Vec<Target>,
) {
	match value {
		Value::Object(map) => {
			for (k, v) in map {
				path.push(Seg::Key(k.clone()));
				walk(v, Some(k), sanitize_keys, skip_keys, path, out);
				path.pop();
			}
		},
		Value::Array(items) => {
			for (i, v) in items.iter().enumerate() {
				path.push(Seg::Index(i));
				// Array elements keep the enclosing object's key.
				walk(v, current_key, sanitize_keys, skip_keys, path, out);
				path.pop();
			}
		},
		Value::String(s) => {
			let Some(key) = current_key else {
				return;
			};
			let key = key.to_ascii_lowercase();
			if sanitize_keys.contains(&key) && !skip_keys.contains(&key) {
				out.push(Target {
					path: path.clone(),
					text: s.clone(),
				});
			}
		},
		// Non-string leaves are never touched.
		_ => {},
	}
}

pub fn lookup_mut<'v>(doc: &'v mut Value, path: &[Seg]) -> Option<&'v mut Value> {
	let mut cur = doc;
	for seg in path {
		cur = match seg {
			Seg::Key(k) => cur.as_object_mut()?.get_mut(k)?,
			Seg::Index(i) => cur.as_array_mut()?.get_mut(*i)?,
		};
	}
	Some(cur)
}
