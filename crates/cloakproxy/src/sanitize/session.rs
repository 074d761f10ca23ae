//! Per-request placeholder maps, held between the request and response
//! halves of an exchange.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

const SHARDS: usize = 16;

/// A request-scoped mapping from placeholder to original substring.
#[derive(Debug, Clone, Default)]
pub struct Session {
	pub id: String,
	pub replacements: HashMap<String, String>,
}

/// Concurrent id -> session store, sharded by id. `set` copies the mapping so
/// callers cannot mutate stored state; `get` returns a snapshot.
#[derive(Clone)]
pub struct SessionStore {
	shards: Arc<[Mutex<HashMap<String, Session>>; SHARDS]>,
}

impl Default for SessionStore {
	fn default() -> Self {
		SessionStore::new()
	}
}

impl SessionStore {
	pub fn new() -> SessionStore {
		SessionStore {
			shards: Arc::new(std::array::from_fn(|_| Mutex::new(HashMap::new()))),
		}
	}

	/// 128-bit random id, hex encoded.
	pub fn new_id() -> String {
		format!("{:032x}", rand::random::<u128>())
	}

	fn shard(&self, id: &str) -> &Mutex<HashMap<String, Session>> {
		let b = id.as_bytes().first().copied().unwrap_or(0) as usize;
		&self.shards[b % SHARDS]
	}

	pub fn set(&self, id: &str, replacements: &HashMap<String, String>) {
		let session = Session {
			id: id.to_string(),
			replacements: replacements.clone(),
		};
		self.shard(id).lock().insert(id.to_string(), session);
	}

	pub fn get(&self, id: &str) -> Option<Session> {
		self.shard(id).lock().get(id).cloned()
	}

	/// Removing an absent id is harmless.
	pub fn delete(&self, id: &str) {
		self.shard(id).lock().remove(id);
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.shards.iter().map(|s| s.lock().len()).sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_copies_and_get_snapshots() {
		let store = SessionStore::new();
		let mut map = HashMap::new();
		map.insert("[EMAIL_1]".to_string(), "a@b.io".to_string());
		store.set("req1", &map);

		// Caller-side mutation after set must not leak in.
		map.insert("[EMAIL_2]".to_string(), "c@d.io".to_string());
		let got = store.get("req1").unwrap();
		assert_eq!(got.replacements.len(), 1);
		assert_eq!(got.replacements["[EMAIL_1]"], "a@b.io");
	}

	#[test]
	fn delete_is_idempotent() {
		let store = SessionStore::new();
		store.set("x", &HashMap::new());
		store.delete("x");
		store.delete("x");
		assert!(store.get("x").is_none());
		assert_eq!(store.len(), 0);
	}

	#[test]
	fn ids_are_hex_and_distinct() {
		let a = SessionStore::new_id();
		let b = SessionStore::new_id();
		assert_eq!(a.len(), 32);
		assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
		assert_ne!(a, b);
	}

	#[tokio::test]
	async fn concurrent_distinct_ids_stay_isolated() {
		let store = SessionStore::new();
		let mut handles = Vec::new();
		for i in 0..32 {
			let store = store.clone();
			handles.push(tokio::spawn(async move {
				let id = format!("req-{i}");
				let mut map = HashMap::new();
				map.insert("[EMAIL_1]".to_string(), format!("user-{i}@example.com"));
				store.set(&id, &map);
				let got = store.get(&id).unwrap();
				assert_eq!(got.replacements["[EMAIL_1]"], format!("user-{i}@example.com"));
				store.delete(&id);
			}));
		}
		for h in handles {
			h.await.unwrap();
		}
		assert_eq!(store.len(), 0);
	}
}
