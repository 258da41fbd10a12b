// SPDX-License-Identifier: Apache-2.0

//! The prepared-query cache.
//!
//! A bounded LRU keyed by `v1GetData::<path>`. Readers hold shared
//! access to the cache pointer; a compiler trigger replaces the whole
//! cache under exclusive access, so concurrent readers always observe
//! a consistent snapshot.

use crate::engine::PreparedQuery;
use lru::LruCache;
use std::{
	num::NonZeroUsize,
	sync::{Arc, Mutex, RwLock},
};

pub const CACHE_CAPACITY: usize = 100;

pub struct QueryCache {
	current: RwLock<Arc<Mutex<LruCache<String, Arc<dyn PreparedQuery>>>>>,
	capacity: NonZeroUsize,
}

impl QueryCache {
	pub fn new() -> Self {
		QueryCache::with_capacity(CACHE_CAPACITY)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		let capacity = NonZeroUsize::new(capacity).expect("capacity is non-zero");
		QueryCache {
			current: RwLock::new(Arc::new(Mutex::new(LruCache::new(capacity)))),
			capacity,
		}
	}

	/// The cache key for a data read.
	pub fn data_key(strict: bool, path: &str) -> String {
		if strict {
			format!("v1GetData::strict::{}", path)
		} else {
			format!("v1GetData::{}", path)
		}
	}

	pub fn get(&self, key: &str) -> Option<Arc<dyn PreparedQuery>> {
		let cache = Arc::clone(&self.current.read().expect("cache lock poisoned"));
		let mut cache = cache.lock().expect("cache lock poisoned");
		cache.get(key).cloned()
	}

	pub fn insert(&self, key: String, query: Arc<dyn PreparedQuery>) {
		let cache = Arc::clone(&self.current.read().expect("cache lock poisoned"));
		let mut cache = cache.lock().expect("cache lock poisoned");
		cache.put(key, query);
	}

	/// Replace the entire cache; called on every compiler trigger.
	pub fn clear(&self) {
		let fresh = Arc::new(Mutex::new(LruCache::new(self.capacity)));
		*self.current.write().expect("cache lock poisoned") = fresh;
	}

	pub fn len(&self) -> usize {
		let cache = Arc::clone(&self.current.read().expect("cache lock poisoned"));
		let cache = cache.lock().expect("cache lock poisoned");
		cache.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Default for QueryCache {
	fn default() -> Self {
		QueryCache::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		engine::{EngineError, EvalParams, ResultSet},
		store::{Store, Txn},
	};

	struct NullQuery;

	impl PreparedQuery for NullQuery {
		fn eval(
			&self,
			_store: &dyn Store,
			_txn: &Txn,
			_params: EvalParams<'_>,
		) -> Result<ResultSet, EngineError> {
			Ok(Vec::new())
		}
	}

	#[test]
	fn inserts_and_hits() {
		let cache = QueryCache::new();
		cache.insert("v1GetData::/a".to_owned(), Arc::new(NullQuery));
		assert!(cache.get("v1GetData::/a").is_some());
		assert!(cache.get("v1GetData::/b").is_none());
	}

	#[test]
	fn clear_replaces_everything() {
		let cache = QueryCache::new();
		cache.insert("v1GetData::/a".to_owned(), Arc::new(NullQuery));
		cache.clear();
		assert!(cache.is_empty());
		assert!(cache.get("v1GetData::/a").is_none());
	}

	#[test]
	fn capacity_is_bounded() {
		let cache = QueryCache::with_capacity(2);
		cache.insert("a".to_owned(), Arc::new(NullQuery));
		cache.insert("b".to_owned(), Arc::new(NullQuery));
		cache.insert("c".to_owned(), Arc::new(NullQuery));
		assert_eq!(cache.len(), 2);
		// Least-recently-used entry was evicted.
		assert!(cache.get("a").is_none());
	}

	#[test]
	fn strict_keys_are_distinct() {
		assert_eq!(QueryCache::data_key(false, "/a"), "v1GetData::/a");
		assert_eq!(QueryCache::data_key(true, "/a"), "v1GetData::strict::/a");
	}
}
