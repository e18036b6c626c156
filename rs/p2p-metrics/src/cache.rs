use std::{borrow::Borrow, hash::Hash};

use indexmap::IndexMap;

/// A bounded map that evicts the least recently inserted or refreshed entry.
///
/// Entries are kept in recency order: index 0 is the coldest.
#[derive(Debug)]
pub struct LruCache<K, V> {
	entries: IndexMap<K, V>,
	capacity: usize,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
	pub fn new(capacity: usize) -> Self {
		Self {
			entries: IndexMap::with_capacity(capacity),
			capacity,
		}
	}

	/// Insert or replace an entry, making it the most recent.
	///
	/// Returns the entry evicted to stay within capacity, if any.
	/// With a capacity of zero the new entry itself is returned.
	pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
		self.entries.shift_remove(&key);
		self.entries.insert(key, value);

		if self.entries.len() > self.capacity {
			return self.entries.shift_remove_index(0);
		}

		None
	}

	/// Look up an entry without changing its recency.
	pub fn get<Q>(&self, key: &Q) -> Option<&V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.entries.get(key)
	}

	/// Mark an entry as the most recent, returning it.
	pub fn refresh<Q>(&mut self, key: &Q) -> Option<&V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		let index = self.entries.get_index_of(key)?;
		let last = self.entries.len() - 1;
		self.entries.move_index(index, last);
		self.entries.get_index(last).map(|(_, v)| v)
	}

	pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
	where
		K: Borrow<Q>,
		Q: Hash + Eq + ?Sized,
	{
		self.entries.shift_remove(key)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
