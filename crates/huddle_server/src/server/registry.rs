#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

/// Size-capped concurrent map with insertion-order eviction.
///
/// Inserting a new key at capacity evicts the oldest-inserted key; access
/// does not refresh order, and replacing an existing key's value keeps its
/// original position. Hit/miss counts are kept locally and mirrored to
/// `metrics` under the registry's name.
pub struct BoundedRegistry<K, V> {
	name: &'static str,
	capacity: usize,
	hits: AtomicU64,
	misses: AtomicU64,
	inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
	map: HashMap<K, V>,
	/// Insertion order; may hold keys already removed, skipped at eviction.
	order: VecDeque<K>,
}

impl<K, V> BoundedRegistry<K, V>
where
	K: Eq + Hash + Clone,
	V: Clone,
{
	pub fn new(name: &'static str, capacity: usize) -> Self {
		Self {
			name,
			capacity: capacity.max(1),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			inner: Mutex::new(Inner {
				map: HashMap::new(),
				order: VecDeque::new(),
			}),
		}
	}

	/// Insert or replace. Returns the evicted entry, if any.
	pub fn insert(&self, key: K, value: V) -> Option<(K, V)> {
		let mut inner = self.lock();

		if inner.map.insert(key.clone(), value).is_some() {
			return None;
		}
		inner.order.push_back(key);

		if inner.map.len() <= self.capacity {
			return None;
		}

		let evicted = Self::evict_oldest(&mut inner);
		if evicted.is_some() {
			metrics::counter!("huddle_server_registry_evictions_total", "registry" => self.name).increment(1);
			warn!(registry = self.name, capacity = self.capacity, "registry full; evicted oldest entry");
		}
		evicted
	}

	/// Insert or replace, returning `(previous value, evicted entry)`.
	///
	/// Unlike [`insert`](Self::insert) the caller sees the value it
	/// displaced, which registries holding live handles need.
	pub fn replace(&self, key: K, value: V) -> (Option<V>, Option<(K, V)>) {
		let mut inner = self.lock();

		let previous = inner.map.insert(key.clone(), value);
		if previous.is_some() {
			return (previous, None);
		}
		inner.order.push_back(key);

		if inner.map.len() <= self.capacity {
			return (None, None);
		}

		let evicted = Self::evict_oldest(&mut inner);
		if evicted.is_some() {
			metrics::counter!("huddle_server_registry_evictions_total", "registry" => self.name).increment(1);
			warn!(registry = self.name, capacity = self.capacity, "registry full; evicted oldest entry");
		}
		(None, evicted)
	}

	/// Insert only when the key is absent; returns whether it claimed the
	/// slot. The test-and-set runs under one lock so concurrent claimants
	/// cannot both win.
	pub fn insert_if_absent(&self, key: K, value: V) -> bool {
		let claimed = {
			let mut inner = self.lock();
			if inner.map.contains_key(&key) {
				false
			} else {
				inner.map.insert(key.clone(), value);
				inner.order.push_back(key);
				true
			}
		};
		if claimed {
			self.enforce_capacity();
		}
		claimed
	}

	/// Mutate the value in place when present; returns whether it was.
	pub fn update<F>(&self, key: &K, mutate: F) -> bool
	where
		F: FnOnce(&mut V),
	{
		let mut inner = self.lock();
		match inner.map.get_mut(key) {
			Some(v) => {
				mutate(v);
				true
			}
			None => false,
		}
	}

	/// Remove the entry only when the predicate holds for its value.
	pub fn remove_if<F>(&self, key: &K, check: F) -> Option<V>
	where
		F: FnOnce(&V) -> bool,
	{
		let mut inner = self.lock();
		match inner.map.get(key) {
			Some(v) if check(v) => inner.map.remove(key),
			_ => None,
		}
	}

	/// Insert-or-update under one lock; returns the resulting value.
	pub fn upsert<F>(&self, key: K, update: F) -> V
	where
		F: FnOnce(Option<&V>) -> V,
	{
		let next = {
			let mut inner = self.lock();
			let next = update(inner.map.get(&key));
			if inner.map.insert(key.clone(), next.clone()).is_none() {
				inner.order.push_back(key);
			}
			next
		};
		// Separate call keeps the closure free of the eviction path.
		self.enforce_capacity();
		next
	}

	fn enforce_capacity(&self) {
		let mut inner = self.lock();
		while inner.map.len() > self.capacity {
			if Self::evict_oldest(&mut inner).is_some() {
				metrics::counter!("huddle_server_registry_evictions_total", "registry" => self.name).increment(1);
			} else {
				break;
			}
		}
	}

	fn evict_oldest(inner: &mut Inner<K, V>) -> Option<(K, V)> {
		while let Some(key) = inner.order.pop_front() {
			if let Some(value) = inner.map.remove(&key) {
				return Some((key, value));
			}
		}
		None
	}

	pub fn get(&self, key: &K) -> Option<V> {
		let inner = self.lock();
		match inner.map.get(key) {
			Some(v) => {
				self.hits.fetch_add(1, Ordering::Relaxed);
				metrics::counter!("huddle_server_registry_hits_total", "registry" => self.name).increment(1);
				Some(v.clone())
			}
			None => {
				self.misses.fetch_add(1, Ordering::Relaxed);
				metrics::counter!("huddle_server_registry_misses_total", "registry" => self.name).increment(1);
				None
			}
		}
	}

	pub fn contains(&self, key: &K) -> bool {
		self.lock().map.contains_key(key)
	}

	pub fn remove(&self, key: &K) -> Option<V> {
		self.lock().map.remove(key)
	}

	/// Keep only entries satisfying the predicate; returns how many dropped.
	pub fn retain<F>(&self, mut keep: F) -> usize
	where
		F: FnMut(&K, &V) -> bool,
	{
		let mut inner = self.lock();
		let before = inner.map.len();
		inner.map.retain(|k, v| keep(k, v));
		before - inner.map.len()
	}

	/// Drop every entry.
	pub fn clear(&self) -> usize {
		let mut inner = self.lock();
		let dropped = inner.map.len();
		inner.map.clear();
		inner.order.clear();
		dropped
	}

	pub fn len(&self) -> usize {
		self.lock().map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Snapshot of all entries, in no particular order.
	pub fn entries(&self) -> Vec<(K, V)> {
		self.lock().map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
	}

	pub fn hits(&self) -> u64 {
		self.hits.load(Ordering::Relaxed)
	}

	pub fn misses(&self) -> u64 {
		self.misses.load(Ordering::Relaxed)
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
		// A poisoned registry lock means a panicked writer; the map itself
		// is still structurally sound, so keep serving.
		match self.inner.lock() {
			Ok(guard) => guard,
			Err(poisoned) => poisoned.into_inner(),
		}
	}
}
