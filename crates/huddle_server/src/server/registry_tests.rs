#![forbid(unsafe_code)]

use crate::server::registry::BoundedRegistry;

#[test]
fn insert_get_remove() {
	let reg: BoundedRegistry<String, u32> = BoundedRegistry::new("test", 8);

	assert!(reg.get(&"a".to_string()).is_none());
	reg.insert("a".to_string(), 1);
	assert_eq!(reg.get(&"a".to_string()), Some(1));
	assert_eq!(reg.remove(&"a".to_string()), Some(1));
	assert!(reg.get(&"a".to_string()).is_none());

	assert_eq!(reg.hits(), 1);
	assert_eq!(reg.misses(), 2);
}

#[test]
fn never_exceeds_capacity() {
	let reg: BoundedRegistry<u32, u32> = BoundedRegistry::new("test", 3);

	for i in 0..100 {
		reg.insert(i, i);
		assert!(reg.len() <= 3);
	}
	assert_eq!(reg.len(), 3);
}

#[test]
fn evicts_in_insertion_order() {
	let reg: BoundedRegistry<&'static str, u32> = BoundedRegistry::new("test", 2);

	reg.insert("first", 1);
	reg.insert("second", 2);

	// Access does not refresh insertion order.
	assert_eq!(reg.get(&"first"), Some(1));

	let evicted = reg.insert("third", 3);
	assert_eq!(evicted, Some(("first", 1)));
	assert!(reg.get(&"first").is_none());
	assert_eq!(reg.get(&"second"), Some(2));
	assert_eq!(reg.get(&"third"), Some(3));
}

#[test]
fn replacing_existing_key_keeps_position_and_size() {
	let reg: BoundedRegistry<&'static str, u32> = BoundedRegistry::new("test", 2);

	reg.insert("a", 1);
	reg.insert("b", 2);
	assert!(reg.insert("a", 10).is_none());
	assert_eq!(reg.len(), 2);

	// "a" kept its original slot, so it is still the eviction candidate.
	let evicted = reg.insert("c", 3);
	assert_eq!(evicted, Some(("a", 10)));
}

#[test]
fn eviction_skips_stale_order_entries() {
	let reg: BoundedRegistry<&'static str, u32> = BoundedRegistry::new("test", 2);

	reg.insert("a", 1);
	reg.insert("b", 2);
	reg.remove(&"a");

	reg.insert("c", 3);
	// "a" is gone from the map; inserting "d" must evict "b", not a ghost.
	let evicted = reg.insert("d", 4);
	assert_eq!(evicted, Some(("b", 2)));
	assert_eq!(reg.len(), 2);
}

#[test]
fn upsert_updates_in_place() {
	let reg: BoundedRegistry<&'static str, u32> = BoundedRegistry::new("test", 4);

	assert_eq!(reg.upsert("n", |prev| prev.copied().unwrap_or(0) + 1), 1);
	assert_eq!(reg.upsert("n", |prev| prev.copied().unwrap_or(0) + 1), 2);
	assert_eq!(reg.get(&"n"), Some(2));
	assert_eq!(reg.len(), 1);
}

#[test]
fn retain_and_clear() {
	let reg: BoundedRegistry<u32, u32> = BoundedRegistry::new("test", 16);
	for i in 0..10 {
		reg.insert(i, i);
	}

	let dropped = reg.retain(|_, v| v % 2 == 0);
	assert_eq!(dropped, 5);
	assert_eq!(reg.len(), 5);

	assert_eq!(reg.clear(), 5);
	assert!(reg.is_empty());
}
