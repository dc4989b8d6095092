use cluster_db::memory::MemoryEngine;
use cluster_db::{Engine, Store, Tree};

#[test]
fn store_insert_fetch_update_free() {
	let engine = MemoryEngine::new();
	let store = engine.open_store("blocks").unwrap();

	let loc = store.insert(b"hello").unwrap();
	assert!(store.exists(loc).unwrap());
	assert_eq!(store.fetch(loc).unwrap(), b"hello");

	store.update(loc, b"world").unwrap();
	assert_eq!(store.fetch(loc).unwrap(), b"world");

	store.free(loc).unwrap();
	assert!(!store.exists(loc).unwrap());
	assert!(store.fetch(loc).is_err());
}

#[test]
fn store_allocates_distinct_locations() {
	let engine = MemoryEngine::new();
	let store = engine.open_store("blocks").unwrap();
	let a = store.insert(b"a").unwrap();
	let b = store.insert(b"b").unwrap();
	assert_ne!(a, b);
}

#[test]
fn store_root_defaults_to_zero() {
	let engine = MemoryEngine::new();
	let store = engine.open_store("blocks").unwrap();
	assert_eq!(store.get_root(0).unwrap(), 0);
	store.set_root(0, 42).unwrap();
	assert_eq!(store.get_root(0).unwrap(), 42);
}

#[test]
fn opening_a_store_twice_shares_state() {
	let engine = MemoryEngine::new();
	let store1 = engine.open_store("blocks").unwrap();
	let loc = store1.insert(b"shared").unwrap();

	let store2 = engine.open_store("blocks").unwrap();
	assert_eq!(store2.fetch(loc).unwrap(), b"shared");
}

#[test]
fn tree_get_put_remove() {
	let engine = MemoryEngine::new();
	let tree = engine.open_tree("translation").unwrap();

	assert_eq!(tree.get(b"k1").unwrap(), None);
	tree.put(b"k1", b"v1").unwrap();
	assert_eq!(tree.get(b"k1").unwrap(), Some(b"v1".to_vec()));
	assert!(tree.exists(b"k1").unwrap());

	tree.remove(b"k1").unwrap();
	assert_eq!(tree.get(b"k1").unwrap(), None);
	assert!(!tree.exists(b"k1").unwrap());
}

#[test]
fn tree_iter_is_key_ordered() {
	let engine = MemoryEngine::new();
	let tree = engine.open_tree("translation").unwrap();
	tree.put(b"003", b"c").unwrap();
	tree.put(b"001", b"a").unwrap();
	tree.put(b"002", b"b").unwrap();

	let keys: Vec<Vec<u8>> = tree.iter().unwrap().map(|(k, _)| k).collect();
	assert_eq!(keys, vec![b"001".to_vec(), b"002".to_vec(), b"003".to_vec()]);
	assert_eq!(tree.len().unwrap(), 3);
}

#[test]
fn tree_iter_from_excludes_the_boundary_key() {
	let engine = MemoryEngine::new();
	let tree = engine.open_tree("translation").unwrap();
	tree.put(b"001", b"a").unwrap();
	tree.put(b"002", b"b").unwrap();
	tree.put(b"003", b"c").unwrap();

	let rest: Vec<Vec<u8>> = tree.iter_from(b"001").unwrap().map(|(k, _)| k).collect();
	assert_eq!(rest, vec![b"002".to_vec(), b"003".to_vec()]);

	let all: Vec<Vec<u8>> = tree.iter_from(b"000").unwrap().map(|(k, _)| k).collect();
	assert_eq!(all, vec![b"001".to_vec(), b"002".to_vec(), b"003".to_vec()]);
}
