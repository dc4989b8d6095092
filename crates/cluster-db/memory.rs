//! In-memory `Engine`, used by tests and by the in-process multi-member
//! test harness.
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::Error;
use crate::{Engine, Store, Tree};

#[derive(Default)]
pub struct MemoryEngine {
	stores: Mutex<std::collections::HashMap<String, std::sync::Arc<MemoryStore>>>,
	trees: Mutex<std::collections::HashMap<String, std::sync::Arc<MemoryTree>>>,
}

impl MemoryEngine {
	pub fn new() -> Self {
		Self::default()
	}
}

impl Engine for MemoryEngine {
	fn open_store(&self, name: &str) -> Result<Box<dyn Store>, Error> {
		let mut stores = self.stores.lock().unwrap();
		let store = stores
			.entry(name.to_string())
			.or_insert_with(|| std::sync::Arc::new(MemoryStore::default()))
			.clone();
		Ok(Box::new(ArcStore(store)))
	}

	fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>, Error> {
		let mut trees = self.trees.lock().unwrap();
		let tree = trees
			.entry(name.to_string())
			.or_insert_with(|| std::sync::Arc::new(MemoryTree::default()))
			.clone();
		Ok(Box::new(ArcTree(tree)))
	}
}

#[derive(Default)]
struct MemoryStore {
	inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
	slots: BTreeMap<u64, Vec<u8>>,
	roots: BTreeMap<u64, u64>,
	next_loc: u64,
}

struct ArcStore(std::sync::Arc<MemoryStore>);

impl Store for ArcStore {
	fn insert(&self, value: &[u8]) -> Result<u64, Error> {
		let mut inner = self.0.inner.lock().unwrap();
		inner.next_loc += 1;
		let loc = inner.next_loc;
		inner.slots.insert(loc, value.to_vec());
		Ok(loc)
	}

	fn update(&self, loc: u64, value: &[u8]) -> Result<(), Error> {
		let mut inner = self.0.inner.lock().unwrap();
		inner.slots.insert(loc, value.to_vec());
		Ok(())
	}

	fn fetch(&self, loc: u64) -> Result<Vec<u8>, Error> {
		let inner = self.0.inner.lock().unwrap();
		inner
			.slots
			.get(&loc)
			.cloned()
			.ok_or(Error::NoSuchLocalLoc {
				store: "<memory>".into(),
				loc,
			})
	}

	fn exists(&self, loc: u64) -> Result<bool, Error> {
		let inner = self.0.inner.lock().unwrap();
		Ok(inner.slots.contains_key(&loc))
	}

	fn free(&self, loc: u64) -> Result<(), Error> {
		let mut inner = self.0.inner.lock().unwrap();
		inner.slots.remove(&loc);
		Ok(())
	}

	fn get_root(&self, root_id: u64) -> Result<u64, Error> {
		let inner = self.0.inner.lock().unwrap();
		Ok(inner.roots.get(&root_id).copied().unwrap_or(0))
	}

	fn set_root(&self, root_id: u64, value: u64) -> Result<(), Error> {
		let mut inner = self.0.inner.lock().unwrap();
		inner.roots.insert(root_id, value);
		Ok(())
	}

	fn flush(&self) -> Result<(), Error> {
		Ok(())
	}
}

#[derive(Default)]
struct MemoryTree {
	inner: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

struct ArcTree(std::sync::Arc<MemoryTree>);

impl Tree for ArcTree {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
		Ok(self.0.inner.lock().unwrap().get(key).cloned())
	}

	fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
		self.0
			.inner
			.lock()
			.unwrap()
			.insert(key.to_vec(), value.to_vec());
		Ok(())
	}

	fn remove(&self, key: &[u8]) -> Result<(), Error> {
		self.0.inner.lock().unwrap().remove(key);
		Ok(())
	}

	fn iter(&self) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, Error> {
		let snapshot: Vec<_> = self
			.0
			.inner
			.lock()
			.unwrap()
			.iter()
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		Ok(Box::new(snapshot.into_iter()))
	}

	fn iter_from(&self, from: &[u8]) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, Error> {
		let from = from.to_vec();
		let snapshot: Vec<_> = self
			.0
			.inner
			.lock()
			.unwrap()
			.range::<Vec<u8>, _>((std::ops::Bound::Excluded(from), std::ops::Bound::Unbounded))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		Ok(Box::new(snapshot.into_iter()))
	}

	fn len(&self) -> Result<usize, Error> {
		Ok(self.0.inner.lock().unwrap().len())
	}

	fn flush(&self) -> Result<(), Error> {
		Ok(())
	}
}
