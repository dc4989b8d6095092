//! Sled-backed persistent `Engine`, the default storage backend for a
//! deployed member process.
use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::{Engine, Store, Tree};

pub struct SledEngine {
	db: sled::Db,
}

impl SledEngine {
	pub fn open(path: &std::path::Path) -> Result<Self, Error> {
		let db = sled::open(path)?;
		Ok(Self { db })
	}
}

impl Engine for SledEngine {
	fn open_store(&self, name: &str) -> Result<Box<dyn Store>, Error> {
		let slots = self.db.open_tree(format!("store__{}__slots", name))?;
		let roots = self.db.open_tree(format!("store__{}__roots", name))?;
		let next_loc = slots
			.iter()
			.keys()
			.last()
			.transpose()?
			.map(|k| u64::from_be_bytes(k[..8].try_into().unwrap()))
			.unwrap_or(0);
		Ok(Box::new(SledStore {
			slots,
			roots,
			next_loc: AtomicU64::new(next_loc),
		}))
	}

	fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>, Error> {
		let tree = self.db.open_tree(format!("tree__{}", name))?;
		Ok(Box::new(SledTree(tree)))
	}
}

struct SledStore {
	slots: sled::Tree,
	roots: sled::Tree,
	next_loc: AtomicU64,
}

impl Store for SledStore {
	fn insert(&self, value: &[u8]) -> Result<u64, Error> {
		let loc = self.next_loc.fetch_add(1, Ordering::SeqCst) + 1;
		self.slots.insert(loc.to_be_bytes(), value)?;
		Ok(loc)
	}

	fn update(&self, loc: u64, value: &[u8]) -> Result<(), Error> {
		self.slots.insert(loc.to_be_bytes(), value)?;
		Ok(())
	}

	fn fetch(&self, loc: u64) -> Result<Vec<u8>, Error> {
		self.slots
			.get(loc.to_be_bytes())?
			.map(|v| v.to_vec())
			.ok_or(Error::NoSuchLocalLoc {
				store: "<sled>".into(),
				loc,
			})
	}

	fn exists(&self, loc: u64) -> Result<bool, Error> {
		Ok(self.slots.contains_key(loc.to_be_bytes())?)
	}

	fn free(&self, loc: u64) -> Result<(), Error> {
		self.slots.remove(loc.to_be_bytes())?;
		Ok(())
	}

	fn get_root(&self, root_id: u64) -> Result<u64, Error> {
		Ok(self
			.roots
			.get(root_id.to_be_bytes())?
			.map(|v| u64::from_be_bytes(v[..8].try_into().unwrap()))
			.unwrap_or(0))
	}

	fn set_root(&self, root_id: u64, value: u64) -> Result<(), Error> {
		self.roots
			.insert(root_id.to_be_bytes(), &value.to_be_bytes()[..])?;
		Ok(())
	}

	fn flush(&self) -> Result<(), Error> {
		self.slots.flush()?;
		self.roots.flush()?;
		Ok(())
	}
}

struct SledTree(sled::Tree);

impl Tree for SledTree {
	fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
		Ok(self.0.get(key)?.map(|v| v.to_vec()))
	}

	fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
		self.0.insert(key, value)?;
		Ok(())
	}

	fn remove(&self, key: &[u8]) -> Result<(), Error> {
		self.0.remove(key)?;
		Ok(())
	}

	fn iter(&self) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, Error> {
		let items: Result<Vec<_>, sled::Error> = self
			.0
			.iter()
			.map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())))
			.collect();
		Ok(Box::new(items?.into_iter()))
	}

	fn iter_from(&self, from: &[u8]) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)>>, Error> {
		let items: Result<Vec<_>, sled::Error> = self
			.0
			.range(from.to_vec()..)
			.skip_while(|r| matches!(r, Ok((k, _)) if k.as_ref() == from))
			.map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())))
			.collect();
		Ok(Box::new(items?.into_iter()))
	}

	fn len(&self) -> Result<usize, Error> {
		Ok(self.0.len())
	}

	fn flush(&self) -> Result<(), Error> {
		self.0.flush()?;
		Ok(())
	}
}
