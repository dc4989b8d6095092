//! The address table (C2): a per-member persistent map `(storeName,
//! clusterLoc) -> (localLoc, version)` plus a pending transfer queue of
//! deferred replica operations, and the per-store counter used to allocate
//! fresh cluster locations within this member's owned range.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cluster_db::{Engine, Tree};
use cluster_util::data::{MemberName, TransferRec};
use cluster_util::time::{msec_key, now_msec};
use cluster_util::Error;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use cluster_rpc::layout::DistributionTable;

/// `0` is reserved to mean "no such location"; it is never handed out by
/// [`AddressTable::new_cluster_loc`].
pub const RESERVED_LOC: u64 = 0;

/// One translation table entry: where the blob actually lives locally, and
/// the monotonic version last written for this cluster location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRec {
	pub local_loc: u64,
	pub version: u64,
}

/// Injected by the daemon wiring so a freshly joined member (whose counter
/// is still at the start of its owned range) can ask the rest of the
/// cluster whether a candidate location is already taken, instead of only
/// consulting its own translation table. Without one registered, candidates
/// are tested locally only.
#[async_trait]
pub trait ClusterExistenceCheck: Send + Sync {
	async fn cluster_exists(&self, store: &str, loc: u64) -> Result<bool, Error>;
}

fn translation_key(store: &str, loc: u64) -> Vec<u8> {
	format!("t{}#{}", store, loc).into_bytes()
}

fn counter_key(store: &str) -> Vec<u8> {
	format!("n{}", store).into_bytes()
}

/// Parses a translation key back into `(store, loc)`. Store names must not
/// contain `#`.
fn parse_translation_key(key: &[u8]) -> Option<(String, u64)> {
	let s = std::str::from_utf8(key).ok()?;
	let s = s.strip_prefix('t')?;
	let (store, loc) = s.rsplit_once('#')?;
	Some((store.to_string(), loc.parse().ok()?))
}

pub struct AddressTable {
	translation: Box<dyn Tree>,
	transfer: Box<dyn Tree>,
	counters: Mutex<HashMap<String, u64>>,
	existence_check: Mutex<Option<Arc<dyn ClusterExistenceCheck>>>,
}

impl AddressTable {
	pub fn new(engine: &dyn Engine) -> Result<Self, Error> {
		Ok(Self {
			translation: engine.open_tree("translation")?,
			transfer: engine.open_tree("transfer")?,
			counters: Mutex::new(HashMap::new()),
			existence_check: Mutex::new(None),
		})
	}

	pub fn set_existence_check(&self, checker: Arc<dyn ClusterExistenceCheck>) {
		*self.existence_check.lock() = Some(checker);
	}

	// ---- translation CRUD ----

	pub fn trans(&self, store: &str, loc: u64) -> Result<Option<TranslationRec>, Error> {
		match self.translation.get(&translation_key(store, loc))? {
			Some(bytes) => Ok(Some(
				bincode::deserialize(&bytes)
					.map_err(|e| Error::Storage(cluster_db::Error::Corrupt(e.to_string())))?,
			)),
			None => Ok(None),
		}
	}

	pub fn set_trans(&self, store: &str, loc: u64, local_loc: u64, version: u64) -> Result<(), Error> {
		let rec = TranslationRec { local_loc, version };
		let bytes = bincode::serialize(&rec).expect("TranslationRec always serializes");
		self.translation.put(&translation_key(store, loc), &bytes)?;
		self.translation.flush()?;
		Ok(())
	}

	pub fn remove_trans(&self, store: &str, loc: u64) -> Result<(), Error> {
		self.translation.remove(&translation_key(store, loc))?;
		self.translation.flush()?;
		Ok(())
	}

	/// Every `(store, loc, rec)` currently held locally, in key order. Used
	/// by the rebalance worker to build its gossip chunks.
	pub fn iter_translations(&self) -> Result<Vec<(String, u64, TranslationRec)>, Error> {
		let mut out = Vec::new();
		for (key, value) in self.translation.iter()? {
			let Some((store, loc)) = parse_translation_key(&key) else {
				continue;
			};
			let rec: TranslationRec = bincode::deserialize(&value)
				.map_err(|e| Error::Storage(cluster_db::Error::Corrupt(e.to_string())))?;
			out.push((store, loc, rec));
		}
		Ok(out)
	}

	// ---- transfer queue ----

	pub fn add_transfer_request(
		&self,
		targets: Vec<MemberName>,
		request: cluster_util::data::DataRequest,
	) -> Result<(), Error> {
		let rec = TransferRec { targets, request };
		let bytes = bincode::serialize(&rec).expect("TransferRec always serializes");
		loop {
			let key = msec_key(now_msec());
			if self.transfer.exists(key.as_bytes())? {
				std::thread::sleep(std::time::Duration::from_millis(1));
				continue;
			}
			self.transfer.put(key.as_bytes(), &bytes)?;
			self.transfer.flush()?;
			return Ok(());
		}
	}

	pub fn iter_transfers(&self) -> Result<Vec<(Vec<u8>, TransferRec)>, Error> {
		let mut out = Vec::new();
		for (key, value) in self.transfer.iter()? {
			let rec: TransferRec = bincode::deserialize(&value)
				.map_err(|e| Error::Storage(cluster_db::Error::Corrupt(e.to_string())))?;
			out.push((key, rec));
		}
		Ok(out)
	}

	pub fn set_transfer(&self, key: &[u8], rec: &TransferRec) -> Result<(), Error> {
		let bytes = bincode::serialize(rec).expect("TransferRec always serializes");
		self.transfer.put(key, &bytes)?;
		self.transfer.flush()?;
		Ok(())
	}

	pub fn remove_transfer(&self, key: &[u8]) -> Result<(), Error> {
		self.transfer.remove(key)?;
		self.transfer.flush()?;
		Ok(())
	}

	// ---- cluster location allocation ----

	/// Allocates a fresh cluster location for `store` within `self_member`'s
	/// owned range under `dt`. `0` is reserved and is silently skipped if
	/// the scan ever lands on it.
	pub async fn new_cluster_loc(
		&self,
		store: &str,
		dt: &DistributionTable,
		self_member: &MemberName,
	) -> Result<u64, Error> {
		let (range_start, range_end) = dt
			.member_range(self_member)
			.ok_or_else(|| Error::ClusterState(format!("{} owns no range in the current distribution table", self_member)))?;

		let mut counters = self.counters.lock();
		let counter = match counters.get(store).copied() {
			Some(c) => c,
			None => self.load_counter(store)?.max(range_start),
		};
		let fresh_join = counter <= range_start;
		let start_candidate = counter.max(range_start);
		drop(counters);

		let mut candidate = start_candidate;
		loop {
			if candidate > range_end {
				return Err(Error::Exhausted(format!(
					"no free cluster location for store {:?} in range [{}, {}]",
					store, range_start, range_end
				)));
			}
			if candidate == RESERVED_LOC {
				candidate += 1;
				continue;
			}

			let taken = if fresh_join {
				match self.existence_check.lock().clone() {
					Some(checker) => checker.cluster_exists(store, candidate).await?,
					None => self.trans(store, candidate)?.is_some(),
				}
			} else {
				self.trans(store, candidate)?.is_some()
			};

			if !taken {
				self.store_counter(store, candidate + 1)?;
				debug!("allocated cluster location {} for store {:?}", candidate, store);
				return Ok(candidate);
			}
			candidate += 1;
		}
	}

	fn load_counter(&self, store: &str) -> Result<u64, Error> {
		match self.translation.get(&counter_key(store))? {
			Some(bytes) if bytes.len() == 8 => {
				let mut buf = [0u8; 8];
				buf.copy_from_slice(&bytes);
				Ok(u64::from_be_bytes(buf))
			}
			_ => Ok(0),
		}
	}

	fn store_counter(&self, store: &str, value: u64) -> Result<(), Error> {
		self.counters.lock().insert(store.to_string(), value);
		self.translation.put(&counter_key(store), &value.to_be_bytes())?;
		self.translation.flush()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use cluster_db::memory::MemoryEngine;

	fn dt() -> DistributionTable {
		DistributionTable::new(
			vec![MemberName::from("a"), MemberName::from("b")],
			1,
			10,
		)
		.unwrap()
	}

	#[tokio::test]
	async fn allocates_within_owned_range_and_skips_zero() {
		let engine = MemoryEngine::new();
		let table = AddressTable::new(&engine).unwrap();
		let dt = dt();
		let a = MemberName::from("a");

		let loc = table.new_cluster_loc("ls_test", &dt, &a).await.unwrap();
		assert_ne!(loc, RESERVED_LOC);
		let (start, end) = dt.member_range(&a).unwrap();
		assert!(loc >= start && loc <= end);
	}

	#[tokio::test]
	async fn scans_past_taken_locations() {
		let engine = MemoryEngine::new();
		let table = AddressTable::new(&engine).unwrap();
		let dt = dt();
		let a = MemberName::from("a");

		let first = table.new_cluster_loc("ls_test", &dt, &a).await.unwrap();
		let second = table.new_cluster_loc("ls_test", &dt, &a).await.unwrap();
		assert_ne!(first, second);
	}

	#[tokio::test]
	async fn exhausts_when_range_is_full() {
		let engine = MemoryEngine::new();
		let table = AddressTable::new(&engine).unwrap();
		// A single-location range (member "a" in a 2-member, size-2 space).
		let dt = DistributionTable::new(vec![MemberName::from("a"), MemberName::from("b")], 1, 2).unwrap();
		let a = MemberName::from("a");
		// "a" owns just loc 0, which is reserved, so allocation must fail
		// immediately rather than hand out 0.
		assert!(table.new_cluster_loc("ls_test", &dt, &a).await.is_err());
	}

	#[test]
	fn translation_round_trips() {
		let engine = MemoryEngine::new();
		let table = AddressTable::new(&engine).unwrap();
		assert_eq!(table.trans("ls_test", 5).unwrap(), None);
		table.set_trans("ls_test", 5, 42, 1).unwrap();
		assert_eq!(
			table.trans("ls_test", 5).unwrap(),
			Some(TranslationRec { local_loc: 42, version: 1 })
		);
		table.remove_trans("ls_test", 5).unwrap();
		assert_eq!(table.trans("ls_test", 5).unwrap(), None);
	}

	#[test]
	fn transfer_queue_round_trips_in_key_order() {
		let engine = MemoryEngine::new();
		let table = AddressTable::new(&engine).unwrap();
		table
			.add_transfer_request(
				vec![MemberName::from("b")],
				cluster_util::data::DataRequest::GetMain,
			)
			.unwrap();
		table
			.add_transfer_request(
				vec![MemberName::from("c")],
				cluster_util::data::DataRequest::GetMain,
			)
			.unwrap();
		let all = table.iter_transfers().unwrap();
		assert_eq!(all.len(), 2);
		assert_eq!(all[0].1.targets, vec![MemberName::from("b")]);
	}
}
