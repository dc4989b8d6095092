//! Cluster-wide named locks: at most one holder per name across the
//! cluster. The member manager that owns this table is the one peers
//! calling `AcquireLock`/`ReleaseLock` talk to; this module only tracks
//! local holder state and the auto-expiry policy. The distributed
//! acquire/release protocol (fan out to every operational peer, unwind on
//! partial failure) lives in `system`.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use cluster_util::data::MemberName;
use cluster_util::Error;
use parking_lot::Mutex;

const LOCK_EXPIRY: Duration = Duration::from_secs(30);

struct LockEntry {
	holder: MemberName,
	acquired_at: Instant,
}

#[derive(Default)]
pub struct LockTable {
	locks: Mutex<HashMap<String, LockEntry>>,
}

impl LockTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Grants the lock to `holder` unless it is already held by someone
	/// else and hasn't expired. Re-acquiring a lock you already hold
	/// refreshes it.
	pub fn acquire(&self, name: &str, holder: &MemberName) -> Result<(), Error> {
		let mut locks = self.locks.lock();
		if let Some(entry) = locks.get(name) {
			if &entry.holder != holder && entry.acquired_at.elapsed() < LOCK_EXPIRY {
				return Err(Error::LockTaken(name.to_string()));
			}
		}
		locks.insert(
			name.to_string(),
			LockEntry {
				holder: holder.clone(),
				acquired_at: Instant::now(),
			},
		);
		Ok(())
	}

	pub fn release(&self, name: &str, holder: &MemberName) -> Result<(), Error> {
		let mut locks = self.locks.lock();
		match locks.get(name) {
			Some(entry) if &entry.holder == holder => {
				locks.remove(name);
				Ok(())
			}
			Some(entry) if entry.acquired_at.elapsed() >= LOCK_EXPIRY => {
				locks.remove(name);
				Ok(())
			}
			Some(_) => Err(Error::LockNotOwned(name.to_string())),
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_acquire_by_another_member_fails() {
		let table = LockTable::new();
		let a = MemberName::from("a");
		let b = MemberName::from("b");
		table.acquire("UpdateStateInfo", &a).unwrap();
		assert!(table.acquire("UpdateStateInfo", &b).is_err());
	}

	#[test]
	fn release_by_non_holder_fails() {
		let table = LockTable::new();
		let a = MemberName::from("a");
		let b = MemberName::from("b");
		table.acquire("UpdateStateInfo", &a).unwrap();
		assert!(table.release("UpdateStateInfo", &b).is_err());
		assert!(table.release("UpdateStateInfo", &a).is_ok());
	}

	#[test]
	fn reacquire_by_same_holder_refreshes() {
		let table = LockTable::new();
		let a = MemberName::from("a");
		table.acquire("x", &a).unwrap();
		table.acquire("x", &a).unwrap();
	}
}
