//! The distribution table: a pure function of the ordered member list, the
//! replication factor, and the address-space size. Nothing here touches
//! storage or the network; it is rebuilt from scratch whenever membership
//! or the replication factor changes.
use cluster_util::data::MemberName;
use cluster_util::Error;

/// Default address-space size, `2^64 - 1`.
pub const DEFAULT_ADDRESS_SPACE_SIZE: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct DistributionTable {
	members: Vec<MemberName>,
	replication_factor: usize,
	address_space_size: u64,
	/// Start of each member's owned range, parallel to `members`.
	range_starts: Vec<u64>,
}

impl DistributionTable {
	pub fn new(
		members: Vec<MemberName>,
		replication_factor: usize,
		address_space_size: u64,
	) -> Result<Self, Error> {
		let n = members.len();
		if replication_factor < 1 || replication_factor > n {
			return Err(Error::ConfigError(format!(
				"replication factor {} invalid for {} member(s)",
				replication_factor, n
			)));
		}
		let member_range = address_space_size / (n as u64);
		let range_starts = (0..n).map(|i| i as u64 * member_range).collect();
		debug!(
			"distribution table rebuilt: {} member(s), replication factor {}",
			n, replication_factor
		);
		Ok(Self {
			members,
			replication_factor,
			address_space_size,
			range_starts,
		})
	}

	pub fn members(&self) -> &[MemberName] {
		&self.members
	}

	pub fn replication_factor(&self) -> usize {
		self.replication_factor
	}

	fn index_of(&self, name: &MemberName) -> Option<usize> {
		self.members.iter().position(|m| m == name)
	}

	/// The inclusive range `M[i]` owns. The last member's range reaches
	/// `address_space_size` regardless of the division remainder.
	pub fn member_range(&self, name: &MemberName) -> Option<(u64, u64)> {
		let i = self.index_of(name)?;
		Some(self.range_at(i))
	}

	fn range_at(&self, i: usize) -> (u64, u64) {
		let start = self.range_starts[i];
		let end = if i + 1 == self.members.len() {
			self.address_space_size
		} else {
			self.range_starts[i + 1] - 1
		};
		(start, end)
	}

	/// Index of the member whose range owns `loc`: the last member whose
	/// range start is `<= loc`.
	fn primary_index(&self, loc: u64) -> usize {
		match self.range_starts.binary_search(&loc) {
			Ok(i) => i,
			Err(0) => 0,
			Err(i) => i - 1,
		}
	}

	fn replica_indices(&self, i: usize) -> Vec<usize> {
		let n = self.members.len();
		(1..self.replication_factor)
			.map(|offset| (i + offset) % n)
			.collect()
	}

	/// The `r - 1` members that replicate `name`'s owned range.
	pub fn replicas(&self, name: &MemberName) -> Vec<MemberName> {
		match self.index_of(name) {
			Some(i) => self
				.replica_indices(i)
				.into_iter()
				.map(|j| self.members[j].clone())
				.collect(),
			None => Vec::new(),
		}
	}

	/// Union of the ranges `name` replicates on behalf of other members
	/// (not including `name`'s own owned range).
	pub fn replication_range(&self, name: &MemberName) -> Vec<(u64, u64)> {
		let n = self.members.len();
		(0..n)
			.filter(|&j| self.replica_indices(j).iter().any(|&k| self.members[k] == *name))
			.map(|j| self.range_at(j))
			.collect()
	}

	/// Primary member and its replicas for the cluster location `loc`.
	pub fn location_home(&self, loc: u64) -> (MemberName, Vec<MemberName>) {
		let i = self.primary_index(loc);
		let replicas = self
			.replica_indices(i)
			.into_iter()
			.map(|j| self.members[j].clone())
			.collect();
		(self.members[i].clone(), replicas)
	}

	/// Every member in `loc`'s replication group other than `own_self`: if
	/// `own_self` is the primary, its replicas; otherwise the primary plus
	/// the other replicas.
	pub fn other_replication_members(&self, loc: u64, own_self: &MemberName) -> Vec<MemberName> {
		let (primary, replicas) = self.location_home(loc);
		let mut group = Vec::with_capacity(replicas.len() + 1);
		if &primary != own_self {
			group.push(primary);
		}
		group.extend(replicas.into_iter().filter(|m| m != own_self));
		group
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn names(names: &[&str]) -> Vec<MemberName> {
		names.iter().map(|s| MemberName::from(*s)).collect()
	}

	#[test]
	fn rejects_invalid_replication_factor() {
		let m = names(&["a", "b"]);
		assert!(DistributionTable::new(m.clone(), 0, 100).is_err());
		assert!(DistributionTable::new(m, 3, 100).is_err());
	}

	#[test]
	fn last_member_range_reaches_address_space_size() {
		let table = DistributionTable::new(names(&["a", "b", "c"]), 2, 10).unwrap();
		assert_eq!(table.member_range(&MemberName::from("a")), Some((0, 2)));
		assert_eq!(table.member_range(&MemberName::from("b")), Some((3, 5)));
		assert_eq!(table.member_range(&MemberName::from("c")), Some((6, 10)));
	}

	#[test]
	fn replicas_wrap_around() {
		let table = DistributionTable::new(names(&["a", "b", "c"]), 2, 9).unwrap();
		assert_eq!(table.replicas(&MemberName::from("c")), names(&["a"]));
	}

	#[test]
	fn location_home_matches_member_range() {
		let table = DistributionTable::new(names(&["a", "b", "c"]), 2, 9).unwrap();
		let (primary, replicas) = table.location_home(4);
		assert_eq!(primary, MemberName::from("b"));
		assert_eq!(replicas, names(&["c"]));
	}

	#[test]
	fn other_replication_members_excludes_self() {
		let table = DistributionTable::new(names(&["a", "b", "c"]), 2, 9).unwrap();
		let from_primary = table.other_replication_members(4, &MemberName::from("b"));
		assert_eq!(from_primary, names(&["c"]));
		let from_replica = table.other_replication_members(4, &MemberName::from("c"));
		assert_eq!(from_replica, names(&["b"]));
	}
}
