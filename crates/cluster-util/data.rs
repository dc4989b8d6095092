//! Core data types shared by every layer.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A member's stable name. Cheap to clone; used as a map key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberName(pub String);

impl MemberName {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MemberName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for MemberName {
	fn from(s: &str) -> Self {
		MemberName(s.to_string())
	}
}

impl From<String> for MemberName {
	fn from(s: String) -> Self {
		MemberName(s)
	}
}

/// Logical timestamp attached to a state-info version.
///
/// Ordered lexicographically by `(counter, author)`, not by author first:
/// two members racing to bump the counter must compare by the counter they
/// actually produced before falling back to name, or a "linear successor"
/// check would reject updates that are newer in wall-clock terms just
/// because the author name sorts lower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalTime {
	pub author: MemberName,
	pub counter: u64,
}

impl LogicalTime {
	pub fn zero(author: MemberName) -> Self {
		LogicalTime { author, counter: 0 }
	}

	pub fn next(&self, author: MemberName) -> Self {
		LogicalTime {
			author,
			counter: self.counter + 1,
		}
	}
}

impl PartialOrd for LogicalTime {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for LogicalTime {
	fn cmp(&self, other: &Self) -> Ordering {
		self.counter
			.cmp(&other.counter)
			.then_with(|| self.author.cmp(&other.author))
	}
}

/// Shared cluster state info: membership, failures, and the replication
/// factor, approximately replicated by the gossip/housekeeping loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInfo {
	/// First entry is the local member; order defines the distribution
	/// table.
	pub members: Vec<(MemberName, SocketAddr)>,
	pub failed: Vec<(MemberName, String)>,
	pub replication: usize,
	pub ts: LogicalTime,
	pub tsold: LogicalTime,
}

impl StateInfo {
	pub fn member_names(&self) -> Vec<MemberName> {
		self.members.iter().map(|(name, _)| name.clone()).collect()
	}
}

/// One deferred replica operation, retried by the transfer worker until
/// every target member acknowledges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRec {
	pub targets: Vec<MemberName>,
	pub request: DataRequest,
}

/// `(store, clusterLoc, version)`, gossiped in batches by the rebalance
/// worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceTriple {
	pub store: String,
	pub cloc: u64,
	pub version: u64,
}

/// A tagged data request, replacing the source's untyped `{kind, args,
/// value}` record with one case per request kind carrying exactly the
/// fields it needs. `transfer` distinguishes a client-originated request
/// (must fan out to replicas) from one already delivered by the transfer
/// worker (must not fan out again).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataRequest {
	GetMain,
	SetMain {
		value: BTreeMap<String, Vec<u8>>,
		transfer: bool,
	},
	GetRoot {
		store: String,
		root_id: u64,
	},
	SetRoot {
		store: String,
		root_id: u64,
		value: u64,
		transfer: bool,
	},
	/// `cloc` is `None` on an originating insert (the callee allocates a
	/// fresh cluster location) and `Some` when replicating an insert whose
	/// location was already chosen by the primary.
	Insert {
		store: String,
		value: Vec<u8>,
		cloc: Option<u64>,
		transfer: bool,
	},
	/// `version` is `None` on an originating update (the callee bumps the
	/// stored version) and `Some` when replicating, carrying the version
	/// the sender wrote.
	Update {
		store: String,
		cloc: u64,
		value: Vec<u8>,
		version: Option<u64>,
		transfer: bool,
	},
	Free {
		store: String,
		cloc: u64,
		transfer: bool,
	},
	Fetch {
		store: String,
		cloc: u64,
	},
	Exists {
		store: String,
		cloc: u64,
	},
	Rebalance {
		src: MemberName,
		triples: Vec<RebalanceTriple>,
	},
}

/// Reply to a `DataRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataResponse {
	Ok,
	ClusterLoc(u64),
	Blob(Vec<u8>),
	Exists(bool),
	Map(BTreeMap<String, Vec<u8>>),
	Root(u64),
}
