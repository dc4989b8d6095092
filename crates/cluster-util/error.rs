//! Error taxonomy for the clustering core.
use std::io;

use thiserror::Error;

/// All errors the clustering core can return to a caller.
#[derive(Debug, Error)]
pub enum Error {
	/// Network-level failure talking to a peer (dial, read, write, timeout).
	#[error("Member communication error with {0}: {1}")]
	MemberComm(String, String),

	/// A remote peer answered with an application-level failure.
	#[error("Member error: {0}")]
	MemberError(String),

	/// Bad configuration (replication factor, duplicate join, missing RPC address).
	#[error("Configuration error: {0}")]
	ConfigError(String),

	/// No reachable peer, or too many members have failed.
	#[error("Cluster state error: {0}")]
	ClusterState(String),

	#[error("Unknown peer: {0}")]
	UnknownPeer(String),

	#[error("Unknown RPC target: {0}")]
	UnknownTarget(String),

	#[error("Invalid authentication token")]
	InvalidToken,

	#[error("{0} is not a member of this cluster")]
	NotMember(String),

	#[error("Lock {0:?} is already held by another member")]
	LockTaken(String),

	#[error("Lock {0:?} is not held by this member")]
	LockNotOwned(String),

	#[error("Storage disabled: {0}")]
	StorageDisabled(String),

	#[error("Cluster slot not found ({member} - Location: {loc})")]
	NotFound { member: String, loc: u64 },

	/// No free cluster location remains in a member's owned range.
	#[error("Exhausted: {0}")]
	Exhausted(String),

	/// `FetchCached` never has anything cached; every call lands here.
	#[error("Not in cache")]
	NotInCache,

	/// Catch-all for conditions that don't need their own taxonomy entry.
	#[error("ClusterError: {0}")]
	Message(String),

	#[error(transparent)]
	Io(#[from] io::Error),

	#[error(transparent)]
	Storage(#[from] cluster_db::Error),
}

impl Error {
	/// Network-class errors are the ones the storage façade retries against
	/// replicas, and that member housekeeping uses to mark a peer failed.
	pub fn is_network_class(&self) -> bool {
		matches!(self, Error::MemberComm(..) | Error::UnknownTarget(_))
	}

	pub fn unexpected_rpc_message<M: std::fmt::Debug>(m: M) -> Self {
		Error::Message(format!("Unexpected RPC message: {:?}", m))
	}

	pub fn member_comm(member: impl Into<String>, cause: impl std::fmt::Display) -> Self {
		Error::MemberComm(member.into(), cause.to_string())
	}
}

impl From<String> for Error {
	fn from(s: String) -> Error {
		Error::Message(s)
	}
}

impl From<&str> for Error {
	fn from(s: &str) -> Error {
		Error::Message(s.to_string())
	}
}

/// Turns an `Option` into a `Result<_, Error>` without writing out a
/// closure at every call site.
pub trait OkOrMessage<T> {
	fn ok_or_message<M: Into<String>>(self, msg: M) -> Result<T, Error>;
}

impl<T> OkOrMessage<T> for Option<T> {
	fn ok_or_message<M: Into<String>>(self, msg: M) -> Result<T, Error> {
		self.ok_or_else(|| Error::Message(msg.into()))
	}
}

/// Attaches context to an error as it propagates up the call stack.
pub trait ErrContext<T> {
	fn err_context<M: Into<String>>(self, ctx: M) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ErrContext<T> for Result<T, E> {
	fn err_context<M: Into<String>>(self, ctx: M) -> Result<T, Error> {
		self.map_err(|e| {
			let inner: Error = e.into();
			Error::Message(format!("{}: {}", ctx.into(), inner))
		})
	}
}
