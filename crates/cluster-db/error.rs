use err_derive::Error;

/// Errors from the local storage engine / tree abstraction.
///
/// This crate wraps a pluggable single-node storage engine; it still needs
/// its own small error type so callers in `cluster-store` can tell a
/// missing slot from a corrupt on-disk structure.
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "Storage engine IO error: {}", _0)]
	Io(#[error(source)] std::io::Error),

	#[error(display = "Local location {} does not exist in store {:?}", loc, store)]
	NoSuchLocalLoc { store: String, loc: u64 },

	#[error(display = "Corrupt storage engine state: {}", _0)]
	Corrupt(String),

	#[cfg(feature = "sled")]
	#[error(display = "Sled error: {}", _0)]
	Sled(#[error(source)] sled::Error),
}
