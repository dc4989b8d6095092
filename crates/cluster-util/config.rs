//! Configuration loading.
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, ErrContext};

/// Parsed `cluster.toml` configuration.
///
/// Recognized keys cover cluster membership and replication, plus the
/// ambient keys every daemon in this style needs (metadata directory,
/// worker intervals).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// Local RPC listener address, `host:port` (`ClusterMemberRPC`).
	pub rpc_bind_addr: SocketAddr,

	/// Unique member name (`ClusterMemberName`).
	pub member_name: String,

	/// Shared secret, never transmitted (`ClusterSecret`).
	pub cluster_secret: String,

	/// Replication factor, read only at initial cluster formation
	/// (`ReplicationFactor`).
	pub replication_factor: usize,

	/// Directory holding persisted state info, address table, and
	/// transfer queue.
	#[serde(default = "default_metadata_dir")]
	pub metadata_dir: PathBuf,

	/// Bootstrap peers to try connecting to at startup, `name@host:port`.
	#[serde(default)]
	pub bootstrap_peers: Vec<String>,

	/// Rebalance worker period, in ticks of the transfer worker.
	#[serde(default = "default_rebalance_interval")]
	pub rebalance_housekeeping_interval: u32,

	/// Housekeeping loop mean period, in milliseconds.
	#[serde(default = "default_housekeeping_freq_msec")]
	pub housekeeping_freq_msec: u64,

	/// Address-space size override, used by tests. Defaults to `2^64-1`.
	#[serde(default)]
	pub address_space_size: Option<u64>,
}

fn default_metadata_dir() -> PathBuf {
	PathBuf::from("./meta")
}

fn default_rebalance_interval() -> u32 {
	10
}

fn default_housekeeping_freq_msec() -> u64 {
	10_000
}

/// Read and parse a configuration file from disk.
pub fn read_config(path: impl AsRef<Path>) -> Result<Config, Error> {
	let path = path.as_ref();
	let data = fs::read_to_string(path)
		.err_context(format!("Unable to read config file {}", path.display()))?;
	let config: Config = toml::from_str(&data)
		.err_context(format!("Unable to parse config file {}", path.display()))?;
	if config.replication_factor < 1 {
		return Err(Error::ConfigError(
			"ReplicationFactor must be >= 1".into(),
		));
	}
	Ok(config)
}
