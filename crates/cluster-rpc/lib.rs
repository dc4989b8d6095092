//! Cluster membership, gossip, locking, and the RPC surface that ties a
//! member process to its peers.
#[macro_use]
extern crate log;

pub mod layout;
pub mod locks;
pub mod surface;
pub mod system;
pub mod transport;

pub use layout::DistributionTable;
pub use system::System;
