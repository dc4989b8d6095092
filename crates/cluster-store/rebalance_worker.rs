//! Rebalance worker (C5): periodically scans the local translation table
//! and gossips `(store, clusterLoc, version)` triples to every member that
//! should hold them under the current distribution table. Runs at most
//! once per `rebalance_housekeeping_interval` transfer-worker ticks unless
//! forced; self-gated the same way the transfer worker is single-flight.
use std::collections::HashSet;
use std::sync::Arc;

use cluster_util::data::{DataRequest, MemberName, RebalanceTriple};
use cluster_util::Error;
use log::{debug, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use cluster_rpc::system::System;

use crate::address_table::AddressTable;

/// Translations are gossiped in chunks of up to this many triples per RPC.
pub const MAX_SIZE_REBALANCE_LISTS: usize = 100;

pub struct RebalanceWorker {
	system: Arc<System>,
	address_table: Arc<AddressTable>,
	interval_ticks: u32,
	ticks_remaining: SyncMutex<u32>,
	running: Mutex<()>,
}

impl RebalanceWorker {
	pub fn new(system: Arc<System>, address_table: Arc<AddressTable>, interval_ticks: u32) -> Arc<Self> {
		Arc::new(Self {
			system,
			address_table,
			interval_ticks: interval_ticks.max(1),
			ticks_remaining: SyncMutex::new(interval_ticks.max(1)),
			running: Mutex::new(()),
		})
	}

	/// Called once per transfer-worker pass; runs a rebalance only once the
	/// interval has fully ticked down.
	pub async fn tick(&self) {
		let should_run = {
			let mut remaining = self.ticks_remaining.lock();
			*remaining = remaining.saturating_sub(1);
			*remaining == 0
		};
		if should_run {
			*self.ticks_remaining.lock() = self.interval_ticks;
			if let Err(e) = self.run_once().await {
				warn!("rebalance pass failed: {}", e);
			}
		}
	}

	/// Runs a rebalance pass immediately, bypassing the tick counter.
	pub async fn force(&self) -> Result<(), Error> {
		self.run_once().await
	}

	async fn run_once(&self) -> Result<(), Error> {
		let _guard = match self.running.try_lock() {
			Ok(g) => g,
			Err(_) => return Ok(()),
		};

		let dt = match self.system.distribution_table() {
			Some(dt) => dt,
			None => return Ok(()),
		};
		let self_name = self.system.member_name();

		let translations = self.address_table.iter_translations()?;
		for chunk in translations.chunks(MAX_SIZE_REBALANCE_LISTS) {
			let triples: Vec<RebalanceTriple> = chunk
				.iter()
				.map(|(store, cloc, rec)| RebalanceTriple {
					store: store.clone(),
					cloc: *cloc,
					version: rec.version,
				})
				.collect();

			let mut targets: HashSet<MemberName> = HashSet::new();
			for (_, cloc, _) in chunk {
				let (primary, replicas) = dt.location_home(*cloc);
				if &primary != self_name {
					targets.insert(primary);
				}
				for r in replicas {
					if &r != self_name {
						targets.insert(r);
					}
				}
			}

			for target in targets {
				let Some(addr) = self.system.peer_addr(&target) else {
					continue;
				};
				let req = DataRequest::Rebalance {
					src: self_name.clone(),
					triples: triples.clone(),
				};
				if let Err(e) = self.system.send_data_request(&target, addr, req).await {
					debug!("rebalance gossip to {} failed, will retry next pass: {}", target, e);
				}
			}
		}
		Ok(())
	}
}
