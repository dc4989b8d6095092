//! Transfer worker (C4): drains the address table's pending transfer queue
//! in timestamp order, delivering each deferred request to every target
//! that hasn't yet acknowledged it. Targets that error stay pending for the
//! next pass; a record with no targets left is removed. Single-flight:
//! a pass already running makes a concurrent call return immediately
//! instead of queuing up behind it.
use std::sync::Arc;

use async_trait::async_trait;
use cluster_util::background::{Worker, WorkerState};
use cluster_util::data::TransferRec;
use cluster_util::Error;
use log::{debug, warn};
use tokio::sync::{watch, Mutex};

use cluster_rpc::system::System;

use crate::address_table::AddressTable;
use crate::rebalance_worker::RebalanceWorker;

pub struct TransferWorker {
	system: Arc<System>,
	address_table: Arc<AddressTable>,
	rebalance: Arc<RebalanceWorker>,
	running: Mutex<()>,
}

impl TransferWorker {
	pub fn new(system: Arc<System>, address_table: Arc<AddressTable>, rebalance: Arc<RebalanceWorker>) -> Arc<Self> {
		Arc::new(Self {
			system,
			address_table,
			rebalance,
			running: Mutex::new(()),
		})
	}

	/// Runs one drain pass. Returns immediately without doing anything if
	/// another pass is already in flight.
	pub async fn run_once(&self) -> Result<(), Error> {
		let _guard = match self.running.try_lock() {
			Ok(g) => g,
			Err(_) => return Ok(()),
		};

		let records = self.address_table.iter_transfers()?;
		for (key, rec) in records {
			let TransferRec { targets, request } = rec;
			let mut remaining = Vec::new();
			for target in targets {
				let Some(addr) = self.system.peer_addr(&target) else {
					remaining.push(target);
					continue;
				};
				match self.system.send_data_request(&target, addr, request.clone()).await {
					Ok(_) => {}
					Err(e) => {
						debug!("transfer to {} still pending: {}", target, e);
						remaining.push(target);
					}
				}
			}
			if remaining.is_empty() {
				self.address_table.remove_transfer(&key)?;
			} else {
				self.address_table.set_transfer(
					&key,
					&TransferRec {
						targets: remaining,
						request,
					},
				)?;
			}
		}

		self.rebalance.tick().await;
		Ok(())
	}
}

#[async_trait]
impl Worker for TransferWorker {
	fn name(&self) -> String {
		format!("transfer-worker({})", self.system.member_name())
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerState, Error> {
		if let Err(e) = self.run_once().await {
			warn!("transfer worker pass failed: {}", e);
		}
		Ok(WorkerState::Idle)
	}

	fn idle_delay(&self) -> std::time::Duration {
		std::time::Duration::from_secs(1)
	}
}
