//! Member storage (C3): the only holder of the local storage engine on this
//! member. Dispatches data requests arriving either from the RPC surface
//! (as an [`EndpointHandler`]-equivalent registered with [`System`]) or
//! in-process from the distributed storage façade, against local storage
//! plus the address table.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cluster_db::{Engine, Store, Tree};
use cluster_util::data::{DataRequest, DataResponse, MemberName, RebalanceTriple};
use cluster_util::Error;
use log::{debug, info, warn};

use cluster_rpc::system::{DataHandler, System};

use crate::address_table::AddressTable;

/// Plain operation counters; there is no full metrics/OTel wiring in this
/// workspace, but a deployed member still wants visibility into how much
/// work it is doing and how often replicas are lagging.
#[derive(Default)]
pub struct StorageMetrics {
	pub ops_dispatched: AtomicU64,
	pub not_found: AtomicU64,
	pub outdated_writes_dropped: AtomicU64,
}

impl StorageMetrics {
	fn record_op(&self) {
		self.ops_dispatched.fetch_add(1, Ordering::Relaxed);
	}
}

pub struct MemberStorage {
	engine: Arc<dyn Engine>,
	address_table: Arc<AddressTable>,
	system: Arc<System>,
	main_tree: Box<dyn Tree>,
	metrics: StorageMetrics,
}

/// User stores live under a fixed prefix on the wire, so a store named
/// `"objects"` by a caller never collides with the engine's own
/// translation/transfer trees.
fn local_store_name(store: &str) -> String {
	format!("ls_{}", store)
}

impl MemberStorage {
	pub fn new(engine: Arc<dyn Engine>, address_table: Arc<AddressTable>, system: Arc<System>) -> Result<Arc<Self>, Error> {
		let main_tree = engine.open_tree("maindb")?;
		Ok(Arc::new(Self {
			engine,
			address_table,
			system,
			main_tree,
			metrics: StorageMetrics::default(),
		}))
	}

	pub fn metrics(&self) -> &StorageMetrics {
		&self.metrics
	}

	pub fn address_table(&self) -> &Arc<AddressTable> {
		&self.address_table
	}

	fn operational_table(&self) -> Result<Arc<cluster_rpc::DistributionTable>, Error> {
		self.system
			.distribution_table()
			.ok_or_else(|| Error::StorageDisabled(self.system.disable_reason().unwrap_or_default()))
	}

	/// Sends a deferred operation to every target in `targets`, or enqueues
	/// it as a pending transfer record if `targets` is non-empty. Never
	/// fails the caller: replica fan-out failures are recorded for the
	/// transfer worker to retry.
	fn fan_out(&self, targets: Vec<MemberName>, req: DataRequest) -> Result<(), Error> {
		if targets.is_empty() {
			return Ok(());
		}
		self.address_table.add_transfer_request(targets, req)
	}

	async fn handle_get_main(&self) -> Result<DataResponse, Error> {
		let mut map = BTreeMap::new();
		for (key, value) in self.main_tree.iter()? {
			map.insert(String::from_utf8_lossy(&key).into_owned(), value);
		}
		Ok(DataResponse::Map(map))
	}

	async fn handle_set_main(&self, value: BTreeMap<String, Vec<u8>>, transfer: bool) -> Result<DataResponse, Error> {
		let existing: Vec<Vec<u8>> = self.main_tree.iter()?.map(|(k, _)| k).collect();
		for key in &existing {
			if !value.contains_key(&String::from_utf8_lossy(key).into_owned()) {
				self.main_tree.remove(key)?;
			}
		}
		for (key, v) in &value {
			self.main_tree.put(key.as_bytes(), v)?;
		}
		self.main_tree.flush()?;

		if !transfer {
			let dt = self.operational_table()?;
			let targets = dt.other_replication_members(0, self.system.member_name());
			self.fan_out(
				targets,
				DataRequest::SetMain {
					value,
					transfer: true,
				},
			)?;
		}
		Ok(DataResponse::Ok)
	}

	async fn handle_get_root(&self, store: String, root_id: u64) -> Result<DataResponse, Error> {
		let handle = self.engine.open_store(&local_store_name(&store))?;
		Ok(DataResponse::Root(handle.get_root(root_id)?))
	}

	async fn handle_set_root(&self, store: String, root_id: u64, value: u64, transfer: bool) -> Result<DataResponse, Error> {
		let handle = self.engine.open_store(&local_store_name(&store))?;
		handle.set_root(root_id, value)?;
		handle.flush()?;

		if !transfer {
			let dt = self.operational_table()?;
			let targets = dt.other_replication_members(0, self.system.member_name());
			self.fan_out(
				targets,
				DataRequest::SetRoot {
					store,
					root_id,
					value,
					transfer: true,
				},
			)?;
		}
		Ok(DataResponse::Ok)
	}

	async fn handle_insert(&self, store: String, value: Vec<u8>, cloc: Option<u64>, transfer: bool) -> Result<DataResponse, Error> {
		let handle = self.engine.open_store(&local_store_name(&store))?;
		match cloc {
			None => {
				let dt = self.operational_table()?;
				let cloc = self
					.address_table
					.new_cluster_loc(&store, &dt, self.system.member_name())
					.await?;
				let local_loc = handle.insert(&value)?;
				self.address_table.set_trans(&store, cloc, local_loc, 1)?;
				self.metrics.record_op();

				let targets = dt.other_replication_members(cloc, self.system.member_name());
				self.fan_out(
					targets,
					DataRequest::Insert {
						store,
						value,
						cloc: Some(cloc),
						transfer: true,
					},
				)?;
				Ok(DataResponse::ClusterLoc(cloc))
			}
			Some(cloc) => {
				let local_loc = handle.insert(&value)?;
				self.address_table.set_trans(&store, cloc, local_loc, 1)?;
				self.metrics.record_op();
				let _ = transfer;
				Ok(DataResponse::ClusterLoc(cloc))
			}
		}
	}

	async fn handle_update(
		&self,
		store: String,
		cloc: u64,
		value: Vec<u8>,
		version: Option<u64>,
		transfer: bool,
	) -> Result<DataResponse, Error> {
		let rec = self
			.address_table
			.trans(&store, cloc)?
			.ok_or_else(|| {
				self.metrics.not_found.fetch_add(1, Ordering::Relaxed);
				Error::NotFound {
					member: self.system.member_name().to_string(),
					loc: cloc,
				}
			})?;
		let handle = self.engine.open_store(&local_store_name(&store))?;

		if !transfer {
			let new_version = rec.version + 1;
			handle.update(rec.local_loc, &value)?;
			self.address_table.set_trans(&store, cloc, rec.local_loc, new_version)?;
			self.metrics.record_op();

			let dt = self.operational_table()?;
			let targets = dt.other_replication_members(cloc, self.system.member_name());
			self.fan_out(
				targets,
				DataRequest::Update {
					store,
					cloc,
					value,
					version: Some(new_version),
					transfer: true,
				},
			)?;
			Ok(DataResponse::Ok)
		} else {
			let incoming = version.unwrap_or(rec.version);
			if incoming < rec.version {
				debug!(
					"dropping outdated replica write for {:?}@{} (incoming {} < stored {})",
					store, cloc, incoming, rec.version
				);
				self.metrics.outdated_writes_dropped.fetch_add(1, Ordering::Relaxed);
				return Ok(DataResponse::Ok);
			}
			handle.update(rec.local_loc, &value)?;
			self.address_table.set_trans(&store, cloc, rec.local_loc, incoming)?;
			self.metrics.record_op();
			Ok(DataResponse::Ok)
		}
	}

	async fn handle_free(&self, store: String, cloc: u64, transfer: bool) -> Result<DataResponse, Error> {
		let rec = self.address_table.trans(&store, cloc)?.ok_or_else(|| {
			self.metrics.not_found.fetch_add(1, Ordering::Relaxed);
			Error::NotFound {
				member: self.system.member_name().to_string(),
				loc: cloc,
			}
		})?;
		self.address_table.remove_trans(&store, cloc)?;
		let handle = self.engine.open_store(&local_store_name(&store))?;
		handle.free(rec.local_loc)?;
		self.metrics.record_op();

		if !transfer {
			let dt = self.operational_table()?;
			let targets = dt.other_replication_members(cloc, self.system.member_name());
			self.fan_out(
				targets,
				DataRequest::Free {
					store,
					cloc,
					transfer: true,
				},
			)?;
		}
		Ok(DataResponse::Ok)
	}

	async fn handle_fetch(&self, store: String, cloc: u64) -> Result<DataResponse, Error> {
		let rec = self.address_table.trans(&store, cloc)?.ok_or_else(|| {
			self.metrics.not_found.fetch_add(1, Ordering::Relaxed);
			Error::NotFound {
				member: self.system.member_name().to_string(),
				loc: cloc,
			}
		})?;
		let handle = self.engine.open_store(&local_store_name(&store))?;
		Ok(DataResponse::Blob(handle.fetch(rec.local_loc)?))
	}

	async fn handle_exists(&self, store: String, cloc: u64) -> Result<DataResponse, Error> {
		Ok(DataResponse::Exists(self.address_table.trans(&store, cloc)?.is_some()))
	}

	async fn handle_rebalance(&self, src: MemberName, triples: Vec<RebalanceTriple>) -> Result<DataResponse, Error> {
		let dt = self.operational_table()?;
		let self_name = self.system.member_name();

		for RebalanceTriple { store, cloc, version } in triples {
			if !responsible_for(&dt, self_name, cloc) {
				continue;
			}
			let handle = self.engine.open_store(&local_store_name(&store))?;
			let local = self.address_table.trans(&store, cloc)?;

			let need_pull = match &local {
				None => true,
				Some(rec) => rec.version < version,
			};
			if need_pull {
				let src_addr = self
					.system
					.peer_addr(&src)
					.ok_or_else(|| Error::UnknownPeer(src.to_string()))?;
				let reply = self
					.system
					.send_data_request(
						&src,
						src_addr,
						DataRequest::Fetch {
							store: store.clone(),
							cloc,
						},
					)
					.await?;
				let blob = match reply {
					DataResponse::Blob(b) => b,
					other => return Err(Error::unexpected_rpc_message(other)),
				};
				match &local {
					None => {
						let local_loc = handle.insert(&blob)?;
						self.address_table.set_trans(&store, cloc, local_loc, version)?;
					}
					Some(rec) => {
						handle.update(rec.local_loc, &blob)?;
						self.address_table.set_trans(&store, cloc, rec.local_loc, version)?;
					}
				}
				info!("rebalance: pulled {:?}@{} version {} from {}", store, cloc, version, src);
			}

			if !responsible_for(&dt, &src, cloc) {
				let src_addr = self.system.peer_addr(&src);
				if let Some(addr) = src_addr {
					let _ = self
						.system
						.send_data_request(
							&src,
							addr,
							DataRequest::Free {
								store,
								cloc,
								transfer: true,
							},
						)
						.await;
				}
			}
		}
		Ok(DataResponse::Ok)
	}
}

/// Whether `member` is the primary or a replica of `cloc` under `dt`.
fn responsible_for(dt: &cluster_rpc::DistributionTable, member: &MemberName, cloc: u64) -> bool {
	let (primary, replicas) = dt.location_home(cloc);
	&primary == member || replicas.contains(member)
}

/// Lets the address table ask the rest of the cluster whether a candidate
/// location is already taken, for the one case where the local translation
/// table alone isn't enough: a member that just joined and whose per-store
/// counter hasn't caught up with locations the previous owner already
/// handed out.
#[async_trait]
impl crate::address_table::ClusterExistenceCheck for MemberStorage {
	async fn cluster_exists(&self, store: &str, loc: u64) -> Result<bool, Error> {
		let dt = self.operational_table()?;
		let self_name = self.system.member_name();
		for member in dt.members() {
			if member == self_name {
				continue;
			}
			let Some(addr) = self.system.peer_addr(member) else {
				continue;
			};
			let req = DataRequest::Exists {
				store: store.to_string(),
				cloc: loc,
			};
			match self.system.send_data_request(member, addr, req).await {
				Ok(DataResponse::Exists(true)) => return Ok(true),
				Ok(_) => continue,
				Err(e) if e.is_network_class() => continue,
				Err(e) => return Err(e),
			}
		}
		Ok(false)
	}
}

#[async_trait]
impl DataHandler for MemberStorage {
	async fn handle(&self, req: DataRequest) -> Result<DataResponse, Error> {
		match req {
			DataRequest::GetMain => self.handle_get_main().await,
			DataRequest::SetMain { value, transfer } => self.handle_set_main(value, transfer).await,
			DataRequest::GetRoot { store, root_id } => self.handle_get_root(store, root_id).await,
			DataRequest::SetRoot { store, root_id, value, transfer } => {
				self.handle_set_root(store, root_id, value, transfer).await
			}
			DataRequest::Insert { store, value, cloc, transfer } => self.handle_insert(store, value, cloc, transfer).await,
			DataRequest::Update { store, cloc, value, version, transfer } => {
				self.handle_update(store, cloc, value, version, transfer).await
			}
			DataRequest::Free { store, cloc, transfer } => self.handle_free(store, cloc, transfer).await,
			DataRequest::Fetch { store, cloc } => self.handle_fetch(store, cloc).await,
			DataRequest::Exists { store, cloc } => self.handle_exists(store, cloc).await,
			DataRequest::Rebalance { src, triples } => self.handle_rebalance(src, triples).await,
		}
		.map_err(|e| {
			if !matches!(e, Error::NotFound { .. }) {
				warn!("data request failed: {}", e);
			}
			e
		})
	}
}
