//! The member manager: peer roster, shared state info, join/eject,
//! cluster-wide locks, and the housekeeping loop that keeps all of it
//! converging. `System` is deliberately not owned by, and does not own,
//! the storage façade or the local storage handler above it: both sides
//! are wired together after construction through the two handler hooks
//! below, which breaks the natural three-way cycle between storage,
//! façade, and membership.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use cluster_util::auth::{compute_token, verify_token};
use cluster_util::background::{BackgroundRunner, Worker, WorkerState};
use cluster_util::data::{DataRequest, DataResponse, LogicalTime, MemberName, StateInfo};
use cluster_util::Error;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;

use crate::layout::DistributionTable;
use crate::locks::LockTable;
use crate::transport::{Envelope, PingTimes, RpcBody, Transport};

/// Handles a data request once membership has routed it to this member;
/// implemented by the local storage layer and injected via
/// [`System::set_data_handler`].
#[async_trait]
pub trait DataHandler: Send + Sync {
	async fn handle(&self, req: DataRequest) -> Result<DataResponse, Error>;
}

/// Notified whenever state info changes (new members, a membership
/// change, a replication-factor rebuild); implemented by the storage
/// façade so it can rebuild or disable itself, and injected via
/// [`System::set_state_update_handler`].
pub trait StateUpdateHandler: Send + Sync {
	fn on_state_update(&self, info: &StateInfo);
}

pub struct System {
	member_name: MemberName,
	rpc_addr: SocketAddr,
	secret: String,
	address_space_size: u64,
	transport: Arc<dyn Transport>,

	state: RwLock<StateInfo>,
	peers: RwLock<HashMap<MemberName, SocketAddr>>,
	failed: RwLock<HashMap<MemberName, String>>,

	distribution: ArcSwapOption<DistributionTable>,
	disable_reason: Mutex<Option<String>>,

	locks: LockTable,

	data_handler: Mutex<Option<Arc<dyn DataHandler>>>,
	state_update_handler: Mutex<Option<Arc<dyn StateUpdateHandler>>>,
}

impl System {
	pub fn new(
		member_name: MemberName,
		rpc_addr: SocketAddr,
		secret: String,
		replication_factor: usize,
		address_space_size: u64,
		transport: Arc<dyn Transport>,
	) -> Arc<Self> {
		let ts = LogicalTime::zero(member_name.clone());
		let state = StateInfo {
			members: vec![(member_name.clone(), rpc_addr)],
			failed: Vec::new(),
			replication: replication_factor,
			ts: ts.clone(),
			tsold: ts,
		};
		let system = Arc::new(Self {
			member_name,
			rpc_addr,
			secret,
			address_space_size,
			transport,
			state: RwLock::new(state),
			peers: RwLock::new(HashMap::new()),
			failed: RwLock::new(HashMap::new()),
			distribution: ArcSwapOption::from(None),
			disable_reason: Mutex::new(None),
			locks: LockTable::new(),
			data_handler: Mutex::new(None),
			state_update_handler: Mutex::new(None),
		});
		system.recompute_operational();
		system
	}

	pub fn member_name(&self) -> &MemberName {
		&self.member_name
	}

	pub fn rpc_addr(&self) -> SocketAddr {
		self.rpc_addr
	}

	pub fn secret(&self) -> &str {
		&self.secret
	}

	pub fn locks(&self) -> &LockTable {
		&self.locks
	}

	pub fn transport(&self) -> &Arc<dyn Transport> {
		&self.transport
	}

	pub fn set_data_handler(&self, handler: Arc<dyn DataHandler>) {
		*self.data_handler.lock() = Some(handler);
	}

	pub fn set_state_update_handler(&self, handler: Arc<dyn StateUpdateHandler>) {
		*self.state_update_handler.lock() = Some(handler);
	}

	pub fn distribution_table(&self) -> Option<Arc<DistributionTable>> {
		self.distribution.load_full()
	}

	pub fn disable_reason(&self) -> Option<String> {
		self.disable_reason.lock().clone()
	}

	pub fn is_operational(&self) -> bool {
		self.distribution_table().is_some()
	}

	pub fn state_info(&self) -> StateInfo {
		self.state.read().clone()
	}

	pub fn peers(&self) -> Vec<(MemberName, SocketAddr)> {
		self.peers.read().iter().map(|(k, v)| (k.clone(), *v)).collect()
	}

	/// Resolves a member name to an address: ourselves or a known peer.
	pub fn peer_addr(&self, name: &MemberName) -> Option<SocketAddr> {
		if name == &self.member_name {
			return Some(self.rpc_addr);
		}
		self.peers.read().get(name).copied()
	}

	// ---- outbound RPC ----

	async fn send(self: &Arc<Self>, target: &MemberName, addr: SocketAddr, body: RpcBody) -> Result<RpcBody, Error> {
		let envelope = Envelope {
			target: target.clone(),
			token: compute_token(&self.member_name, &self.secret),
			body,
		};
		match self.transport.request(addr, envelope).await {
			Ok(RpcBody::Err(msg)) => Err(Error::MemberError(msg)),
			Ok(reply) => {
				self.clear_failed(target);
				Ok(reply)
			}
			Err(e) => {
				if e.is_network_class() {
					self.mark_failed(target.clone(), e.to_string());
				}
				Err(e)
			}
		}
	}

	pub async fn send_data_request(
		self: &Arc<Self>,
		target: &MemberName,
		addr: SocketAddr,
		req: DataRequest,
	) -> Result<DataResponse, Error> {
		match self.send(target, addr, RpcBody::Data(req)).await? {
			RpcBody::DataReply(resp) => Ok(resp),
			other => Err(Error::unexpected_rpc_message(other)),
		}
	}

	pub async fn join(self: &Arc<Self>, target_addr: SocketAddr) -> Result<(), Error> {
		let envelope = Envelope {
			// The joining member doesn't yet know the target's name; an
			// empty target is the bootstrap wildcard Surface accepts only
			// for Ping/JoinCluster.
			target: MemberName::from(""),
			token: compute_token(&self.member_name, &self.secret),
			body: RpcBody::JoinCluster {
				name: self.member_name.clone(),
				addr: self.rpc_addr,
			},
		};
		match self.transport.request(target_addr, envelope).await {
			Ok(RpcBody::StateInfoReply(info)) => {
				self.apply_state_info(info);
				Ok(())
			}
			Ok(RpcBody::Err(msg)) => Err(Error::MemberError(msg)),
			Ok(other) => Err(Error::unexpected_rpc_message(other)),
			Err(e) => Err(e),
		}
	}

	pub async fn eject(self: &Arc<Self>, target: MemberName, addr: SocketAddr, victim: MemberName) -> Result<(), Error> {
		match self.send(&target, addr, RpcBody::EjectMember { name: victim }).await? {
			RpcBody::Ack => Ok(()),
			other => Err(Error::unexpected_rpc_message(other)),
		}
	}

	pub async fn acquire_named_lock(self: &Arc<Self>, name: &str) -> Result<(), Error> {
		self.acquire_cluster_lock(name).await
	}

	pub async fn release_named_lock(self: &Arc<Self>, name: &str) {
		self.release_cluster_lock(name).await
	}

	// ---- inbound RPC dispatch, called by the RPC surface ----

	pub(crate) async fn handle_rpc(self: &Arc<Self>, caller: MemberName, body: RpcBody) -> RpcBody {
		if Self::requires_membership(&body) {
			let is_member = caller == self.member_name || self.peers.read().contains_key(&caller);
			if !is_member {
				return RpcBody::Err(Error::NotMember(caller.to_string()).to_string());
			}
		}
		match body {
			RpcBody::Ping => self.handle_ping(&caller),
			RpcBody::StateInfoRequest => RpcBody::StateInfoReply(self.state_info()),
			RpcBody::MemberInfoRequest => RpcBody::MemberInfoReply {
				name: self.member_name.clone(),
				addr: self.rpc_addr,
			},
			RpcBody::JoinCluster { name, addr } => self.handle_join(name, addr).await,
			RpcBody::AddMember { name, addr, state_info } => self.handle_add_member(name, addr, state_info),
			RpcBody::EjectMember { name } => self.handle_eject(name).await,
			RpcBody::AcquireLock { name, holder } => match self.locks.acquire(&name, &holder) {
				Ok(()) => RpcBody::Ack,
				Err(e) => RpcBody::Err(e.to_string()),
			},
			RpcBody::ReleaseLock { name, holder } => match self.locks.release(&name, &holder) {
				Ok(()) => RpcBody::Ack,
				Err(e) => RpcBody::Err(e.to_string()),
			},
			RpcBody::UpdateStateInfo(info) => {
				self.apply_state_info(info);
				RpcBody::Ack
			}
			RpcBody::Data(req) => {
				let handler = self.data_handler.lock().clone();
				match handler {
					Some(h) => RpcBody::DataReply(h.handle(req).await),
					None => RpcBody::Err(Error::StorageDisabled("no local storage handler registered".into()).to_string()),
				}
			}
			other => RpcBody::Err(Error::unexpected_rpc_message(other).to_string()),
		}
	}

	fn requires_membership(body: &RpcBody) -> bool {
		!matches!(body, RpcBody::Ping | RpcBody::JoinCluster { .. })
	}

	fn handle_ping(&self, caller: &MemberName) -> RpcBody {
		let is_member = caller == &self.member_name || self.peers.read().contains_key(caller);
		if !is_member {
			return RpcBody::Pong { member_ts: None };
		}
		let state = self.state.read();
		RpcBody::Pong {
			member_ts: Some(PingTimes {
				ts_author: state.ts.author.clone(),
				ts_counter: state.ts.counter,
				tsold_author: state.tsold.author.clone(),
				tsold_counter: state.tsold.counter,
			}),
		}
	}

	async fn handle_join(self: &Arc<Self>, name: MemberName, addr: SocketAddr) -> RpcBody {
		if let Err(e) = self.acquire_cluster_lock("UpdateStateInfo").await {
			return RpcBody::Err(e.to_string());
		}
		self.peers.write().insert(name.clone(), addr);
		self.update_state_info(true);
		let state_info = self.state_info();

		let others: Vec<(MemberName, SocketAddr)> = self
			.peers
			.read()
			.iter()
			.filter(|(n, _)| **n != name)
			.map(|(k, v)| (k.clone(), *v))
			.collect();
		for (peer_name, peer_addr) in others {
			let _ = self
				.send(
					&peer_name,
					peer_addr,
					RpcBody::AddMember {
						name: name.clone(),
						addr,
						state_info: state_info.clone(),
					},
				)
				.await;
		}

		self.release_cluster_lock("UpdateStateInfo").await;
		RpcBody::StateInfoReply(state_info)
	}

	fn handle_add_member(self: &Arc<Self>, name: MemberName, addr: SocketAddr, state_info: StateInfo) -> RpcBody {
		self.peers.write().insert(name, addr);
		self.apply_state_info(state_info);
		RpcBody::Ack
	}

	async fn handle_eject(self: &Arc<Self>, victim: MemberName) -> RpcBody {
		if victim == self.member_name {
			let candidates = self.peers();
			for (peer_name, peer_addr) in &candidates {
				if self.failed.read().contains_key(peer_name) {
					continue;
				}
				if self
					.send(peer_name, *peer_addr, RpcBody::EjectMember { name: victim.clone() })
					.await
					.is_ok()
				{
					break;
				}
			}
			self.peers.write().clear();
			self.failed.write().clear();
			self.recompute_operational();
			return RpcBody::Ack;
		}

		if !self.peers.read().contains_key(&victim) {
			return RpcBody::Err(Error::NotMember(victim.to_string()).to_string());
		}
		if let Err(e) = self.acquire_cluster_lock("UpdateStateInfo").await {
			return RpcBody::Err(e.to_string());
		}
		self.peers.write().remove(&victim);
		self.failed.write().remove(&victim);
		self.update_state_info(true);
		self.broadcast_state_info().await;
		self.release_cluster_lock("UpdateStateInfo").await;
		RpcBody::Ack
	}

	fn apply_state_info(self: &Arc<Self>, info: StateInfo) {
		{
			let mut peers = self.peers.write();
			peers.clear();
			for (name, addr) in &info.members {
				if name != &self.member_name {
					peers.insert(name.clone(), *addr);
				}
			}
		}
		{
			let mut failed = self.failed.write();
			failed.clear();
			for (name, reason) in &info.failed {
				failed.insert(name.clone(), reason.clone());
			}
		}
		*self.state.write() = info;
		self.recompute_operational();
		self.notify_state_update();
	}

	/// Rebuilds `members`/`failed` from the live peer/failed maps; bumps
	/// `ts`/`tsold` when `bump_ts`.
	fn update_state_info(self: &Arc<Self>, bump_ts: bool) {
		let mut peer_list: Vec<(MemberName, SocketAddr)> = self.peers();
		peer_list.sort_by(|a, b| a.0.cmp(&b.0));
		let mut failed_list: Vec<(MemberName, String)> =
			self.failed.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
		failed_list.sort_by(|a, b| a.0.cmp(&b.0));

		let mut state = self.state.write();
		state.members = std::iter::once((self.member_name.clone(), self.rpc_addr))
			.chain(peer_list)
			.collect();
		state.failed = failed_list;
		if bump_ts {
			let old_ts = state.ts.clone();
			state.tsold = old_ts.clone();
			state.ts = LogicalTime {
				author: self.member_name.clone(),
				counter: old_ts.counter + 1,
			};
		}
		drop(state);
		self.recompute_operational();
		self.notify_state_update();
	}

	fn notify_state_update(self: &Arc<Self>) {
		if let Some(handler) = self.state_update_handler.lock().clone() {
			handler.on_state_update(&self.state_info());
		}
	}

	/// Recomputes the operational flag and, if operational, the
	/// distribution table, from the live peer/failed maps (not the
	/// approximately-replicated `state_info` snapshot, so a local network
	/// failure disables storage immediately rather than waiting for the
	/// next housekeeping broadcast).
	fn recompute_operational(self: &Arc<Self>) {
		let num_failed = self.failed.read().len();
		let num_members = 1 + self.peers.read().len();
		let replication = self.state.read().replication;

		if num_failed > replication.saturating_sub(1) {
			self.distribution.store(None);
			*self.disable_reason.lock() = Some(format!(
				"Too many members failed (total: {}, failed: {}, replication: {})",
				num_members, num_failed, replication
			));
			return;
		}

		// `state.members` keeps the local member first (see `update_state_info`),
		// which is convenient for display and for the join handshake but would
		// make every member compute a *different* distribution table if used
		// here directly. Routing decisions (who owns a given cluster location)
		// must be the same no matter which member answers the question, so the
		// table is built from a single name order every member can agree on:
		// all names, self included, sorted together.
		let mut names: Vec<MemberName> = self.peers.read().keys().cloned().collect();
		names.push(self.member_name.clone());
		names.sort();

		match DistributionTable::new(names, replication, self.address_space_size) {
			Ok(table) => {
				self.distribution.store(Some(Arc::new(table)));
				*self.disable_reason.lock() = None;
			}
			Err(e) => {
				self.distribution.store(None);
				*self.disable_reason.lock() = Some(e.to_string());
			}
		}
	}

	fn mark_failed(self: &Arc<Self>, name: MemberName, reason: String) {
		let changed = self.failed.write().insert(name.clone(), reason.clone()).is_none();
		if changed {
			warn!("marking {} failed: {}", name, reason);
			self.recompute_operational();
		}
	}

	fn clear_failed(self: &Arc<Self>, name: &MemberName) {
		let changed = self.failed.write().remove(name).is_some();
		if changed {
			self.recompute_operational();
		}
	}

	// ---- cluster-wide locks ----

	async fn acquire_cluster_lock(self: &Arc<Self>, name: &str) -> Result<(), Error> {
		self.locks.acquire(name, &self.member_name)?;
		let peer_list = self.peers();
		let mut acquired: Vec<(MemberName, SocketAddr)> = Vec::new();
		for (peer_name, peer_addr) in peer_list {
			if self.failed.read().contains_key(&peer_name) {
				continue;
			}
			let result = self
				.send(
					&peer_name,
					peer_addr,
					RpcBody::AcquireLock {
						name: name.to_string(),
						holder: self.member_name.clone(),
					},
				)
				.await;
			match result {
				Ok(RpcBody::Ack) => acquired.push((peer_name, peer_addr)),
				Ok(other) => {
					self.unwind_lock_acquisition(name, &acquired).await;
					self.locks.release(name, &self.member_name).ok();
					return Err(Error::unexpected_rpc_message(other));
				}
				Err(e) if e.is_network_class() => continue,
				Err(e) => {
					self.unwind_lock_acquisition(name, &acquired).await;
					self.locks.release(name, &self.member_name).ok();
					return Err(e);
				}
			}
		}
		Ok(())
	}

	async fn unwind_lock_acquisition(self: &Arc<Self>, name: &str, acquired: &[(MemberName, SocketAddr)]) {
		for (peer_name, peer_addr) in acquired {
			let _ = self
				.send(
					peer_name,
					*peer_addr,
					RpcBody::ReleaseLock {
						name: name.to_string(),
						holder: self.member_name.clone(),
					},
				)
				.await;
		}
	}

	async fn release_cluster_lock(self: &Arc<Self>, name: &str) {
		self.locks.release(name, &self.member_name).ok();
		for (peer_name, peer_addr) in self.peers() {
			let _ = self
				.send(
					&peer_name,
					peer_addr,
					RpcBody::ReleaseLock {
						name: name.to_string(),
						holder: self.member_name.clone(),
					},
				)
				.await;
		}
	}

	// ---- housekeeping ----

	async fn broadcast_state_info(self: &Arc<Self>) {
		let info = self.state_info();
		for (peer_name, peer_addr) in self.peers() {
			let _ = self.send(&peer_name, peer_addr, RpcBody::UpdateStateInfo(info.clone())).await;
		}
	}

	async fn housekeeping_tick(self: &Arc<Self>) -> Result<(), Error> {
		let mut changed = false;
		let mut resolve_conflict = false;

		for (peer_name, peer_addr) in self.peers() {
			match self.send(&peer_name, peer_addr, RpcBody::Ping).await {
				Ok(RpcBody::Pong { member_ts: None }) => {
					if self
						.failed
						.write()
						.insert(peer_name.clone(), "not a member of peer's cluster".into())
						.is_none()
					{
						changed = true;
					}
				}
				Ok(RpcBody::Pong { member_ts: Some(times) }) => {
					let peer_ts = LogicalTime {
						author: times.ts_author,
						counter: times.ts_counter,
					};
					let peer_tsold = LogicalTime {
						author: times.tsold_author,
						counter: times.tsold_counter,
					};
					let mine = self.state.read().ts.clone();
					match peer_ts.cmp(&mine) {
						std::cmp::Ordering::Greater => {
							if peer_tsold == mine {
								if let Ok(RpcBody::StateInfoReply(info)) =
									self.send(&peer_name, peer_addr, RpcBody::StateInfoRequest).await
								{
									self.apply_state_info(info);
								}
							} else {
								if let Ok(RpcBody::StateInfoReply(info)) =
									self.send(&peer_name, peer_addr, RpcBody::StateInfoRequest).await
								{
									let mut peers = self.peers.write();
									for (name, addr) in info.members {
										if name != self.member_name {
											peers.entry(name).or_insert(addr);
										}
									}
								}
								resolve_conflict = true;
							}
							if self.failed.write().remove(&peer_name).is_some() {
								changed = true;
							}
						}
						std::cmp::Ordering::Equal => {
							if self.failed.write().remove(&peer_name).is_some() {
								changed = true;
							}
						}
						std::cmp::Ordering::Less => {}
					}
				}
				Ok(other) => warn!("unexpected ping reply from {}: {:?}", peer_name, other),
				Err(_) => {
					// already recorded as failed by `send`
				}
			}
		}

		if changed || resolve_conflict {
			self.update_state_info(true);
			self.broadcast_state_info().await;
		}
		Ok(())
	}

	pub fn spawn_housekeeping(self: &Arc<Self>, runner: &BackgroundRunner, mean_interval: Duration) {
		runner.spawn_worker(HousekeepingWorker {
			system: self.clone(),
			mean_interval,
		});
	}
}

struct HousekeepingWorker {
	system: Arc<System>,
	mean_interval: Duration,
}

#[async_trait]
impl Worker for HousekeepingWorker {
	fn name(&self) -> String {
		format!("housekeeping({})", self.system.member_name())
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerState, Error> {
		self.system.housekeeping_tick().await?;
		Ok(WorkerState::Idle)
	}

	fn idle_delay(&self) -> Duration {
		let jitter = rand::thread_rng().gen_range(0.5..1.5);
		Duration::from_millis((self.mean_interval.as_millis() as f64 * jitter) as u64)
	}
}

/// Verifies a caller's token against `secret` the way the RPC surface does
/// before routing any request.
pub(crate) fn verify(token: &cluster_util::auth::AuthToken, secret: &str) -> bool {
	verify_token(token, secret)
}
