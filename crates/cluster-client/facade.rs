//! The distributed storage façade (C6): the public storage-manager surface
//! callers use as if it were a local store. Routes each call to a primary
//! member, falls back to replicas on network-class failure, and dispatches
//! in-process (deep-copying mutable buffers) when the chosen target is
//! this member.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cluster_util::data::{DataRequest, DataResponse, MemberName};
use cluster_util::Error;
use log::debug;
use parking_lot::Mutex;

use cluster_rpc::system::{DataHandler, System};

/// One running distributed storage manager, backed by the member manager's
/// membership/distribution view and (optionally) a local data handler for
/// in-process dispatch.
pub struct DistributedStorage {
	system: Arc<System>,
	local_handler: Mutex<Option<Arc<dyn DataHandler>>>,
	round_robin: AtomicUsize,
}

impl DistributedStorage {
	pub fn new(system: Arc<System>) -> Arc<Self> {
		Arc::new(Self {
			system,
			local_handler: Mutex::new(None),
			round_robin: AtomicUsize::new(0),
		})
	}

	/// Registers this member's own [`MemberStorage`](cluster_store) (or any
	/// `DataHandler`) so requests destined for `self` skip the RPC layer
	/// entirely instead of dialing back into ourselves.
	pub fn set_local_handler(&self, handler: Arc<dyn DataHandler>) {
		*self.local_handler.lock() = Some(handler);
	}

	fn distribution_table(&self) -> Result<Arc<cluster_rpc::DistributionTable>, Error> {
		self.system
			.distribution_table()
			.ok_or_else(|| Error::StorageDisabled(self.system.disable_reason().unwrap_or_default()))
	}

	/// Sends `req` to the first candidate in `candidates` that answers
	/// successfully, falling back to the next candidate only on a
	/// network-class error. Any other error (e.g. `NotFound`) surfaces
	/// immediately without trying the rest of the list.
	async fn dispatch(&self, candidates: Vec<MemberName>, req: DataRequest) -> Result<DataResponse, Error> {
		let mut last_err = None;
		for candidate in candidates {
			if candidate == *self.system.member_name() {
				if let Some(handler) = self.local_handler.lock().clone() {
					// The request already owns its byte buffers (no shared
					// transport buffer pool to worry about in-process), but
					// we still clone explicitly here to document the
					// requirement and to keep this branch safe if a future
					// handler holds on to the request past this call.
					match handler.handle(deep_copy(&req)).await {
						Ok(resp) => return Ok(resp),
						Err(e) if e.is_network_class() => {
							last_err = Some(e);
							continue;
						}
						Err(e) => return Err(e),
					}
				}
			}

			let Some(addr) = self.system.peer_addr(&candidate) else {
				last_err = Some(Error::UnknownPeer(candidate.to_string()));
				continue;
			};
			match self.system.send_data_request(&candidate, addr, req.clone()).await {
				Ok(resp) => return Ok(resp),
				Err(e) if e.is_network_class() => {
					debug!("facade: {} unreachable, trying next candidate", candidate);
					last_err = Some(e);
					continue;
				}
				Err(e) => return Err(e),
			}
		}
		Err(last_err.unwrap_or_else(|| Error::ClusterState("no reachable member for this request".into())))
	}

	fn insert_candidates(&self, dt: &cluster_rpc::DistributionTable) -> Vec<MemberName> {
		let members = dt.members();
		let n = members.len();
		let start = self.round_robin.load(Ordering::Relaxed) % n;
		(0..n).map(|i| members[(start + i) % n].clone()).collect()
	}

	fn location_candidates(&self, dt: &cluster_rpc::DistributionTable, cloc: u64) -> Vec<MemberName> {
		let (primary, replicas) = dt.location_home(cloc);
		let mut v = vec![primary];
		v.extend(replicas);
		v
	}

	fn root_candidates(&self, dt: &cluster_rpc::DistributionTable) -> Vec<MemberName> {
		let first = dt.members()[0].clone();
		let mut v = vec![first.clone()];
		v.extend(dt.replicas(&first));
		v
	}

	pub async fn insert(&self, store: impl Into<String>, value: Vec<u8>) -> Result<u64, Error> {
		let dt = self.distribution_table()?;
		let candidates = self.insert_candidates(&dt);
		let resp = self
			.dispatch(
				candidates,
				DataRequest::Insert {
					store: store.into(),
					value,
					cloc: None,
					transfer: false,
				},
			)
			.await?;
		match resp {
			DataResponse::ClusterLoc(c) => Ok(c),
			other => Err(Error::unexpected_rpc_message(other)),
		}
	}

	pub async fn update(&self, store: impl Into<String>, cloc: u64, value: Vec<u8>) -> Result<(), Error> {
		let dt = self.distribution_table()?;
		let candidates = self.location_candidates(&dt, cloc);
		self.dispatch(
			candidates,
			DataRequest::Update {
				store: store.into(),
				cloc,
				value,
				version: None,
				transfer: false,
			},
		)
		.await?;
		Ok(())
	}

	pub async fn free(&self, store: impl Into<String>, cloc: u64) -> Result<(), Error> {
		let dt = self.distribution_table()?;
		let candidates = self.location_candidates(&dt, cloc);
		self.dispatch(
			candidates,
			DataRequest::Free {
				store: store.into(),
				cloc,
				transfer: false,
			},
		)
		.await?;
		Ok(())
	}

	pub async fn fetch(&self, store: impl Into<String>, cloc: u64) -> Result<Vec<u8>, Error> {
		let dt = self.distribution_table()?;
		let candidates = self.location_candidates(&dt, cloc);
		let resp = self
			.dispatch(candidates, DataRequest::Fetch { store: store.into(), cloc })
			.await?;
		match resp {
			DataResponse::Blob(b) => Ok(b),
			other => Err(Error::unexpected_rpc_message(other)),
		}
	}

	pub async fn exists(&self, store: impl Into<String>, cloc: u64) -> Result<bool, Error> {
		let dt = self.distribution_table()?;
		let candidates = self.location_candidates(&dt, cloc);
		let resp = self
			.dispatch(candidates, DataRequest::Exists { store: store.into(), cloc })
			.await?;
		match resp {
			DataResponse::Exists(b) => Ok(b),
			other => Err(Error::unexpected_rpc_message(other)),
		}
	}

	pub async fn get_root(&self, store: impl Into<String>, root_id: u64) -> Result<u64, Error> {
		let dt = self.distribution_table()?;
		let candidates = self.root_candidates(&dt);
		let resp = self
			.dispatch(candidates, DataRequest::GetRoot { store: store.into(), root_id })
			.await?;
		match resp {
			DataResponse::Root(v) => Ok(v),
			other => Err(Error::unexpected_rpc_message(other)),
		}
	}

	pub async fn set_root(&self, store: impl Into<String>, root_id: u64, value: u64) -> Result<(), Error> {
		let dt = self.distribution_table()?;
		let candidates = self.root_candidates(&dt);
		self.dispatch(
			candidates,
			DataRequest::SetRoot {
				store: store.into(),
				root_id,
				value,
				transfer: false,
			},
		)
		.await?;
		Ok(())
	}

	pub async fn get_main(&self) -> Result<BTreeMap<String, Vec<u8>>, Error> {
		let dt = self.distribution_table()?;
		let candidates = self.root_candidates(&dt);
		let resp = self.dispatch(candidates, DataRequest::GetMain).await?;
		match resp {
			DataResponse::Map(m) => Ok(m),
			other => Err(Error::unexpected_rpc_message(other)),
		}
	}

	pub async fn set_main(&self, value: BTreeMap<String, Vec<u8>>) -> Result<(), Error> {
		let dt = self.distribution_table()?;
		let candidates = self.root_candidates(&dt);
		self.dispatch(candidates, DataRequest::SetMain { value, transfer: false }).await?;
		Ok(())
	}

	/// A logical barrier only: bumps the round-robin counter so the next
	/// batch of related inserts starts from a new member. Never propagated.
	pub fn flush(&self) {
		self.round_robin.fetch_add(1, Ordering::Relaxed);
	}

	/// No-op: this façade has nothing transactional to roll back.
	pub fn rollback(&self) {}

	/// This façade never serves from a cache.
	pub fn fetch_cached(&self, _store: &str, _cloc: u64) -> Result<Vec<u8>, Error> {
		Err(Error::NotInCache)
	}
}

/// Clones a `DataRequest`'s mutable byte buffers so an in-process dispatch
/// never shares backing storage with the caller, the way a real RPC
/// transport's buffer pool would force a copy anyway.
fn deep_copy(req: &DataRequest) -> DataRequest {
	req.clone()
}

#[cfg(test)]
mod tests {
	use super::*;
	use cluster_rpc::layout::DEFAULT_ADDRESS_SPACE_SIZE;
	use cluster_rpc::transport::LocalTransport;
	use std::net::{IpAddr, Ipv4Addr, SocketAddr};

	fn addr(port: u16) -> SocketAddr {
		SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
	}

	#[tokio::test]
	async fn insert_round_robins_over_members() {
		let transport = Arc::new(LocalTransport::new());
		let m0 = System::new(
			MemberName::from("m0"),
			addr(9200),
			"s".into(),
			1,
			DEFAULT_ADDRESS_SPACE_SIZE,
			transport.clone(),
		);
		let facade = DistributedStorage::new(m0.clone());
		let dt = m0.distribution_table().unwrap();
		let first = facade.insert_candidates(&dt);
		facade.flush();
		let second = facade.insert_candidates(&dt);
		// With a single member both rotations trivially agree; this mostly
		// documents that flush() advances the counter without panicking.
		assert_eq!(first[0], second[0]);
	}

	#[tokio::test]
	async fn fetch_cached_always_misses() {
		let transport = Arc::new(LocalTransport::new());
		let m0 = System::new(
			MemberName::from("m0"),
			addr(9201),
			"s".into(),
			1,
			DEFAULT_ADDRESS_SPACE_SIZE,
			transport,
		);
		let facade = DistributedStorage::new(m0);
		assert!(matches!(facade.fetch_cached("objects", 1), Err(Error::NotInCache)));
	}
}
