//! Multi-member scenarios exercising the full write path: façade routing,
//! replica fan-out via the transfer queue, and rebalance after a
//! membership change. Single-member round-trip laws already live next to
//! `MemberStorage` in `cluster-store`; these tests are the ones that need
//! more than one member in the same process to mean anything.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use cluster_client::DistributedStorage;
use cluster_db::memory::MemoryEngine;
use cluster_rpc::layout::DEFAULT_ADDRESS_SPACE_SIZE;
use cluster_rpc::surface::Surface;
use cluster_rpc::system::System;
use cluster_rpc::transport::LocalTransport;
use cluster_store::address_table::{AddressTable, ClusterExistenceCheck};
use cluster_store::member_storage::MemberStorage;
use cluster_store::rebalance_worker::RebalanceWorker;
use cluster_store::transfer_worker::TransferWorker;
use cluster_util::data::MemberName;

struct Member {
	system: Arc<System>,
	storage: Arc<MemberStorage>,
	facade: Arc<DistributedStorage>,
	transfer: Arc<TransferWorker>,
	rebalance: Arc<RebalanceWorker>,
}

fn addr(port: u16) -> SocketAddr {
	SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn spawn_member(
	transport: &Arc<LocalTransport>,
	name: &str,
	port: u16,
	replication_factor: usize,
	address_space_size: u64,
) -> Member {
	let system = System::new(
		MemberName::from(name),
		addr(port),
		"s3cret".to_string(),
		replication_factor,
		address_space_size,
		transport.clone(),
	);
	let surface = Surface::new(system.clone());
	transport.register(addr(port), surface);

	let engine: Arc<dyn cluster_db::Engine> = Arc::new(MemoryEngine::new());
	let address_table = Arc::new(AddressTable::new(engine.as_ref()).unwrap());
	let storage = MemberStorage::new(engine, address_table.clone(), system.clone()).unwrap();
	address_table.set_existence_check(storage.clone() as Arc<dyn ClusterExistenceCheck>);
	system.set_data_handler(storage.clone());

	let facade = DistributedStorage::new(system.clone());
	facade.set_local_handler(storage.clone());

	let rebalance = RebalanceWorker::new(system.clone(), address_table.clone(), 1);
	let transfer = TransferWorker::new(system.clone(), address_table, rebalance.clone());

	Member {
		system,
		storage,
		facade,
		transfer,
		rebalance,
	}
}

/// Drains every member's transfer queue (and the rebalance pass it
/// triggers) until nothing changes, bounded so a stuck test fails fast
/// instead of hanging.
async fn drain_all(members: &[Member]) {
	for _ in 0..10 {
		for m in members {
			m.transfer.run_once().await.unwrap();
		}
	}
}

#[tokio::test]
async fn insert_replicates_to_every_member_of_the_group() {
	let transport = Arc::new(LocalTransport::new());
	let m0 = spawn_member(&transport, "m0", 9100, 2, 30);
	let m1 = spawn_member(&transport, "m1", 9101, 2, 30);
	let m2 = spawn_member(&transport, "m2", 9102, 2, 30);
	m1.system.join(addr(9100)).await.unwrap();
	m2.system.join(addr(9100)).await.unwrap();
	assert!(m0.system.is_operational());

	let cloc = m1.facade.insert("objects", b"hello".to_vec()).await.unwrap();

	let members = vec![m0, m1, m2];
	drain_all(&members).await;

	let dt = members[0].system.distribution_table().unwrap();
	let (primary, replicas) = dt.location_home(cloc);
	let group: Vec<&MemberName> = std::iter::once(&primary).chain(replicas.iter()).collect();

	for m in &members {
		if !group.contains(&m.system.member_name()) {
			continue;
		}
		use cluster_rpc::system::DataHandler;
		let resp = m
			.storage
			.handle(cluster_util::data::DataRequest::Fetch {
				store: "objects".into(),
				cloc,
			})
			.await
			.unwrap();
		assert!(
			matches!(resp, cluster_util::data::DataResponse::Blob(b) if b == b"hello"),
			"member {} (in replication group for {}) missing the replicated value",
			m.system.member_name(),
			cloc
		);
	}
}

#[tokio::test]
async fn rebalance_moves_data_after_a_member_joins() {
	let transport = Arc::new(LocalTransport::new());
	// Start as a 2-member, replication-1 cluster (address space 6, so
	// memberRange = 3) so every location has a single, unambiguous owner
	// to reason about before and after the third member joins.
	let m0 = spawn_member(&transport, "m0", 9110, 1, 6);
	let m1 = spawn_member(&transport, "m1", 9111, 1, 6);
	m1.system.join(addr(9110)).await.unwrap();

	// With 2 members m0 owns [0, 2]. The first allocation lands on 1
	// (0 is reserved); take a second one so it lands on 2, which sits
	// right on the boundary that moves once a third member joins and
	// memberRange shrinks to 2 (m0 [0,1], m1 [2,3], m2 [4,6]).
	let _ = m0.facade.insert("objects", b"filler".to_vec()).await.unwrap();
	let cloc = m0.facade.insert("objects", b"before-join".to_vec()).await.unwrap();
	let old_owner = m0.system.distribution_table().unwrap().location_home(cloc).0;

	let m2 = spawn_member(&transport, "m2", 9112, 1, 6);
	m2.system.join(addr(9110)).await.unwrap();

	let members = vec![m0, m1, m2];
	let dt = members[0].system.distribution_table().unwrap();
	assert_eq!(dt.members().len(), 3, "layout should now account for all three members");
	let new_owner = dt.location_home(cloc).0;
	assert_ne!(old_owner, new_owner, "test setup should pick a location whose owner actually moves");

	for m in &members {
		m.rebalance.force().await.unwrap();
	}
	drain_all(&members).await;
	for m in &members {
		m.rebalance.force().await.unwrap();
	}
	drain_all(&members).await;

	use cluster_rpc::system::DataHandler;
	for m in &members {
		let resp = m
			.storage
			.handle(cluster_util::data::DataRequest::Exists {
				store: "objects".into(),
				cloc,
			})
			.await
			.unwrap();
		let has_it = matches!(resp, cluster_util::data::DataResponse::Exists(true));
		let should_have_it = m.system.member_name() == &new_owner;
		assert_eq!(
			has_it, should_have_it,
			"member {} ownership mismatch after rebalance (old owner {}, new owner {})",
			m.system.member_name(),
			old_owner,
			new_owner
		);
	}
}

#[tokio::test]
async fn set_main_merges_across_members() {
	let transport = Arc::new(LocalTransport::new());
	let m0 = spawn_member(&transport, "m0", 9120, 2, 30);
	let m1 = spawn_member(&transport, "m1", 9121, 2, 30);
	m1.system.join(addr(9120)).await.unwrap();

	let mut first = std::collections::BTreeMap::new();
	first.insert("test1".to_string(), b"123".to_vec());
	m0.facade.set_main(first).await.unwrap();

	let mut second = std::collections::BTreeMap::new();
	second.insert("test2".to_string(), b"456".to_vec());
	m1.facade.set_main(second).await.unwrap();

	let members = vec![m0, m1];
	drain_all(&members).await;

	let mut only_test1 = std::collections::BTreeMap::new();
	only_test1.insert("test2".to_string(), b"456".to_vec());
	members[0].facade.set_main(only_test1).await.unwrap();
	drain_all(&members).await;

	// Root/MainDB calls always land on `dt.members()[0]` regardless of which
	// facade is asked, so reading back through `facade.get_main()` on every
	// member would just reread m0's own tree repeatedly. Go straight at each
	// member's local storage instead, to confirm the transfer queue actually
	// replicated the merge onto m1, not only onto the primary.
	use cluster_rpc::system::DataHandler;
	for m in &members {
		let resp = m.storage.handle(cluster_util::data::DataRequest::GetMain).await.unwrap();
		let map = match resp {
			cluster_util::data::DataResponse::Map(m) => m,
			other => panic!("unexpected response: {:?}", other),
		};
		assert_eq!(map.len(), 1, "member {} did not converge to the merged map", m.system.member_name());
		assert_eq!(map.get("test2"), Some(&b"456".to_vec()));
	}
}
