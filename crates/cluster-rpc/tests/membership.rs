use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use cluster_rpc::layout::DEFAULT_ADDRESS_SPACE_SIZE;
use cluster_rpc::surface::Surface;
use cluster_rpc::system::System;
use cluster_rpc::transport::LocalTransport;
use cluster_util::data::MemberName;

fn addr(port: u16) -> SocketAddr {
	SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn spawn_member(
	transport: &Arc<LocalTransport>,
	name: &str,
	port: u16,
	replication_factor: usize,
) -> Arc<System> {
	let system = System::new(
		MemberName::from(name),
		addr(port),
		"s3cret".to_string(),
		replication_factor,
		DEFAULT_ADDRESS_SPACE_SIZE,
		transport.clone(),
	);
	let surface = Surface::new(system.clone());
	transport.register(addr(port), surface);
	system
}

#[tokio::test]
async fn join_builds_shared_membership_and_distribution_table() {
	let transport = Arc::new(LocalTransport::new());
	let m0 = spawn_member(&transport, "m0", 9000, 1);
	let m1 = spawn_member(&transport, "m1", 9001, 1);

	m1.join(addr(9000)).await.unwrap();

	assert_eq!(m1.peers().len(), 1);
	assert_eq!(m0.peers().len(), 1);
	assert!(m0.is_operational());
	assert!(m1.is_operational());
	assert_eq!(m0.distribution_table().unwrap().members().len(), 2);
}

#[tokio::test]
async fn ping_reports_not_a_member_for_strangers() {
	let transport = Arc::new(LocalTransport::new());
	let m0 = spawn_member(&transport, "m0", 9010, 1);
	let _stranger = spawn_member(&transport, "stranger", 9011, 1);

	// m0 has never heard of "stranger" so attempting to message it directly
	// (bypassing join) should be refused once membership is required.
	let result = m0
		.eject(MemberName::from("stranger"), addr(9011), MemberName::from("stranger"))
		.await;
	assert!(result.is_err());
}

#[tokio::test]
async fn eject_removes_peer_from_both_sides() {
	let transport = Arc::new(LocalTransport::new());
	let m0 = spawn_member(&transport, "m0", 9020, 1);
	let m1 = spawn_member(&transport, "m1", 9021, 1);
	m1.join(addr(9020)).await.unwrap();
	assert_eq!(m0.peers().len(), 1);

	m0.eject(MemberName::from("m0"), addr(9020), MemberName::from("m1"))
		.await
		.unwrap();

	assert_eq!(m0.peers().len(), 0);
}

#[tokio::test]
async fn too_many_failures_disables_storage() {
	let transport = Arc::new(LocalTransport::new());
	let m0 = spawn_member(&transport, "m0", 9030, 2);
	let m1 = spawn_member(&transport, "m1", 9031, 2);
	let m2 = spawn_member(&transport, "m2", 9032, 2);
	m1.join(addr(9030)).await.unwrap();
	m2.join(addr(9030)).await.unwrap();
	assert!(m1.is_operational());

	// Simulate two unreachable peers by unregistering their dispatchers:
	// requests to them now fail as network errors.
	transport.unregister(addr(9030));
	transport.unregister(addr(9032));

	let err = m1.eject(MemberName::from("m0"), addr(9030), MemberName::from("x")).await;
	assert!(err.is_err());
	let _ = m1.eject(MemberName::from("m2"), addr(9032), MemberName::from("x")).await;

	assert!(!m1.is_operational());
	assert!(m1.disable_reason().unwrap().contains("Too many members failed"));
}
