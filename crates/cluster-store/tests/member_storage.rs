use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use cluster_db::memory::MemoryEngine;
use cluster_rpc::layout::DEFAULT_ADDRESS_SPACE_SIZE;
use cluster_rpc::system::System;
use cluster_rpc::transport::LocalTransport;
use cluster_store::address_table::AddressTable;
use cluster_store::member_storage::MemberStorage;
use cluster_util::data::{DataRequest, DataResponse, MemberName};

fn single_member_storage() -> Arc<MemberStorage> {
	let transport = Arc::new(LocalTransport::new());
	let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9100);
	let system = System::new(
		MemberName::from("solo"),
		addr,
		"s3cret".into(),
		1,
		DEFAULT_ADDRESS_SPACE_SIZE,
		transport,
	);
	let engine: Arc<dyn cluster_db::Engine> = Arc::new(MemoryEngine::new());
	let address_table = Arc::new(AddressTable::new(engine.as_ref()).unwrap());
	MemberStorage::new(engine, address_table, system).unwrap()
}

#[tokio::test]
async fn insert_then_fetch_round_trips() {
	let storage = single_member_storage();
	use cluster_rpc::system::DataHandler;

	let resp = storage
		.handle(DataRequest::Insert {
			store: "objects".into(),
			value: b"hello".to_vec(),
			cloc: None,
			transfer: false,
		})
		.await
		.unwrap();
	let cloc = match resp {
		DataResponse::ClusterLoc(c) => c,
		other => panic!("unexpected response: {:?}", other),
	};
	assert_ne!(cloc, 0, "0 is reserved and must never be allocated");

	let fetched = storage
		.handle(DataRequest::Fetch {
			store: "objects".into(),
			cloc,
		})
		.await
		.unwrap();
	assert!(matches!(fetched, DataResponse::Blob(b) if b == b"hello"));
}

#[tokio::test]
async fn update_then_fetch_returns_latest_value() {
	let storage = single_member_storage();
	use cluster_rpc::system::DataHandler;

	let cloc = match storage
		.handle(DataRequest::Insert {
			store: "objects".into(),
			value: b"v1".to_vec(),
			cloc: None,
			transfer: false,
		})
		.await
		.unwrap()
	{
		DataResponse::ClusterLoc(c) => c,
		other => panic!("unexpected response: {:?}", other),
	};

	storage
		.handle(DataRequest::Update {
			store: "objects".into(),
			cloc,
			value: b"v2".to_vec(),
			version: None,
			transfer: false,
		})
		.await
		.unwrap();

	let fetched = storage
		.handle(DataRequest::Fetch {
			store: "objects".into(),
			cloc,
		})
		.await
		.unwrap();
	assert!(matches!(fetched, DataResponse::Blob(b) if b == b"v2"));
}

#[tokio::test]
async fn outdated_replica_update_is_swallowed_without_error() {
	let storage = single_member_storage();
	use cluster_rpc::system::DataHandler;

	let cloc = match storage
		.handle(DataRequest::Insert {
			store: "objects".into(),
			value: b"v1".to_vec(),
			cloc: None,
			transfer: false,
		})
		.await
		.unwrap()
	{
		DataResponse::ClusterLoc(c) => c,
		other => panic!("unexpected response: {:?}", other),
	};

	// Stored version is already 1; a replicated write claiming version 1
	// again must be accepted silently without clobbering anything newer.
	let result = storage
		.handle(DataRequest::Update {
			store: "objects".into(),
			cloc,
			value: b"stale".to_vec(),
			version: Some(1),
			transfer: true,
		})
		.await;
	assert!(result.is_ok());
}

#[tokio::test]
async fn free_then_fetch_yields_not_found() {
	let storage = single_member_storage();
	use cluster_rpc::system::DataHandler;

	let cloc = match storage
		.handle(DataRequest::Insert {
			store: "objects".into(),
			value: b"gone-soon".to_vec(),
			cloc: None,
			transfer: false,
		})
		.await
		.unwrap()
	{
		DataResponse::ClusterLoc(c) => c,
		other => panic!("unexpected response: {:?}", other),
	};

	storage
		.handle(DataRequest::Free {
			store: "objects".into(),
			cloc,
			transfer: false,
		})
		.await
		.unwrap();

	let result = storage
		.handle(DataRequest::Fetch {
			store: "objects".into(),
			cloc,
		})
		.await;
	assert!(result.is_err());
}

#[tokio::test]
async fn set_main_then_get_main_merge_replaces() {
	let storage = single_member_storage();
	use cluster_rpc::system::DataHandler;
	use std::collections::BTreeMap;

	let mut first = BTreeMap::new();
	first.insert("test1".to_string(), b"123".to_vec());
	storage
		.handle(DataRequest::SetMain {
			value: first,
			transfer: false,
		})
		.await
		.unwrap();

	let mut second = BTreeMap::new();
	second.insert("test2".to_string(), b"456".to_vec());
	storage
		.handle(DataRequest::SetMain {
			value: second,
			transfer: false,
		})
		.await
		.unwrap();

	let resp = storage.handle(DataRequest::GetMain).await.unwrap();
	match resp {
		DataResponse::Map(map) => {
			assert_eq!(map.len(), 1);
			assert_eq!(map.get("test2"), Some(&b"456".to_vec()));
			assert!(!map.contains_key("test1"));
		}
		other => panic!("unexpected response: {:?}", other),
	}
}
