//! Address translation, member storage dispatch, and the transfer/rebalance
//! background workers: the per-member half of the clustering core, sitting
//! between the local storage engine (`cluster-db`) and cluster membership
//! (`cluster-rpc`).
pub mod address_table;
pub mod member_storage;
pub mod rebalance_worker;
pub mod transfer_worker;

pub use address_table::AddressTable;
pub use member_storage::MemberStorage;
pub use rebalance_worker::RebalanceWorker;
pub use transfer_worker::TransferWorker;
