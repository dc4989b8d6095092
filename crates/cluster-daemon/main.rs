//! The clustering core's node binary: config loading, CLI dispatch, and the
//! process wiring that turns the crates in this workspace into one running
//! member.
#[macro_use]
extern crate log;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use cluster_util::auth::compute_token;
use cluster_util::config::{read_config, Config};
use cluster_util::data::MemberName;
use cluster_util::error::ErrContext;
use cluster_util::Error;

use cluster_rpc::layout::DEFAULT_ADDRESS_SPACE_SIZE;
use cluster_rpc::surface::Surface;
use cluster_rpc::system::System;
use cluster_rpc::transport::{serve, Envelope, RpcBody, TcpTransport, Transport};

use cluster_client::DistributedStorage;
use cluster_store::address_table::ClusterExistenceCheck;
use cluster_store::{AddressTable, MemberStorage, RebalanceWorker, TransferWorker};

mod status;

#[derive(StructOpt, Debug)]
#[structopt(name = "cluster-daemon", about = "Clustered key/value core node")]
struct Opt {
	/// Path to the configuration file.
	#[structopt(short = "c", long = "config", env = "CLUSTER_CONFIG_FILE", default_value = "/etc/cluster.toml")]
	config_file: PathBuf,

	/// Target address for admin subcommands (status/join/eject/lock/unlock).
	/// Defaults to this config's own `rpc_bind_addr`, administering the node
	/// this config describes.
	#[structopt(short = "h", long = "rpc-host")]
	rpc_host: Option<SocketAddr>,

	#[structopt(subcommand)]
	cmd: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
	/// Run this member as a long-lived server.
	Server,
	/// Print known members, failed members, and operational state.
	Status,
	/// Join the cluster reachable at `addr`.
	Join {
		addr: SocketAddr,
	},
	/// Remove `name` from the cluster.
	Eject {
		name: String,
	},
	/// Acquire a named lock on the target member only (debug tool: this
	/// does not fan the acquisition out to the rest of the cluster the way
	/// a real member's own acquire does).
	Lock {
		name: String,
	},
	/// Release a named lock on the target member only.
	Unlock {
		name: String,
	},
}

#[tokio::main]
async fn main() {
	if std::env::var("RUST_LOG").is_err() {
		std::env::set_var("RUST_LOG", "cluster_daemon=info,cluster_rpc=info,cluster_store=info");
	}
	env_logger::init();

	let opt = Opt::from_args();
	if let Err(e) = run(opt).await {
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}

async fn run(opt: Opt) -> Result<(), Error> {
	let config = read_config(&opt.config_file)?;

	match opt.cmd {
		Command::Server => run_server(config).await,
		Command::Status => cmd_status(&config, opt.rpc_host).await,
		Command::Join { addr } => cmd_join(&config, addr).await,
		Command::Eject { name } => cmd_eject(&config, opt.rpc_host, name).await,
		Command::Lock { name } => cmd_lock(&config, opt.rpc_host, name, true).await,
		Command::Unlock { name } => cmd_lock(&config, opt.rpc_host, name, false).await,
	}
}

async fn run_server(config: Config) -> Result<(), Error> {
	std::fs::create_dir_all(&config.metadata_dir)
		.err_context(format!("creating metadata dir {}", config.metadata_dir.display()))?;

	let member_name = MemberName::from(config.member_name.clone());
	let address_space_size = config.address_space_size.unwrap_or(DEFAULT_ADDRESS_SPACE_SIZE);
	let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());

	let system = System::new(
		member_name.clone(),
		config.rpc_bind_addr,
		config.cluster_secret.clone(),
		config.replication_factor,
		address_space_size,
		transport,
	);

	let db_path = config.metadata_dir.join("db");
	let engine: Arc<dyn cluster_db::Engine> = Arc::new(
		cluster_db::sled_adapter::SledEngine::open(&db_path).err_context(format!("opening storage at {}", db_path.display()))?,
	);

	let address_table = Arc::new(AddressTable::new(engine.as_ref())?);
	let member_storage = MemberStorage::new(engine, address_table.clone(), system.clone())?;
	address_table.set_existence_check(member_storage.clone() as Arc<dyn ClusterExistenceCheck>);

	system.set_data_handler(member_storage.clone());

	let facade = DistributedStorage::new(system.clone());
	facade.set_local_handler(member_storage.clone());

	let surface = Surface::new(system.clone());

	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
	let runner = cluster_util::background::BackgroundRunner::new(shutdown_rx.clone());

	let rebalance = RebalanceWorker::new(system.clone(), address_table.clone(), config.rebalance_housekeeping_interval);
	let transfer = TransferWorker::new(system.clone(), address_table, rebalance);
	runner.spawn_worker(TransferWorkerHandle(transfer));

	system.spawn_housekeeping(&runner, Duration::from_millis(config.housekeeping_freq_msec));

	let listener = tokio::net::TcpListener::bind(config.rpc_bind_addr)
		.await
		.err_context(format!("binding RPC listener on {}", config.rpc_bind_addr))?;
	info!("{} listening on {}", member_name, config.rpc_bind_addr);

	for peer in &config.bootstrap_peers {
		let addr = parse_bootstrap_peer(peer)?;
		if let Err(e) = system.join(addr).await {
			warn!("failed to join bootstrap peer {}: {}", peer, e);
		} else {
			info!("joined cluster via {}", peer);
		}
	}

	let serve_task = tokio::spawn(serve(listener, surface));

	tokio::signal::ctrl_c().await.err_context("failed to listen for ctrl-c")?;
	info!("shutting down");
	let _ = shutdown_tx.send(true);
	serve_task.abort();
	Ok(())
}

/// Adapts `Arc<TransferWorker>` to the `Worker` trait. `TransferWorker`'s
/// own inherent methods take `&self` (its single-flight guard is an async
/// mutex, not `&mut self` exclusivity), but it's always held as an `Arc`
/// elsewhere, so `BackgroundRunner::spawn_worker`'s by-value `W: Worker`
/// bound can't take the `Arc` directly, so this thin wrapper bridges the two.
struct TransferWorkerHandle(Arc<TransferWorker>);

#[async_trait::async_trait]
impl cluster_util::background::Worker for TransferWorkerHandle {
	fn name(&self) -> String {
		"transfer-worker".to_string()
	}

	async fn work(
		&mut self,
		_must_exit: &mut tokio::sync::watch::Receiver<bool>,
	) -> Result<cluster_util::background::WorkerState, Error> {
		if let Err(e) = self.0.run_once().await {
			warn!("transfer worker pass failed: {}", e);
		}
		Ok(cluster_util::background::WorkerState::Idle)
	}

	fn idle_delay(&self) -> std::time::Duration {
		std::time::Duration::from_secs(1)
	}
}

fn parse_bootstrap_peer(spec: &str) -> Result<SocketAddr, Error> {
	let addr_part = spec.rsplit_once('@').map(|(_, addr)| addr).unwrap_or(spec);
	addr_part
		.parse()
		.map_err(|_| Error::ConfigError(format!("invalid bootstrap peer address {:?}", spec)))
}

fn target_addr(config: &Config, rpc_host: Option<SocketAddr>) -> SocketAddr {
	rpc_host.unwrap_or(config.rpc_bind_addr)
}

async fn send_admin(config: &Config, addr: SocketAddr, body: RpcBody) -> Result<RpcBody, Error> {
	let transport = TcpTransport::new();
	let envelope = Envelope {
		target: MemberName::from(config.member_name.clone()),
		token: compute_token(&MemberName::from(config.member_name.clone()), &config.cluster_secret),
		body,
	};
	match transport.request(addr, envelope).await? {
		RpcBody::Err(msg) => Err(Error::MemberError(msg)),
		other => Ok(other),
	}
}

async fn cmd_status(config: &Config, rpc_host: Option<SocketAddr>) -> Result<(), Error> {
	let addr = target_addr(config, rpc_host);
	let reply = send_admin(config, addr, RpcBody::StateInfoRequest).await?;
	let info = match reply {
		RpcBody::StateInfoReply(info) => info,
		other => return Err(Error::unexpected_rpc_message(other)),
	};
	status::print_state_info(&info);
	Ok(())
}

async fn cmd_join(config: &Config, addr: SocketAddr) -> Result<(), Error> {
	let member_name = MemberName::from(config.member_name.clone());
	let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
	let system = System::new(
		member_name,
		config.rpc_bind_addr,
		config.cluster_secret.clone(),
		config.replication_factor,
		config.address_space_size.unwrap_or(DEFAULT_ADDRESS_SPACE_SIZE),
		transport,
	);
	system.join(addr).await?;
	println!("joined cluster via {}", addr);
	Ok(())
}

async fn cmd_eject(config: &Config, rpc_host: Option<SocketAddr>, name: String) -> Result<(), Error> {
	let addr = target_addr(config, rpc_host);
	send_admin(config, addr, RpcBody::EjectMember { name: MemberName::from(name.clone()) }).await?;
	println!("ejected {}", name);
	Ok(())
}

async fn cmd_lock(config: &Config, rpc_host: Option<SocketAddr>, name: String, acquire: bool) -> Result<(), Error> {
	let addr = target_addr(config, rpc_host);
	let holder = MemberName::from(config.member_name.clone());
	let body = if acquire {
		RpcBody::AcquireLock { name: name.clone(), holder }
	} else {
		RpcBody::ReleaseLock { name: name.clone(), holder }
	};
	send_admin(config, addr, body).await?;
	println!("{} {}", if acquire { "locked" } else { "unlocked" }, name);
	Ok(())
}
