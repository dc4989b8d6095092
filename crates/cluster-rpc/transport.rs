//! The wire format and the two transports that carry it: `LocalTransport`
//! for in-process multi-member test harnesses, and `TcpTransport` for a
//! real deployment.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster_util::data::{DataRequest, DataResponse, MemberName, StateInfo};
use cluster_util::Error;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// One request/reply message. The same enum carries both directions;
/// replies use the `*Reply`/bare-data variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcBody {
	Ping,
	/// `member_ts` is `None` when the sender does not consider the caller
	/// part of its cluster ("you are not in my cluster").
	Pong {
		member_ts: Option<PingTimes>,
	},
	StateInfoRequest,
	StateInfoReply(StateInfo),
	MemberInfoRequest,
	MemberInfoReply {
		name: MemberName,
		addr: SocketAddr,
	},
	JoinCluster {
		name: MemberName,
		addr: SocketAddr,
	},
	AddMember {
		name: MemberName,
		addr: SocketAddr,
		state_info: StateInfo,
	},
	EjectMember {
		name: MemberName,
	},
	AcquireLock {
		name: String,
		holder: MemberName,
	},
	ReleaseLock {
		name: String,
		holder: MemberName,
	},
	UpdateStateInfo(StateInfo),
	Data(DataRequest),
	DataReply(DataResponse),
	Ack,
	Err(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingTimes {
	pub ts_author: MemberName,
	pub ts_counter: u64,
	pub tsold_author: MemberName,
	pub tsold_counter: u64,
}

/// A full message in flight: the target member's name (for token
/// verification on the receiving side), the caller's auth token, and the
/// body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	pub target: MemberName,
	pub token: cluster_util::auth::AuthToken,
	pub body: RpcBody,
}

#[async_trait]
pub trait Transport: Send + Sync {
	async fn request(&self, addr: SocketAddr, envelope: Envelope) -> Result<RpcBody, Error>;
}

/// Something that can answer an `Envelope` without going over the network:
/// implemented by the RPC surface dispatcher.
#[async_trait]
pub trait Dispatch: Send + Sync {
	async fn dispatch(&self, envelope: Envelope) -> RpcBody;
}

/// In-process transport used by tests that spin up several members in one
/// address space: requests are routed directly to the target's dispatcher,
/// skipping serialization.
#[derive(Default)]
pub struct LocalTransport {
	registry: SyncMutex<HashMap<SocketAddr, Arc<dyn Dispatch>>>,
}

impl LocalTransport {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, addr: SocketAddr, dispatcher: Arc<dyn Dispatch>) {
		self.registry.lock().insert(addr, dispatcher);
	}

	pub fn unregister(&self, addr: SocketAddr) {
		self.registry.lock().remove(&addr);
	}
}

#[async_trait]
impl Transport for LocalTransport {
	async fn request(&self, addr: SocketAddr, envelope: Envelope) -> Result<RpcBody, Error> {
		let dispatcher = self
			.registry
			.lock()
			.get(&addr)
			.cloned()
			.ok_or_else(|| Error::member_comm(envelope.target.to_string(), "no such local address"))?;
		Ok(dispatcher.dispatch(envelope).await)
	}
}

/// TCP transport: one persistent connection per peer, length-prefixed
/// `bincode` frames, redialed on any error (spec's connection-reuse
/// policy).
#[derive(Default)]
pub struct TcpTransport {
	conns: AsyncMutex<HashMap<SocketAddr, TcpStream>>,
}

impl TcpTransport {
	pub fn new() -> Self {
		Self::default()
	}

	async fn dial(addr: SocketAddr) -> Result<TcpStream, Error> {
		tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
			.await
			.map_err(|_| Error::member_comm(addr.to_string(), "dial timed out"))?
			.map_err(|e| Error::member_comm(addr.to_string(), e))
	}

	async fn send_frame(stream: &mut TcpStream, envelope: &Envelope) -> Result<(), Error> {
		let bytes = bincode::serialize(envelope)
			.map_err(|e| Error::member_comm(envelope.target.to_string(), e))?;
		stream
			.write_all(&(bytes.len() as u32).to_be_bytes())
			.await
			.map_err(|e| Error::member_comm(envelope.target.to_string(), e))?;
		stream
			.write_all(&bytes)
			.await
			.map_err(|e| Error::member_comm(envelope.target.to_string(), e))?;
		Ok(())
	}

	async fn recv_frame(stream: &mut TcpStream) -> Result<RpcBody, Error> {
		let mut len_buf = [0u8; 4];
		stream
			.read_exact(&mut len_buf)
			.await
			.map_err(|e| Error::member_comm("<peer>", e))?;
		let len = u32::from_be_bytes(len_buf) as usize;
		let mut buf = vec![0u8; len];
		stream
			.read_exact(&mut buf)
			.await
			.map_err(|e| Error::member_comm("<peer>", e))?;
		bincode::deserialize(&buf).map_err(|e| Error::member_comm("<peer>", e))
	}
}

#[async_trait]
impl Transport for TcpTransport {
	async fn request(&self, addr: SocketAddr, envelope: Envelope) -> Result<RpcBody, Error> {
		let mut conns = self.conns.lock().await;
		let mut stream = match conns.remove(&addr) {
			Some(s) => s,
			None => Self::dial(addr).await?,
		};

		let result = async {
			Self::send_frame(&mut stream, &envelope).await?;
			Self::recv_frame(&mut stream).await
		}
		.await;

		match result {
			Ok(body) => {
				conns.insert(addr, stream);
				Ok(body)
			}
			Err(e) => {
				// Drop the broken connection; the next request redials.
				Err(e)
			}
		}
	}
}

/// Accepts connections on `listener` until the socket errors out, handing
/// each one to its own task that reads length-prefixed envelopes and hands
/// them to `dispatch`, one request at a time, until the peer disconnects.
///
/// The counterpart to `TcpTransport::request`'s framing: this is the only
/// side of the wire format that reads first instead of writing first.
pub async fn serve(listener: TcpListener, dispatch: Arc<dyn Dispatch>) -> Result<(), Error> {
	loop {
		let (stream, peer) = listener
			.accept()
			.await
			.map_err(|e| Error::member_comm("<listener>", e))?;
		let dispatch = dispatch.clone();
		tokio::spawn(async move {
			if let Err(e) = serve_connection(stream, dispatch).await {
				debug!("connection from {} closed: {}", peer, e);
			}
		});
	}
}

async fn serve_connection(mut stream: TcpStream, dispatch: Arc<dyn Dispatch>) -> Result<(), Error> {
	stream.set_nodelay(true).ok();
	loop {
		let mut len_buf = [0u8; 4];
		match stream.read_exact(&mut len_buf).await {
			Ok(_) => {}
			Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
			Err(e) => return Err(Error::member_comm("<peer>", e)),
		}
		let len = u32::from_be_bytes(len_buf) as usize;
		let mut buf = vec![0u8; len];
		stream
			.read_exact(&mut buf)
			.await
			.map_err(|e| Error::member_comm("<peer>", e))?;
		let envelope: Envelope = bincode::deserialize(&buf).map_err(|e| Error::member_comm("<peer>", e))?;

		let reply = dispatch.dispatch(envelope).await;
		let bytes = bincode::serialize(&reply).map_err(|e| Error::member_comm("<peer>", e))?;
		stream
			.write_all(&(bytes.len() as u32).to_be_bytes())
			.await
			.map_err(|e| Error::member_comm("<peer>", e))?;
		stream.write_all(&bytes).await.map_err(|e| Error::member_comm("<peer>", e))?;
	}
}
