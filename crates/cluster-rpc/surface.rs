//! The RPC surface: a thin dispatcher in front of one member's `System`.
//! Every inbound envelope is token-checked here before `System` ever sees
//! it.
use std::sync::Arc;

use async_trait::async_trait;

use crate::system::System;
use crate::transport::{Dispatch, Envelope, RpcBody};

pub struct Surface {
	system: Arc<System>,
}

impl Surface {
	pub fn new(system: Arc<System>) -> Arc<Self> {
		Arc::new(Self { system })
	}

	pub fn system(&self) -> &Arc<System> {
		&self.system
	}
}

#[async_trait]
impl Dispatch for Surface {
	async fn dispatch(&self, envelope: Envelope) -> RpcBody {
		// JoinCluster and Ping may arrive before the caller knows our name;
		// an empty target is the only RPC that skips the target check.
		let target_ok = envelope.target.as_str().is_empty()
			&& matches!(envelope.body, RpcBody::Ping | RpcBody::JoinCluster { .. })
			|| envelope.target == *self.system.member_name();
		if !target_ok {
			return RpcBody::Err(format!("unknown RPC target: {}", envelope.target));
		}

		if !crate::system::verify(&envelope.token, self.system.secret()) {
			return RpcBody::Err("invalid authentication token".to_string());
		}

		self.system.handle_rpc(envelope.token.member, envelope.body).await
	}
}
