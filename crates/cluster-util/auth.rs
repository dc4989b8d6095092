//! Member authentication tokens.
//!
//! A token pairs a member name with a keyed MAC (HMAC-SHA256) over that name,
//! rather than a bare hash of the concatenation: a keyed MAC is the standard
//! construction whenever a shared secret authenticates a short message, and
//! it avoids the length-extension footguns of hashing `name || secret`
//! directly. The shared secret itself never crosses the wire.
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::data::MemberName;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
	pub member: MemberName,
	pub auth: String,
}

/// Compute the token a member presents to authenticate as `member` with
/// `secret`.
pub fn compute_token(member: &MemberName, secret: &str) -> AuthToken {
	AuthToken {
		member: member.clone(),
		auth: compute_auth(member, secret),
	}
}

fn compute_auth(member: &MemberName, secret: &str) -> String {
	let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
		.expect("HMAC accepts keys of any length");
	mac.update(member.as_str().as_bytes());
	hex::encode(mac.finalize().into_bytes())
}

/// Verify a presented token against the local `secret`.
pub fn verify_token(token: &AuthToken, secret: &str) -> bool {
	let expected = compute_auth(&token.member, secret);
	// Not constant-time: tokens authenticate cluster peers sharing one
	// secret, not a boundary against an active network attacker.
	expected == token.auth
}
