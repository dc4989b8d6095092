use cluster_util::auth::{compute_token, verify_token};
use cluster_util::data::{LogicalTime, MemberName};

#[test]
fn token_round_trips_with_matching_secret() {
	let member = MemberName::from("node1");
	let token = compute_token(&member, "s3cret");
	assert!(verify_token(&token, "s3cret"));
	assert!(!verify_token(&token, "wrong"));
}

#[test]
fn token_differs_per_member() {
	let a = compute_token(&MemberName::from("node1"), "s3cret");
	let b = compute_token(&MemberName::from("node2"), "s3cret");
	assert_ne!(a.auth, b.auth);
}

#[test]
fn logical_time_orders_by_counter_then_author() {
	let a = LogicalTime {
		author: MemberName::from("zz"),
		counter: 1,
	};
	let b = LogicalTime {
		author: MemberName::from("aa"),
		counter: 2,
	};
	assert!(a < b, "higher counter must win regardless of author name");

	let c = LogicalTime {
		author: MemberName::from("aa"),
		counter: 1,
	};
	assert!(c < a, "same counter falls back to author ordering");
}
