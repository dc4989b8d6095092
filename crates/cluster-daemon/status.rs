//! Formats a `StateInfo` for the `status` CLI subcommand as simple
//! tab-separated tables.
use cluster_util::data::StateInfo;

pub fn print_state_info(info: &StateInfo) {
	println!("==== MEMBERS ====");
	println!("Name\tAddress");
	for (name, addr) in &info.members {
		println!("{}\t{}", name, addr);
	}

	if !info.failed.is_empty() {
		println!();
		println!("==== FAILED ====");
		println!("Name\tReason");
		for (name, reason) in &info.failed {
			println!("{}\t{}", name, reason);
		}
	}

	println!();
	println!("Replication factor: {}", info.replication);
	println!(
		"Logical time: {}@{} (previous: {}@{})",
		info.ts.counter, info.ts.author, info.tsold.counter, info.tsold.author
	);
}
