//! Background worker scaffolding: a `Worker` trait plus a small runner that
//! spawns each worker on its own task and stops it on shutdown.
use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Error;

/// What a worker wants to do after one iteration of `work`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
	/// There's more to do right away; call `work` again without waiting.
	Busy,
	/// Nothing to do for now; sleep until woken or until `must_exit` changes.
	Idle,
	/// The worker has nothing left to ever do and can be dropped.
	Done,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
	pub progress: Option<String>,
	pub freeform: Vec<String>,
}

#[async_trait]
pub trait Worker: Send + 'static {
	fn name(&self) -> String;

	fn status(&self) -> WorkerStatus {
		WorkerStatus::default()
	}

	/// Run one iteration of the worker. Implementations must check
	/// `must_exit` promptly and return if it has changed; they must never
	/// block indefinitely without observing it.
	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerState, Error>;

	/// How long to sleep when `work` returns `WorkerState::Idle`.
	fn idle_delay(&self) -> std::time::Duration {
		std::time::Duration::from_secs(10)
	}
}

/// Spawns and owns background workers, all of which stop cooperatively
/// when the shared `must_exit` watch channel flips to `true`.
#[derive(Clone)]
pub struct BackgroundRunner {
	must_exit: watch::Receiver<bool>,
}

impl BackgroundRunner {
	pub fn new(must_exit: watch::Receiver<bool>) -> Self {
		Self { must_exit }
	}

	pub fn spawn_worker<W: Worker>(&self, mut worker: W) {
		let mut must_exit = self.must_exit.clone();
		tokio::spawn(async move {
			while !*must_exit.borrow() {
				match worker.work(&mut must_exit).await {
					Ok(WorkerState::Busy) => continue,
					Ok(WorkerState::Idle) => {
						let delay = tokio::time::sleep(worker.idle_delay());
						tokio::select! {
							_ = delay => {},
							_ = must_exit.changed() => {},
						}
					}
					Ok(WorkerState::Done) => break,
					Err(e) => {
						log::error!("Worker {} errored: {}", worker.name(), e);
						let delay = tokio::time::sleep(std::time::Duration::from_secs(1));
						tokio::select! {
							_ = delay => {},
							_ = must_exit.changed() => {},
						}
					}
				}
			}
		});
	}
}
