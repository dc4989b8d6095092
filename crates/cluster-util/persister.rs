//! Atomic single-file persistence: write to a temp file, fsync, then
//! rename over the target so a crash never leaves a half-written file.
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, ErrContext};

/// Persists a single serializable value to a JSON file, writing through a
/// temporary file + rename so a crash mid-write can never leave a
/// half-written file behind.
pub struct Persister<T> {
	path: PathBuf,
	_marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Persister<T> {
	pub fn new(base_dir: &std::path::Path, name: &str) -> Self {
		let mut path = base_dir.to_path_buf();
		path.push(name);
		Self {
			path,
			_marker: PhantomData,
		}
	}

	pub fn load(&self) -> Result<T, Error> {
		let data = std::fs::read(&self.path)
			.err_context(format!("Unable to read {}", self.path.display()))?;
		serde_json::from_slice(&data)
			.err_context(format!("Unable to parse {}", self.path.display()))
	}

	pub async fn load_async(&self) -> Result<T, Error> {
		let data = fs::read(&self.path)
			.await
			.err_context(format!("Unable to read {}", self.path.display()))?;
		serde_json::from_slice(&data)
			.err_context(format!("Unable to parse {}", self.path.display()))
	}

	pub async fn save_async(&self, value: &T) -> Result<(), Error> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent).await.ok();
		}
		let mut tmp_path = self.path.clone();
		tmp_path.set_extension("tmp");

		let data = serde_json::to_vec_pretty(value)
			.map_err(|e| Error::Message(format!("Unable to serialize persisted value: {}", e)))?;

		let mut f = fs::File::create(&tmp_path).await?;
		f.write_all(&data).await?;
		f.sync_all().await?;
		drop(f);

		fs::rename(&tmp_path, &self.path).await?;
		Ok(())
	}
}
