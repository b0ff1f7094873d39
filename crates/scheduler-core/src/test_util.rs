//! An in-memory vertex/cache/result triple, feature-gated behind
//! `test-util`. Mirrors the teacher's lightweight stub node types (kept
//! around purely to exercise the pipeline without a real executor); used by
//! `scheduler-demo`'s integration tests and as a worked example of the three
//! external traits.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scheduler_util::Digest;

use crate::cache::{CacheBackend, CacheKey, CacheMap, CacheRecord, DepCacheInfo};
use crate::errors::SchedulerError;
use crate::pipe::CancelToken;
use crate::result::{ResultHandle, ResultRef};
use crate::vertex::{InputSpec, Vertex, VertexOptions};

/// A result handle backed by a plain byte payload held in memory.
#[derive(Debug)]
pub struct MemoryResult {
	id: String,
	payload: Vec<u8>,
	released: AtomicBool,
}

impl MemoryResult {
	pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> ResultRef {
		Arc::new(Self {
			id: id.into(),
			payload: payload.into(),
			released: AtomicBool::new(false),
		})
	}

	pub fn payload(&self) -> &[u8] {
		&self.payload
	}

	pub fn is_released(&self) -> bool {
		self.released.load(Ordering::SeqCst)
	}
}

impl ResultHandle for MemoryResult {
	fn id(&self) -> &str {
		&self.id
	}

	fn cache_keys(&self) -> Vec<CacheKey> {
		vec![]
	}

	fn clone_cached(&self) -> ResultRef {
		Arc::new(Self {
			id: self.id.clone(),
			payload: self.payload.clone(),
			released: AtomicBool::new(false),
		})
	}

	fn release(&self) {
		self.released.store(true, Ordering::SeqCst);
	}
}

/// A content-addressed in-memory cache backend. `put` registers a result
/// under a key's digest; `query`/`load`/`records` serve it back.
#[derive(Default)]
pub struct MemoryCache {
	records: Mutex<HashMap<Digest, (CacheRecord, ResultRef)>>,
}

impl MemoryCache {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn put(&self, key: CacheKey, result: ResultRef) {
		let record = CacheRecord {
			key: key.clone(),
			result_id: result.id().to_string(),
		};
		self.records.lock().unwrap().insert(key.digest, (record, result));
	}
}

#[async_trait]
impl CacheBackend for MemoryCache {
	async fn query(&self, key: &CacheKey) -> Result<Vec<CacheRecord>, SchedulerError> {
		Ok(self.records.lock().unwrap().get(&key.digest).map(|(record, _)| vec![record.clone()]).unwrap_or_default())
	}

	async fn load(&self, record: &CacheRecord, _output: usize) -> Result<ResultRef, SchedulerError> {
		self.records
			.lock()
			.unwrap()
			.get(&record.key.digest)
			.map(|(_, result)| result.clone_cached())
			.ok_or_else(|| SchedulerError::Internal(format!("no cached result for {:?}", record.key.digest)))
	}

	async fn records(&self, key: &CacheKey) -> Result<Vec<CacheRecord>, SchedulerError> {
		self.query(key).await
	}

	async fn store(&self, key: &CacheKey, result: &ResultRef) -> Result<CacheRecord, SchedulerError> {
		let record = CacheRecord {
			key: key.clone(),
			result_id: result.id().to_string(),
		};
		self.records.lock().unwrap().insert(key.digest, (record.clone(), result.clone_cached()));
		Ok(record)
	}
}

/// A vertex whose `exec` runs a plain closure over its resolved inputs —
/// stands in for a real opcode implementation.
pub struct FnVertex<F> {
	digest: Digest,
	inputs: Vec<InputSpec>,
	options: VertexOptions,
	exec_calls: AtomicUsize,
	exec_fn: F,
}

impl<F> fmt::Debug for FnVertex<F> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FnVertex").field("digest", &self.digest).field("inputs", &self.inputs.len()).finish()
	}
}

impl<F> FnVertex<F>
where
	F: Fn(Vec<ResultRef>) -> Result<ResultRef, SchedulerError> + Send + Sync + 'static,
{
	/// `label` seeds this vertex's content digest — two `FnVertex`es built
	/// with the same label and the same inputs are the same edge.
	pub fn new(label: &str, inputs: Vec<InputSpec>, options: VertexOptions, exec_fn: F) -> Arc<Self> {
		Arc::new(Self {
			digest: Digest::of(label),
			inputs,
			options,
			exec_calls: AtomicUsize::new(0),
			exec_fn,
		})
	}

	pub fn exec_calls(&self) -> usize {
		self.exec_calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl<F> Vertex for FnVertex<F>
where
	F: Fn(Vec<ResultRef>) -> Result<ResultRef, SchedulerError> + Send + Sync + 'static,
{
	fn inputs(&self) -> &[InputSpec] {
		&self.inputs
	}

	fn options(&self) -> &VertexOptions {
		&self.options
	}

	fn digest(&self) -> Digest {
		self.digest
	}

	async fn cache_map(&self, _ctx: &CancelToken, input_keys: &[CacheKey]) -> Result<CacheMap, SchedulerError> {
		Ok(CacheMap {
			static_digest: self.digest,
			deps: input_keys.iter().map(|_| DepCacheInfo { selector: None, needs_slow: false }).collect(),
		})
	}

	async fn exec(&self, _ctx: &CancelToken, inputs: Vec<ResultRef>) -> Result<Vec<ResultRef>, SchedulerError> {
		self.exec_calls.fetch_add(1, Ordering::SeqCst);
		(self.exec_fn)(inputs).map(|r| vec![r])
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn memory_cache_round_trips_a_put_result() {
		let cache = MemoryCache::new();
		let key = CacheKey::fast(Digest::of("k"));
		let result = MemoryResult::new("r1", b"payload".to_vec());
		cache.put(key.clone(), result);

		let records = cache.query(&key).await.unwrap();
		assert_eq!(records.len(), 1);
		let loaded = cache.load(&records[0], 0).await.unwrap();
		assert_eq!(loaded.id(), "r1");
	}

	#[tokio::test]
	async fn fn_vertex_runs_its_closure_and_counts_calls() {
		let vertex = FnVertex::new(
			"double",
			vec![],
			VertexOptions::default(),
			|_inputs| Ok(MemoryResult::new("out", b"x".to_vec())),
		);
		let outputs = vertex.exec(&CancelToken::default(), vec![]).await.unwrap();
		assert_eq!(outputs.len(), 1);
		assert_eq!(vertex.exec_calls(), 1);
	}
}
