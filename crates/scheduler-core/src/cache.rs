//! Cache keys and the cache backend interface (`spec.md` §3, §6).

use async_trait::async_trait;
use scheduler_util::Digest;

use crate::errors::SchedulerError;
use crate::result::ResultRef;

/// What kind of cache key this is. See `spec.md` §3 ("CacheKey").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKeyKind {
	/// Computed without running the vertex, from input fast keys and static
	/// attributes.
	Fast,
	/// Requires pulling input content (e.g. file hashing); computed by a
	/// worker.
	Slow,
	/// Retrieved from the cache backend by querying for alternates.
	Match,
}

/// A content-addressed cache key. Two keys with equal `digest` are considered
/// the same cache entry regardless of `kind` — `kind` only records how this
/// particular edge arrived at the digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
	pub kind: CacheKeyKind,
	pub digest: Digest,
}

impl CacheKey {
	pub fn fast(digest: Digest) -> Self {
		Self {
			kind: CacheKeyKind::Fast,
			digest,
		}
	}

	pub fn slow(digest: Digest) -> Self {
		Self {
			kind: CacheKeyKind::Slow,
			digest,
		}
	}

	pub fn matched(digest: Digest) -> Self {
		Self {
			kind: CacheKeyKind::Match,
			digest,
		}
	}
}

/// Per-input bookkeeping a vertex's `cacheMap` call produces for one
/// dependency: its contribution to key composition, and whether the
/// scheduler must escalate that dependency to a slow key before this edge can
/// compute its own slow key.
///
/// `spec.md` §9's second open question: a selector changes key composition
/// without independently triggering a slow-key fetch. Only `needs_slow`
/// triggers escalation; `selector` is folded into the digest either way.
#[derive(Debug, Clone)]
pub struct DepCacheInfo {
	pub selector: Option<Digest>,
	pub needs_slow: bool,
}

/// The result of a vertex's `cacheMap` call: the vertex's own static
/// contribution to its fast key, plus per-input selector/escalation info.
#[derive(Debug, Clone)]
pub struct CacheMap {
	pub static_digest: Digest,
	pub deps: Vec<DepCacheInfo>,
}

/// One matching entry the cache backend returned for a key.
#[derive(Debug, Clone)]
pub struct CacheRecord {
	pub key: CacheKey,
	pub result_id: String,
}

/// The cache storage backend. External collaborator — the scheduler only
/// calls through this trait; storage, eviction, and persistence are someone
/// else's problem.
#[async_trait]
pub trait CacheBackend: Send + Sync {
	/// Find records that satisfy `key` exactly.
	async fn query(&self, key: &CacheKey) -> Result<Vec<CacheRecord>, SchedulerError>;

	/// Load the output at `output` from a matched record.
	async fn load(&self, record: &CacheRecord, output: usize) -> Result<ResultRef, SchedulerError>;

	/// Find alternate records reachable from `key` (match-key lookup).
	async fn records(&self, key: &CacheKey) -> Result<Vec<CacheRecord>, SchedulerError>;

	/// Persist `result` as a record satisfying `key`, returning the stored
	/// record. `spec.md` §4.3: on executor completion an edge must "record
	/// all produced cache keys" so a later build against the same cache can
	/// hit instead of re-running `exec`.
	async fn store(&self, key: &CacheKey, result: &ResultRef) -> Result<CacheRecord, SchedulerError>;
}
