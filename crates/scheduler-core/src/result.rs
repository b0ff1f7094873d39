//! The result-handle interface (`spec.md` §6, "Result interface").

use std::fmt::Debug;
use std::sync::Arc;

use crate::cache::CacheKey;

/// A reference-counted handle to a vertex's output, as produced by a cache
/// load or by `Vertex::exec`.
///
/// Implementations are expected to be cheap to clone (an `Arc` over shared
/// storage) and to make `release` idempotent, since the scheduler's merge and
/// error paths may end up holding more than one handle to the same underlying
/// content.
pub trait ResultHandle: Send + Sync + Debug {
	/// A stable identifier for this result, as assigned by the cache backend
	/// or the executor.
	fn id(&self) -> &str;

	/// The cache keys this result is known to satisfy. Populated from the
	/// cache record it was loaded from, or from the keys an edge produced
	/// while computing it.
	fn cache_keys(&self) -> Vec<CacheKey>;

	/// Clone this handle, incrementing whatever reference count backs it.
	/// Never duplicates storage without going through this: the edge-merge
	/// protocol calls this instead of copying the handle by value.
	fn clone_cached(&self) -> ResultRef;

	/// Release this handle. Must be safe to call more than once; only the
	/// first call may have an effect.
	fn release(&self);
}

/// A shared, dynamically-dispatched result handle.
pub type ResultRef = Arc<dyn ResultHandle>;
