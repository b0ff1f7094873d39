//! The vertex (opcode) interface (`spec.md` §6, "Vertex interface").
//!
//! Vertices are the external collaborator: instruction schema, wire format,
//! and execution all live outside this crate. The scheduler only needs enough
//! of a vertex to compute cache keys and to run it.

use async_trait::async_trait;
use scheduler_util::Digest;
use std::fmt::Debug;
use std::sync::Arc;

use crate::cache::CacheMap;
use crate::errors::SchedulerError;
use crate::pipe::CancelToken;
use crate::result::ResultRef;

/// Per-vertex options carried from the submitted definition
/// (`spec.md` §6, "External protocol").
#[derive(Debug, Clone, Default)]
pub struct VertexOptions {
	/// Skip the cache entirely: this vertex always executes.
	pub ignore_cache: bool,

	/// Refuse to merge this edge into, or absorb, another edge even if their
	/// cache keys coincide.
	pub skip_merge: bool,

	/// Human-readable description, carried through to observability only.
	pub description: Option<String>,

	/// Progress-group label, carried through to observability only.
	pub progress_group: Option<String>,
}

/// One declared input of a vertex: which vertex's which output feeds this
/// input port.
#[derive(Clone)]
pub struct InputSpec {
	pub vertex: Arc<dyn Vertex>,
	pub output: usize,

	/// If this input's producer fails, the edge substitutes a sentinel result
	/// instead of propagating the error (`spec.md` §4.3 "unless the opcode
	/// semantics declare the dep result optional", §7 kind 2, §8 scenario 5).
	pub optional: bool,
}

impl Debug for InputSpec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InputSpec")
			.field("vertex", &self.vertex.digest())
			.field("output", &self.output)
			.field("optional", &self.optional)
			.finish()
	}
}

/// A build instruction: one opcode with its declared inputs and options.
///
/// Implementations are expected to be small, cheap-to-clone descriptors — the
/// heavy lifting happens inside `cache_map` and `exec`, which the scheduler
/// calls through a function-backed pipe on a worker task.
#[async_trait]
pub trait Vertex: Send + Sync + Debug {
	/// This vertex's declared inputs, in port order.
	fn inputs(&self) -> &[InputSpec];

	/// This vertex's options (`ignore_cache`, `skip_merge`, ...).
	fn options(&self) -> &VertexOptions;

	/// A stable content digest over this vertex's opcode and static
	/// attributes (not including its inputs' keys — those are folded in by
	/// the edge when it composes its own fast key).
	fn digest(&self) -> Digest;

	/// Derive this vertex's static fast-key contribution and per-input
	/// selector/escalation info, given the current input keys. `ctx` is
	/// cancelled when the function-backed pipe carrying this call is
	/// cancelled (`spec.md` §4.1).
	async fn cache_map(&self, ctx: &CancelToken, input_keys: &[crate::cache::CacheKey]) -> Result<CacheMap, SchedulerError>;

	/// Run this vertex against resolved input results, producing one result
	/// per declared output. `ctx` is cancelled when the function-backed pipe
	/// carrying this call is cancelled (`spec.md` §4.1, §6 "exec(ctx,
	/// inputResults)") — a real executor should poll it and abort promptly.
	async fn exec(&self, ctx: &CancelToken, inputs: Vec<ResultRef>) -> Result<Vec<ResultRef>, SchedulerError>;
}
