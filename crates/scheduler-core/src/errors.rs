//! Errors the scheduler can surface.
//!
//! See `spec.md` §7. Every error an edge can end up `Complete` with is one of
//! these five kinds; there is no sixth.

use std::sync::Arc;
use thiserror::Error;

use crate::result::ResultRef;

/// An error produced while resolving an edge.
#[derive(Debug, Error, Clone)]
pub enum SchedulerError {
	/// The driver asked the scheduler to build an edge that the graph index has
	/// never seen. Always a driver bug, surfaced immediately.
	#[error("unknown edge: vertex {digest} output {output}")]
	Validation {
		digest: scheduler_util::Digest,
		output: usize,
	},

	/// A required dependency edge completed with an error. Carries the inner
	/// error so consumers can see the original cause.
	#[error("dependency failed: {source}")]
	Dependency { source: Arc<SchedulerError> },

	/// `Vertex::exec` returned an error. Carries a snapshot of the inputs and
	/// mounts that were in scope at failure; ownership of that snapshot passes
	/// to this error until [`ExecutionError::release`] is called.
	#[error("execution failed: {message}")]
	Execution {
		message: String,
		#[source]
		snapshot: Arc<ExecutionError>,
	},

	/// The consumer's context was cancelled. Not a failure.
	#[error("build cancelled")]
	Cancelled,

	/// A post-unpark tripwire fired: `unpark` left an edge with open incoming
	/// requests and no open outgoing pipes, or vice versa. This is an algorithm
	/// defect in the edge state machine, not external input — see `spec.md` §9.
	/// Do not attempt to recover from this; it indicates a bug in this crate.
	#[error("internal scheduler invariant violated: {0}")]
	Internal(String),
}

/// The input/mount snapshot an [`SchedulerError::Execution`] carries.
///
/// `release` is safe to call exactly once; later calls are no-ops, which makes
/// double-release of the held handles impossible even if both the producing
/// edge and a confused consumer try to release it.
#[derive(Debug)]
pub struct ExecutionError {
	inputs: Vec<ResultRef>,
	released: std::sync::atomic::AtomicBool,
}

impl std::fmt::Display for ExecutionError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} input(s) in scope at failure", self.inputs.len())
	}
}

impl std::error::Error for ExecutionError {}

impl ExecutionError {
	pub fn new(inputs: Vec<ResultRef>) -> Self {
		Self {
			inputs,
			released: std::sync::atomic::AtomicBool::new(false),
		}
	}

	/// The result handles that were in scope when execution failed.
	pub fn inputs(&self) -> &[ResultRef] {
		&self.inputs
	}

	/// Release every held input handle. Safe to call more than once; only the
	/// first call has any effect.
	pub fn release(&self) {
		if self
			.released
			.compare_exchange(
				false,
				true,
				std::sync::atomic::Ordering::SeqCst,
				std::sync::atomic::Ordering::SeqCst,
			)
			.is_ok()
		{
			for input in &self.inputs {
				input.release();
			}
		}
	}
}
