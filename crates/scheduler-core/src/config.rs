//! Dispatcher configuration (`spec.md` §6, "Environment").

/// Small plain config struct threaded through the driver at construction,
/// mirroring the teacher's `PipelineRunConfig`/`UfodConfig` pattern rather
/// than a global.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerConfig {
	/// Mirrors `BUILDKIT_SCHEDULER_DEBUG`: emit a `tracing` event at the
	/// dispatch/unpark boundary for every tick, not just merges and
	/// tripwires. Read once at construction, never re-read per tick.
	pub debug_trace: bool,
}

impl SchedulerConfig {
	/// Read `BUILDKIT_SCHEDULER_DEBUG` once. Any value other than unset,
	/// `"0"`, or `"false"` (case-insensitive) turns tracing on.
	pub fn from_env() -> Self {
		let debug_trace = match std::env::var("BUILDKIT_SCHEDULER_DEBUG") {
			Ok(v) => !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false")),
			Err(_) => false,
		};
		Self { debug_trace }
	}
}
