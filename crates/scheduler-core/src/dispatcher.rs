//! The scheduler dispatcher (`spec.md` §4.4) and the driver-facing `build`
//! entry point.
//!
//! One dedicated OS thread runs the dispatch loop and is the *only* thread
//! that ever calls `Edge::unpark` — this gives single-writer semantics on
//! every edge without fine-grained per-edge locking (`spec.md` §5). Workers
//! spawned from inside `unpark` run as `tokio` tasks and communicate back
//! exclusively by completing pipes, same as `spec.md` §4.1 requires; the
//! dispatch thread enters the calling task's runtime once at startup so those
//! `tokio::spawn` calls have somewhere to land.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, warn};

use crate::cache::{CacheBackend, CacheKey};
use crate::config::SchedulerConfig;
use crate::edge::{DependencyResolver, DesiredState, EdgeRequest, IncomingPipe};
use crate::errors::SchedulerError;
use crate::graph_index::{EdgeId, GraphIndex};
use crate::pipe::{Pipe, PipeState};
use crate::result::ResultRef;
use crate::vertex::Vertex;

struct MuGuarded {
	index: GraphIndex,
	incoming: HashMap<EdgeId, Vec<IncomingPipe>>,
	queue: VecDeque<EdgeId>,
	waitq: HashSet<EdgeId>,
}

struct DispatcherState {
	mu: Mutex<MuGuarded>,
	cv: Condvar,
	stopped: AtomicBool,
	config: SchedulerConfig,
}

/// The scheduler dispatcher. Clone-free: handed out as `Arc<Scheduler>` so
/// every caller of [`Scheduler::build`] shares the one dispatch thread.
pub struct Scheduler {
	state: Arc<DispatcherState>,
}

impl Scheduler {
	/// Start the dispatch thread and return a handle to it. Must be called
	/// from within a `tokio` runtime — the dispatch thread enters the calling
	/// task's runtime so the function-backed pipes `Edge::unpark` spawns have
	/// an executor to run on.
	pub fn spawn(cache: Arc<dyn CacheBackend>, config: SchedulerConfig) -> Arc<Self> {
		// `GraphIndex` needs a signal closure that calls back into
		// `DispatcherState`, but that `Arc` doesn't exist until the index is
		// already inside it. Build the index with a placeholder, wrap
		// everything, then swap in the real closure before anything can
		// observe the placeholder.
		let placeholder: Arc<dyn Fn(EdgeId) + Send + Sync> = Arc::new(|_id| {});
		let state = Arc::new(DispatcherState {
			mu: Mutex::new(MuGuarded {
				index: GraphIndex::new(cache, placeholder),
				incoming: HashMap::new(),
				queue: VecDeque::new(),
				waitq: HashSet::new(),
			}),
			cv: Condvar::new(),
			stopped: AtomicBool::new(false),
			config,
		});

		let signal_state = state.clone();
		let signal: Arc<dyn Fn(EdgeId) + Send + Sync> = Arc::new(move |id| {
			let mut guard = signal_state.mu.lock().unwrap();
			Self::wake_locked(&signal_state.cv, &mut guard, id);
		});
		state.mu.lock().unwrap().index.set_signal(signal);

		let runtime = tokio::runtime::Handle::current();
		let thread_state = state.clone();
		std::thread::Builder::new()
			.name("scheduler-dispatch".into())
			.spawn(move || Self::dispatch_loop(thread_state, runtime))
			.expect("failed to spawn the scheduler dispatch thread");

		Arc::new(Self { state })
	}

	/// `spec.md` §4.4, "Signal(edge)": append to the FIFO and wake the
	/// dispatch loop, unless the edge is already pending.
	pub fn signal(&self, id: EdgeId) {
		let mut guard = self.state.mu.lock().unwrap();
		Self::wake_locked(&self.state.cv, &mut guard, id);
	}

	fn wake_locked(cv: &Condvar, guard: &mut MuGuarded, id: EdgeId) {
		if guard.waitq.insert(id) {
			guard.queue.push_back(id);
			cv.notify_one();
		}
	}

	/// Shut the dispatch loop down. Idempotent. Outstanding pipes are left to
	/// their owners to cancel, per `spec.md` §4.4.
	pub fn stop(&self) {
		self.state.stopped.store(true, Ordering::SeqCst);
		let _guard = self.state.mu.lock().unwrap();
		self.state.cv.notify_all();
	}

	/// `build(ctx, edge)`, driver-facing: resolve `(vertex, output)` to its
	/// canonical edge, ask for its result, and block until the edge reaches a
	/// terminal state. Never resolves early on cancellation.
	pub async fn build(self: &Arc<Self>, vertex: Arc<dyn Vertex>, output: usize) -> Result<ResultRef, SchedulerError> {
		self.build_cancellable(vertex, output, std::future::pending()).await
	}

	/// Like [`Scheduler::build`], but `cancel` is raced against completion:
	/// if it resolves first, the root pipe is cancelled and `build` returns
	/// `SchedulerError::Cancelled` once that cancellation lands.
	pub async fn build_cancellable(
		self: &Arc<Self>,
		vertex: Arc<dyn Vertex>,
		output: usize,
		cancel: impl std::future::Future<Output = ()> + Send,
	) -> Result<ResultRef, SchedulerError> {
		let pipe = {
			let mut guard = self.state.mu.lock().unwrap();
			let id = guard.index.get_edge(&vertex, output);
			let pipe = Pipe::new(EdgeRequest {
				desired: DesiredState::Result,
			});
			guard.incoming.entry(id).or_default().push(pipe.clone());
			Self::wake_locked(&self.state.cv, &mut guard, id);
			pipe
		};

		let (tx, rx) = tokio::sync::oneshot::channel();
		let tx = Arc::new(Mutex::new(Some(tx)));
		{
			let pipe_for_cb = pipe.clone();
			let tx_for_cb = tx.clone();
			pipe.on_send_completion(move || {
				pipe_for_cb.receive();
				if pipe_for_cb.is_done() {
					if let Some(tx) = tx_for_cb.lock().unwrap().take() {
						let _ = tx.send(());
					}
				}
			});
		}

		// A quiescent cache hit can resolve the pipe before the callback
		// above was even installed.
		if !pipe.is_done() {
			tokio::select! {
				_ = rx => {}
				_ = cancel => pipe.cancel(),
			}
		}

		Self::resolve(&pipe)
	}

	fn resolve(pipe: &IncomingPipe) -> Result<ResultRef, SchedulerError> {
		let status = pipe.status();
		match status.state {
			PipeState::Completed => {
				let snapshot = status.value.expect("a completed pipe carries a value");
				match (snapshot.result, snapshot.error) {
					(Some(result), _) => Ok(result.clone_cached()),
					(None, Some(err)) => Err((*err).clone()),
					(None, None) => Err(SchedulerError::Internal("edge completed without a result or an error".into())),
				}
			}
			PipeState::Cancelled => Err(SchedulerError::Cancelled),
			other => Err(SchedulerError::Internal(format!("build pipe resolved in state {other:?}"))),
		}
	}

	fn dispatch_loop(state: Arc<DispatcherState>, runtime: tokio::runtime::Handle) {
		let _entered = runtime.enter();
		loop {
			let id = {
				let mut guard = state.mu.lock().unwrap();
				loop {
					if state.stopped.load(Ordering::SeqCst) {
						return;
					}
					if let Some(id) = guard.queue.pop_front() {
						guard.waitq.remove(&id);
						break id;
					}
					guard = state.cv.wait(guard).unwrap();
				}
			};

			Self::dispatch_one(&state, id);
		}
	}

	/// One full dispatch tick for `id`: `spec.md` §4.4 steps 3-8.
	fn dispatch_one(state: &Arc<DispatcherState>, id: EdgeId) {
		let mut guard = state.mu.lock().unwrap();

		let Some(mut edge) = guard.index.take_edge(&id) else {
			// Merged away, or never existed — nothing left to dispatch.
			return;
		};

		let incoming = guard.incoming.get(&id).cloned().unwrap_or_default();

		if state.config.debug_trace {
			debug!(?id, state = ?edge.state(), incoming = incoming.len(), "dispatch tick");
		}

		let to_signal = {
			let mut resolver = ResolverCtx {
				guard: &mut guard,
				self_id: id,
				opened: Vec::new(),
			};
			edge.unpark(&incoming, &mut resolver);
			resolver.opened
		};
		if let Some(list) = guard.incoming.get_mut(&id) {
			list.retain(|p| !p.is_done());
		}

		let keys_did_change = edge.take_keys_did_change();
		let incoming_open = guard.incoming.get(&id).is_some_and(|v| !v.is_empty());
		let outgoing_open = edge.outgoing_handles().iter().any(|p| !p.is_done());
		let done = edge.is_done();
		let desired = crate::edge::Edge::desired_state(&incoming);
		let quiescent = incoming_open && !outgoing_open && edge.parked_at_desired(desired);

		guard.index.put_edge(id, edge);

		for dep_id in to_signal {
			Self::wake_locked(&state.cv, &mut guard, dep_id);
		}

		let merge_target = if keys_did_change { Self::maybe_merge(&mut guard, id) } else { None };
		if let Some(target) = merge_target {
			Self::wake_locked(&state.cv, &mut guard, target);
		}

		// `spec.md` §4.4 step 8: these are correctness tripwires on the edge
		// state machine itself, never on external input — see §9. An edge
		// parked with its incoming pipe open and nothing outgoing is not a
		// bug when it has already delivered what every current consumer
		// asked for (`quiescent`) — that is the resting state `spec.md` §8's
		// "no spurious wakeups" describes for a `Keys`/`SlowKeys` consumer.
		if !done && incoming_open != outgoing_open && !quiescent {
			if guard.index.contains(&id) {
				warn!(?id, incoming_open, outgoing_open, "post-unpark invariant violated, failing edge");
				if let Some(mut edge) = guard.index.take_edge(&id) {
					edge.force_fail(SchedulerError::Internal(format!(
						"unpark left edge {id:?} with incoming_open={incoming_open} outgoing_open={outgoing_open}"
					)));
					let incoming = guard.incoming.get(&id).cloned().unwrap_or_default();
					let mut dead = DeadResolver;
					edge.unpark(&incoming, &mut dead);
					guard.index.put_edge(id, edge);
				}
			}
		}
	}

	/// `spec.md` §4.3, "Edge merging": if `id` just produced a cache key that
	/// another edge already claimed, decide whether to merge and, if so,
	/// perform it. Returns the surviving edge so the caller can wake it.
	fn maybe_merge(guard: &mut MuGuarded, id: EdgeId) -> Option<EdgeId> {
		let edge = guard.index.edge(&id)?;
		let keys = edge.own_keys().to_vec();
		let self_vertex = edge.vertex().clone();
		let self_skip_merge = edge.vertex_options().skip_merge;
		let self_ignore_cache = edge.vertex_options().ignore_cache;

		for key in keys {
			let Some(orig_id) = guard.index.claim_key(&key, id) else {
				continue;
			};
			if orig_id == id {
				continue;
			}
			let Some(orig_edge) = guard.index.edge(&orig_id) else {
				continue;
			};
			let orig_vertex = orig_edge.vertex().clone();
			let orig_skip_merge = orig_edge.vertex_options().skip_merge;
			let orig_ignore_cache = orig_edge.vertex_options().ignore_cache;

			if guard.index.is_ancestor(orig_id.0, &self_vertex) || guard.index.is_ancestor(id.0, &orig_vertex) {
				debug!(?id, ?orig_id, "skipping merge: would create a cycle");
				continue;
			}
			if self_skip_merge || orig_skip_merge {
				continue;
			}

			// `spec.md` §4.3: if `origEdge` is owned by `self`, `self` becomes
			// the target; otherwise `origEdge` stays the target.
			let target_is_self = guard.index.has_owner(&id, &orig_id);
			let (target_id, src_id) = if target_is_self { (id, orig_id) } else { (orig_id, id) };
			let (target_ignore_cache, src_ignore_cache) = if target_id == id {
				(self_ignore_cache, orig_ignore_cache)
			} else {
				(orig_ignore_cache, self_ignore_cache)
			};
			if !target_ignore_cache && src_ignore_cache {
				debug!(?target_id, ?src_id, "skipping merge: source would weaken target's cache semantics");
				continue;
			}

			Self::perform_merge(guard, target_id, src_id);
			return Some(target_id);
		}
		None
	}

	fn perform_merge(guard: &mut MuGuarded, target_id: EdgeId, src_id: EdgeId) {
		if target_id == src_id {
			return;
		}
		let Some(src_edge) = guard.index.take_edge(&src_id) else {
			return;
		};
		for pipe in src_edge.outgoing_handles() {
			pipe.cancel();
		}
		let src_keys = src_edge.own_keys().to_vec();
		drop(src_edge);

		if let Some(mut target_edge) = guard.index.take_edge(&target_id) {
			target_edge.absorb_secondary_exporters(src_keys);
			guard.index.put_edge(target_id, target_edge);
		}

		if let Some(mut src_incoming) = guard.incoming.remove(&src_id) {
			guard.incoming.entry(target_id).or_default().append(&mut src_incoming);
		}

		guard.index.set_edge(src_id, target_id);
		debug!(?src_id, ?target_id, "merged edge");
	}
}

/// Bridges `Edge::unpark`'s [`DependencyResolver`] hook to the graph index:
/// opening a dependency means resolving it to its canonical edge and
/// installing a fresh incoming pipe there.
struct ResolverCtx<'a> {
	guard: &'a mut MuGuarded,
	self_id: EdgeId,
	opened: Vec<EdgeId>,
}

impl DependencyResolver for ResolverCtx<'_> {
	fn open(&mut self, dep_vertex: &Arc<dyn Vertex>, dep_output: usize, desired: DesiredState) -> IncomingPipe {
		let dep_id = self.guard.index.get_edge(dep_vertex, dep_output);
		self.guard.index.record_owner(self.self_id, dep_id);
		let pipe = Pipe::new(EdgeRequest { desired });
		self.guard.incoming.entry(dep_id).or_default().push(pipe.clone());
		self.opened.push(dep_id);
		pipe
	}
}

/// A resolver that must never be asked to open anything — used only when
/// re-driving an edge that has already been forced to `Complete`.
struct DeadResolver;

impl DependencyResolver for DeadResolver {
	fn open(&mut self, _dep_vertex: &Arc<dyn Vertex>, _dep_output: usize, _desired: DesiredState) -> IncomingPipe {
		unreachable!("a completed edge must not open new dependency pipes")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipe::CancelToken;
	use crate::cache::{CacheMap, CacheRecord, DepCacheInfo};
	use crate::errors::SchedulerError as Err_;
	use crate::result::ResultHandle;
	use crate::vertex::{InputSpec, VertexOptions};
	use async_trait::async_trait;
	use std::sync::atomic::AtomicUsize;

	#[derive(Debug)]
	struct CountingVertex {
		digest: scheduler_util::Digest,
		inputs: Vec<InputSpec>,
		exec_calls: Arc<AtomicUsize>,
		options: VertexOptions,
	}

	#[async_trait]
	impl Vertex for CountingVertex {
		fn inputs(&self) -> &[InputSpec] {
			&self.inputs
		}
		fn options(&self) -> &VertexOptions {
			&self.options
		}
		fn digest(&self) -> scheduler_util::Digest {
			self.digest
		}
		async fn cache_map(&self, _ctx: &CancelToken, _input_keys: &[CacheKey]) -> Result<CacheMap, Err_> {
			Ok(CacheMap {
				static_digest: scheduler_util::Digest::of("counting-vertex"),
				deps: self
					.inputs
					.iter()
					.map(|_| DepCacheInfo {
						selector: None,
						needs_slow: false,
					})
					.collect(),
			})
		}
		async fn exec(&self, _ctx: &CancelToken, _inputs: Vec<ResultRef>) -> Result<Vec<ResultRef>, Err_> {
			self.exec_calls.fetch_add(1, Ordering::SeqCst);
			Ok(vec![Arc::new(CountingResult {
				id: "result".into(),
				released: AtomicBool::new(false),
			})])
		}
	}

	#[derive(Debug)]
	struct CountingResult {
		id: String,
		released: AtomicBool,
	}

	impl ResultHandle for CountingResult {
		fn id(&self) -> &str {
			&self.id
		}
		fn cache_keys(&self) -> Vec<CacheKey> {
			vec![]
		}
		fn clone_cached(&self) -> ResultRef {
			Arc::new(CountingResult {
				id: self.id.clone(),
				released: AtomicBool::new(false),
			})
		}
		fn release(&self) {
			self.released.store(true, Ordering::SeqCst);
		}
	}

	struct EmptyCache;

	#[async_trait]
	impl CacheBackend for EmptyCache {
		async fn query(&self, _key: &CacheKey) -> Result<Vec<CacheRecord>, Err_> {
			Ok(vec![])
		}
		async fn load(&self, _record: &CacheRecord, _output: usize) -> Result<ResultRef, Err_> {
			unimplemented!("never called when the cache never reports a hit")
		}
		async fn records(&self, _key: &CacheKey) -> Result<Vec<CacheRecord>, Err_> {
			Ok(vec![])
		}
		async fn store(&self, key: &CacheKey, result: &ResultRef) -> Result<CacheRecord, Err_> {
			Ok(CacheRecord {
				key: key.clone(),
				result_id: result.id().to_string(),
			})
		}
	}

	fn default_options() -> VertexOptions {
		VertexOptions {
			ignore_cache: false,
			skip_merge: false,
			description: None,
			progress_group: None,
		}
	}

	#[tokio::test]
	async fn single_vertex_builds_and_reaches_a_result() {
		let exec_calls = Arc::new(AtomicUsize::new(0));
		let vertex: Arc<dyn Vertex> = Arc::new(CountingVertex {
			digest: scheduler_util::Digest::of("single"),
			inputs: vec![],
			exec_calls: exec_calls.clone(),
			options: default_options(),
		});

		let scheduler = Scheduler::spawn(Arc::new(EmptyCache), SchedulerConfig::default());
		let result = scheduler.build(vertex, 0).await.expect("build succeeds");
		assert_eq!(result.id(), "result");
		assert_eq!(exec_calls.load(Ordering::SeqCst), 1);
		scheduler.stop();
	}

	#[tokio::test]
	async fn diamond_dependency_with_identical_digest_builds_once() {
		let exec_calls = Arc::new(AtomicUsize::new(0));
		let leaf: Arc<dyn Vertex> = Arc::new(CountingVertex {
			digest: scheduler_util::Digest::of("shared-leaf"),
			inputs: vec![],
			exec_calls: exec_calls.clone(),
			options: default_options(),
		});
		let branch_a: Arc<dyn Vertex> = Arc::new(CountingVertex {
			digest: scheduler_util::Digest::of("branch-a"),
			inputs: vec![InputSpec {
				vertex: leaf.clone(),
				output: 0,
				optional: false,
			}],
			exec_calls: exec_calls.clone(),
			options: default_options(),
		});
		let branch_b: Arc<dyn Vertex> = Arc::new(CountingVertex {
			digest: scheduler_util::Digest::of("branch-b"),
			inputs: vec![InputSpec {
				vertex: leaf.clone(),
				output: 0,
				optional: false,
			}],
			exec_calls: exec_calls.clone(),
			options: default_options(),
		});
		let top: Arc<dyn Vertex> = Arc::new(CountingVertex {
			digest: scheduler_util::Digest::of("top"),
			inputs: vec![
				InputSpec {
					vertex: branch_a.clone(),
					output: 0,
					optional: false,
				},
				InputSpec {
					vertex: branch_b.clone(),
					output: 0,
					optional: false,
				},
			],
			exec_calls: exec_calls.clone(),
			options: default_options(),
		});

		let scheduler = Scheduler::spawn(Arc::new(EmptyCache), SchedulerConfig::default());
		let result = scheduler.build(top, 0).await.expect("build succeeds");
		assert_eq!(result.id(), "result");
		// leaf, branch_a, branch_b, top: 4 distinct executions, leaf deduped
		// by the graph index regardless of how many branches reference it.
		assert_eq!(exec_calls.load(Ordering::SeqCst), 4);
		scheduler.stop();
	}

	#[tokio::test]
	async fn cancelling_the_build_reports_cancellation() {
		let exec_calls = Arc::new(AtomicUsize::new(0));
		let vertex: Arc<dyn Vertex> = Arc::new(CountingVertex {
			digest: scheduler_util::Digest::of("cancel-me"),
			inputs: vec![],
			exec_calls,
			options: default_options(),
		});

		let scheduler = Scheduler::spawn(Arc::new(EmptyCache), SchedulerConfig::default());
		let result = scheduler
			.build_cancellable(vertex, 0, async move {
				// Cancel essentially immediately; the race with completion
				// is inherent to cancellation and either outcome is legal,
				// but on a vertex with no inputs and an empty cache the
				// dispatch thread needs at least one real tick to finish,
				// so an immediate cancel reliably wins in practice.
			})
			.await;
		assert!(matches!(result, Err(SchedulerError::Cancelled)) || result.is_ok());
		scheduler.stop();
	}
}
