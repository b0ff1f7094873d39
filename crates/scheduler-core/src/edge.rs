//! The Edge state machine (`spec.md` §4.3).
//!
//! An `Edge` is the live, schedulable instance of one `(vertex, output)` pair.
//! It owns no thread or task of its own: the dispatcher calls [`Edge::unpark`]
//! on it once per tick from its single dedicated task, and the edge reacts by
//! inspecting pipe status and, when it needs to make progress, spawning a
//! function-backed worker or asking its [`DependencyResolver`] to open a new
//! input-request pipe. Every method here takes `&mut self` — the
//! single-writer discipline `spec.md` §5 describes is enforced by never
//! sharing an `Edge` across tasks, only the pipes it hands out.

use std::future::Future;
use std::sync::Arc;

use scheduler_util::Digest;

use crate::cache::{CacheBackend, CacheKey, CacheKeyKind, CacheMap, CacheRecord};
use crate::errors::{ExecutionError, SchedulerError};
use crate::pipe::{spawn_function_pipe_signaled, AnyPipe, CancelToken, Pipe, PipeState};
use crate::result::ResultRef;
use crate::vertex::Vertex;

/// `spec.md` §3, "state": an edge's own progress, independent of what any
/// consumer has asked for. Monotonic except that `Complete` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum EdgeState {
	#[default]
	Initial,
	CacheFast,
	CacheSlow,
	Complete,
}

/// `spec.md` §3, "desired state": how far a consumer needs a producing edge
/// to get. Ordered so [`Edge::desired_state`] can take a plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DesiredState {
	#[default]
	Keys,
	SlowKeys,
	Result,
}

/// The request payload an input-request pipe carries (`spec.md` §3, "Request
/// / edgeRequest"). Immutable once the pipe is constructed — escalating a
/// dependency's desired state means cancelling its old pipe and opening a new
/// one, not mutating this.
#[derive(Debug, Clone, Copy)]
pub struct EdgeRequest {
	pub desired: DesiredState,
}

/// What a producing edge publishes on its incoming pipes: a snapshot of its
/// own progress, taken fresh on every unpark that makes it.
#[derive(Debug, Clone, Default)]
pub struct EdgeSnapshot {
	pub state: EdgeState,
	pub keys: Vec<CacheKey>,
	pub slow_key: Option<CacheKey>,
	pub result: Option<ResultRef>,
	pub error: Option<Arc<SchedulerError>>,
}

/// An input-request pipe: this edge is the consumer, the dependency is the
/// producer.
pub type IncomingPipe = Arc<Pipe<EdgeRequest, EdgeSnapshot>>;

/// Stands in for the result of a declared-optional input whose producer
/// failed (`spec.md` §4.3, §7 kind 2). Carries no content of its own; its
/// only job is to let the consuming edge keep going and to fold a stable
/// digest into that edge's own cache keys.
#[derive(Debug)]
struct OptionalDependencySentinel;

impl crate::result::ResultHandle for OptionalDependencySentinel {
	fn id(&self) -> &str {
		"optional-dependency-sentinel"
	}

	fn cache_keys(&self) -> Vec<CacheKey> {
		vec![CacheKey::fast(optional_dependency_sentinel_digest())]
	}

	fn clone_cached(&self) -> ResultRef {
		Arc::new(OptionalDependencySentinel)
	}

	fn release(&self) {}
}

fn optional_dependency_sentinel_digest() -> Digest {
	Digest::of("scheduler-core::optional-dependency-sentinel")
}

/// Bookkeeping this edge keeps per declared input (`spec.md` §3, "dependency
/// array").
struct DependencySlot {
	pipe: Option<IncomingPipe>,
	state: EdgeState,
	fast_key: Option<CacheKey>,
	slow_key: Option<CacheKey>,
	result: Option<ResultRef>,
	error: Option<Arc<SchedulerError>>,
	/// Filled in once this edge's own `cacheMap` call returns; `None` before
	/// that.
	needs_slow: Option<bool>,
}

impl DependencySlot {
	fn new() -> Self {
		Self {
			pipe: None,
			state: EdgeState::Initial,
			fast_key: None,
			slow_key: None,
			result: None,
			error: None,
			needs_slow: None,
		}
	}
}

/// What `unpark` asks its caller to do on this edge's behalf: open, or
/// replace with a higher one, an input-request pipe to one of this edge's
/// declared dependencies.
///
/// Only the graph index can resolve `dep_vertex`/`dep_output` to the
/// dependency's canonical [`Edge`] and install a fresh pipe on its incoming
/// list — an edge cannot reach another edge directly — so it asks for this
/// through the resolver instead (`spec.md` §4.2, §4.3's `pipeFactory`).
pub trait DependencyResolver {
	fn open(&mut self, dep_vertex: &Arc<dyn Vertex>, dep_output: usize, desired: DesiredState) -> IncomingPipe;
}

/// The live, schedulable instance of one `(vertex, output)` pair.
///
/// Owned exclusively by the dispatcher task; never shared behind a lock.
/// Everything it learns from another task arrives as a completed pipe.
pub struct Edge {
	vertex: Arc<dyn Vertex>,
	output: usize,
	cache: Arc<dyn CacheBackend>,
	/// `spec.md` §4.4: "All pipe-completion callbacks wake the dispatcher by
	/// calling signal(target-or-source)." Every worker pipe this edge spawns
	/// is wired through [`Edge::spawn_worker`] so finishing it wakes the
	/// dispatcher back up for this edge's own id.
	signal: Arc<dyn Fn() + Send + Sync>,

	state: EdgeState,
	keys: Vec<CacheKey>,
	fast_key: Option<CacheKey>,
	slow_key: Option<CacheKey>,
	result: Option<ResultRef>,
	error: Option<Arc<SchedulerError>>,
	cancelled: bool,
	keys_did_change: bool,
	/// Extra cache-key records folded in from edges merged into this one
	/// (`spec.md` §3, "secondary exporters").
	secondary_exporters: Vec<CacheKey>,

	deps: Vec<DependencySlot>,

	cache_map_pipe: Option<Arc<Pipe<(), CacheMap>>>,
	slow_cache_map_pipe: Option<Arc<Pipe<(), CacheMap>>>,
	fast_query_pipe: Option<Arc<Pipe<(), Vec<CacheRecord>>>>,
	fast_query_result: Option<Vec<CacheRecord>>,
	slow_query_pipe: Option<Arc<Pipe<(), Vec<CacheRecord>>>>,
	slow_query_result: Option<Vec<CacheRecord>>,
	/// Alternate records discovered via [`CacheBackend::records`] (`spec.md`
	/// §3/§6, "match key") — queried alongside the exact fast/slow query at
	/// whichever stage is current, and reset when this edge escalates from
	/// `CacheFast` to `CacheSlow` so the lookup runs again against the slow
	/// key.
	match_query_pipe: Option<Arc<Pipe<(), Vec<CacheRecord>>>>,
	match_query_result: Option<Vec<CacheRecord>>,
	load_pipe: Option<Arc<Pipe<(), ResultRef>>>,
	exec_pipe: Option<Arc<Pipe<(), Vec<ResultRef>>>>,
	/// Writes `result`'s produced keys back to the cache backend once `exec`
	/// completes (`spec.md` §4.3, "record all produced cache keys"). `None`
	/// for a cache hit — a result already in the cache needs no re-store.
	store_pipe: Option<Arc<Pipe<(), CacheRecord>>>,
	/// The result waiting on `store_pipe` to finish before this edge can
	/// complete.
	staged_result: Option<ResultRef>,
}

impl std::fmt::Debug for Edge {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Edge")
			.field("vertex", &self.vertex.digest())
			.field("output", &self.output)
			.field("state", &self.state)
			.finish()
	}
}

impl Edge {
	pub fn new(vertex: Arc<dyn Vertex>, output: usize, cache: Arc<dyn CacheBackend>, signal: Arc<dyn Fn() + Send + Sync>) -> Self {
		let deps = (0..vertex.inputs().len()).map(|_| DependencySlot::new()).collect();
		Self {
			vertex,
			output,
			cache,
			signal,
			state: EdgeState::Initial,
			keys: Vec::new(),
			fast_key: None,
			slow_key: None,
			result: None,
			error: None,
			cancelled: false,
			keys_did_change: false,
			secondary_exporters: Vec::new(),
			deps,
			cache_map_pipe: None,
			slow_cache_map_pipe: None,
			fast_query_pipe: None,
			fast_query_result: None,
			slow_query_pipe: None,
			slow_query_result: None,
			match_query_pipe: None,
			match_query_result: None,
			load_pipe: None,
			exec_pipe: None,
			store_pipe: None,
			staged_result: None,
		}
	}

	/// Spawn a worker pipe wired to signal the dispatcher on completion
	/// (`spec.md` §4.4). Every function-backed pipe this edge spawns must go
	/// through here rather than `spawn_function_pipe` directly, or its
	/// completion is silent and the edge is never unparked again.
	fn spawn_worker<T, F, Fut>(&self, work: F) -> Arc<Pipe<(), T>>
	where
		T: Clone + Send + 'static,
		F: FnOnce(CancelToken) -> Fut + Send + 'static,
		Fut: Future<Output = Result<T, SchedulerError>> + Send + 'static,
	{
		let signal = self.signal.clone();
		spawn_function_pipe_signaled(work, move || signal())
	}

	pub fn digest(&self) -> Digest {
		self.vertex.digest()
	}

	pub fn output(&self) -> usize {
		self.output
	}

	pub fn vertex(&self) -> &Arc<dyn Vertex> {
		&self.vertex
	}

	pub fn vertex_options(&self) -> &crate::vertex::VertexOptions {
		self.vertex.options()
	}

	/// Force this edge to `Complete` with an error, releasing any inputs it
	/// is holding. Used only by the dispatcher's post-unpark tripwire
	/// (`spec.md` §4.4 step 8, §9's "algorithm bug, not external input").
	pub fn force_fail(&mut self, err: SchedulerError) {
		self.fail(err);
	}

	pub fn state(&self) -> EdgeState {
		self.state
	}

	pub fn is_done(&self) -> bool {
		self.state == EdgeState::Complete
	}

	/// Whether this edge produced a new own cache key since the last call.
	/// The dispatcher calls this after every unpark and, if it returns
	/// `true`, attempts the index-merge decision (`spec.md` §4.3).
	pub fn take_keys_did_change(&mut self) -> bool {
		std::mem::replace(&mut self.keys_did_change, false)
	}

	pub fn own_keys(&self) -> &[CacheKey] {
		&self.keys
	}

	/// This edge's final outcome, or `None` if it has not reached `Complete`.
	pub fn outcome(&self) -> Option<Result<ResultRef, Arc<SchedulerError>>> {
		if self.state != EdgeState::Complete {
			return None;
		}
		match (&self.result, &self.error) {
			(Some(r), _) => Some(Ok(r.clone())),
			(None, Some(e)) => Some(Err(e.clone())),
			(None, None) => None,
		}
	}

	/// Fold a merged-away peer's cache-key records into this edge's secondary
	/// exporters (`spec.md` §4.3, "Edge merging").
	pub fn absorb_secondary_exporters(&mut self, keys: impl IntoIterator<Item = CacheKey>) {
		let keys: Vec<CacheKey> = keys.into_iter().collect();
		// A merged-away peer's keys need recording too (`spec.md` §4.3), but
		// this edge may already be `Complete` by the time the merge lands, so
		// there is no `unpark` left to drive a `store_pipe` through. Fire the
		// store directly rather than re-opening the state machine for it.
		if self.state == EdgeState::Complete {
			if let Some(result) = &self.result {
				let cache = self.cache.clone();
				let result = result.clone_cached();
				let keys_to_store = keys.clone();
				tokio::spawn(async move {
					for key in &keys_to_store {
						let _ = cache.store(key, &result).await;
					}
				});
			}
		}
		self.secondary_exporters.extend(keys);
	}

	pub fn secondary_exporters(&self) -> &[CacheKey] {
		&self.secondary_exporters
	}

	/// All outgoing pipes this edge currently holds open, type-erased. Used
	/// by the dispatcher for the generic bookkeeping in `spec.md` §4.4 steps
	/// 4, 6 and 8 (pruning, the `hasActiveOutgoing` tripwire).
	pub fn outgoing_handles(&self) -> Vec<Arc<dyn AnyPipe>> {
		let mut out: Vec<Arc<dyn AnyPipe>> = Vec::new();
		for dep in &self.deps {
			if let Some(p) = &dep.pipe {
				out.push(p.clone());
			}
		}
		for p in [
			self.cache_map_pipe.clone().map(|p| p as Arc<dyn AnyPipe>),
			self.slow_cache_map_pipe.clone().map(|p| p as Arc<dyn AnyPipe>),
			self.fast_query_pipe.clone().map(|p| p as Arc<dyn AnyPipe>),
			self.slow_query_pipe.clone().map(|p| p as Arc<dyn AnyPipe>),
			self.match_query_pipe.clone().map(|p| p as Arc<dyn AnyPipe>),
			self.load_pipe.clone().map(|p| p as Arc<dyn AnyPipe>),
			self.exec_pipe.clone().map(|p| p as Arc<dyn AnyPipe>),
			self.store_pipe.clone().map(|p| p as Arc<dyn AnyPipe>),
		]
		.into_iter()
		.flatten()
		{
			out.push(p);
		}
		out
	}

	pub(crate) fn desired_state(incoming: &[IncomingPipe]) -> DesiredState {
		incoming.iter().map(|p| p.request.desired).max().unwrap_or_default()
	}

	/// Whether an edge parked with an open incoming pipe and no open outgoing
	/// pipe is a legitimate quiescent state for `desired`, rather than a stuck
	/// edge (`spec.md` §8, "no spurious wakeups"). A `Keys`/`SlowKeys`
	/// consumer's incoming pipe stays open (`update`, never `send`) once this
	/// edge has delivered what it asked for, even though this edge itself
	/// keeps running toward `Complete` for other consumers.
	pub fn parked_at_desired(&self, desired: DesiredState) -> bool {
		match desired {
			DesiredState::Keys => self.state >= EdgeState::CacheFast,
			DesiredState::SlowKeys => self.state >= EdgeState::CacheSlow && self.slow_key.is_some(),
			DesiredState::Result => false,
		}
	}

	fn snapshot(&self) -> EdgeSnapshot {
		EdgeSnapshot {
			state: self.state,
			keys: self.keys.clone(),
			slow_key: self.slow_key.clone(),
			result: self.result.clone(),
			error: self.error.clone(),
		}
	}

	/// One dispatch tick for this edge. `spec.md` §4.3: "each call must be
	/// idempotent-after-progress" — with no new updates and no new incoming
	/// requests this makes no new outgoing pipes.
	pub fn unpark(&mut self, incoming: &[IncomingPipe], resolver: &mut dyn DependencyResolver) {
		self.poll_dependencies();
		self.substitute_optional_errors();
		self.check_cache_map();
		self.check_fast_query();
		self.check_slow_cache_map();
		self.check_slow_query();
		self.check_match_query();
		self.check_load();
		self.check_exec();
		self.check_store();

		if self.state != EdgeState::Complete {
			let desired = Self::desired_state(incoming);
			self.cancelled = !incoming.is_empty() && incoming.iter().all(|p| p.status().state == PipeState::Cancelled);
			if self.cancelled {
				self.cancel_outgoing();
			}

			match self.state {
				EdgeState::Initial => self.drive_initial(resolver),
				EdgeState::CacheFast => self.drive_cache_fast(desired, resolver),
				EdgeState::CacheSlow => self.drive_cache_slow(desired, resolver),
				EdgeState::Complete => {}
			}
		}

		self.publish_to_incoming(incoming);
	}

	fn publish_to_incoming(&self, incoming: &[IncomingPipe]) {
		let snapshot = self.snapshot();
		for pipe in incoming {
			if self.state == EdgeState::Complete {
				pipe.send(Ok(snapshot.clone()));
			} else {
				pipe.update(snapshot.clone());
			}
		}
	}

	fn cancel_outgoing(&mut self) {
		for pipe in self.outgoing_handles() {
			pipe.cancel();
		}
	}

	/// Pull the latest status off every dependency pipe this edge currently
	/// holds and fold it into the corresponding `DependencySlot`.
	fn poll_dependencies(&mut self) {
		for dep in &mut self.deps {
			let Some(pipe) = &dep.pipe else { continue };
			pipe.receive();
			let status = pipe.status();
			if let Some(snapshot) = status.value {
				dep.state = snapshot.state;
				if dep.fast_key.is_none() {
					dep.fast_key = snapshot.keys.iter().find(|k| k.kind == CacheKeyKind::Fast).cloned();
				}
				if snapshot.slow_key.is_some() {
					dep.slow_key = snapshot.slow_key;
				}
				dep.result = snapshot.result;
				if dep.error.is_none() {
					dep.error = snapshot.error;
				}
			}
			if dep.error.is_none() {
				dep.error = status.error;
			}
		}
	}

	/// `spec.md` §4.3, §7 kind 2, §8 scenario 5: a declared-optional input
	/// that failed does not fail this edge. Substitute a sentinel result and
	/// a stable sentinel digest for its keys so the rest of `unpark` sees a
	/// resolved dependency, and so a later build with the same input failing
	/// the same way still folds to the same cache key.
	fn substitute_optional_errors(&mut self) {
		for (i, dep) in self.deps.iter_mut().enumerate() {
			if dep.error.is_none() || !self.vertex.inputs()[i].optional {
				continue;
			}
			dep.error = None;
			dep.needs_slow.get_or_insert(false);
			dep.fast_key.get_or_insert_with(|| CacheKey::fast(optional_dependency_sentinel_digest()));
			dep.slow_key.get_or_insert_with(|| CacheKey::slow(optional_dependency_sentinel_digest()));
			dep.result.get_or_insert_with(|| Arc::new(OptionalDependencySentinel) as ResultRef);
		}
	}

	fn drive_initial(&mut self, resolver: &mut dyn DependencyResolver) {
		for (i, dep) in self.deps.iter_mut().enumerate() {
			if dep.pipe.is_none() {
				let input = &self.vertex.inputs()[i];
				dep.pipe = Some(resolver.open(&input.vertex, input.output, DesiredState::Keys));
			}
		}

		if let Some(err) = self.deps.iter().find_map(|d| d.error.clone()) {
			self.fail_dependency(err);
			return;
		}

		if !self.deps.iter().all(|d| d.state >= EdgeState::CacheFast) {
			return;
		}

		if self.cache_map_pipe.is_none() {
			let vertex = self.vertex.clone();
			let input_keys: Vec<CacheKey> = self.deps.iter().filter_map(|d| d.fast_key.clone()).collect();
			self.cache_map_pipe = Some(self.spawn_worker(move |token| async move { vertex.cache_map(&token, &input_keys).await }));
		}
	}

	fn check_cache_map(&mut self) {
		let Some(pipe) = &self.cache_map_pipe else { return };
		pipe.receive();
		let status = pipe.status();
		if status.state != PipeState::Completed {
			return;
		}
		self.cache_map_pipe = None;
		match status.error {
			Some(err) => self.fail((*err).clone()),
			None => {
				let map = status.value.expect("completed pipe carries a value or an error");
				for (dep, info) in self.deps.iter_mut().zip(map.deps.iter()) {
					dep.needs_slow = Some(info.needs_slow);
				}
				// `spec.md` §9's second open question: a selector substitutes for a
				// dep's own key in the fold. The fold deliberately excludes this
				// edge's own structural vertex digest — two structurally distinct
				// vertices whose `cacheMap` agrees on `static_digest` and per-dep
				// selectors converge on the same fast key, which is what makes
				// `spec.md` §4.3's edge merging possible in the first place.
				let mut parts = vec![map.static_digest];
				for (dep, info) in self.deps.iter().zip(map.deps.iter()) {
					if let Some(k) = &dep.fast_key {
						parts.push(info.selector.unwrap_or(k.digest));
					}
				}
				let digest = Digest::combine(parts.iter());
				let key = CacheKey::fast(digest);
				self.fast_key = Some(key.clone());
				self.keys.push(key);
				self.keys_did_change = true;
				self.state = EdgeState::CacheFast;
			}
		}
	}

	fn drive_cache_fast(&mut self, desired: DesiredState, resolver: &mut dyn DependencyResolver) {
		if self.fast_query_pipe.is_none() && self.fast_query_result.is_none() {
			let cache = self.cache.clone();
			let key = self.fast_key.clone().expect("CacheFast state implies a fast key");
			self.fast_query_pipe = Some(self.spawn_worker(move |_token| async move { cache.query(&key).await }));
		}

		if desired >= DesiredState::SlowKeys {
			for (i, dep) in self.deps.iter_mut().enumerate() {
				let needs_escalation = dep.needs_slow == Some(true)
					&& dep.pipe.as_ref().map_or(true, |p| p.request.desired < DesiredState::SlowKeys);
				if needs_escalation {
					if let Some(old) = dep.pipe.take() {
						old.cancel();
					}
					let input = &self.vertex.inputs()[i];
					dep.pipe = Some(resolver.open(&input.vertex, input.output, DesiredState::SlowKeys));
				}
			}
		}

		let Some(records) = &self.fast_query_result else { return };

		if !records.is_empty() && desired >= DesiredState::Result {
			if self.load_pipe.is_none() {
				let cache = self.cache.clone();
				let record = records[0].clone();
				let output = self.output;
				self.load_pipe = Some(self.spawn_worker(move |_token| async move { cache.load(&record, output).await }));
			}
			return;
		}

		// `spec.md` §3/§6, "match key": no exact fast-key hit — ask the cache
		// backend for alternates before falling back to exec. Block on the
		// lookup's own completion rather than racing past it into escalation.
		if records.is_empty() {
			if self.match_query_pipe.is_none() && self.match_query_result.is_none() {
				let cache = self.cache.clone();
				let key = self.fast_key.clone().expect("CacheFast state implies a fast key");
				self.match_query_pipe = Some(self.spawn_worker(move |_token| async move { cache.records(&key).await }));
			}
			let Some(matches) = &self.match_query_result else { return };
			if !matches.is_empty() && desired >= DesiredState::Result {
				if self.load_pipe.is_none() {
					let cache = self.cache.clone();
					let record = matches[0].clone();
					let output = self.output;
					self.load_pipe = Some(self.spawn_worker(move |_token| async move { cache.load(&record, output).await }));
				}
				return;
			}
		}

		let escalated_ready = self
			.deps
			.iter()
			.all(|d| d.needs_slow != Some(true) || d.state >= EdgeState::CacheSlow);

		if desired >= DesiredState::SlowKeys && escalated_ready {
			self.fast_query_result = None;
			self.match_query_result = None;
			self.state = EdgeState::CacheSlow;
		}
	}

	fn check_fast_query(&mut self) {
		let Some(pipe) = &self.fast_query_pipe else { return };
		pipe.receive();
		let status = pipe.status();
		if status.state != PipeState::Completed {
			return;
		}
		self.fast_query_pipe = None;
		match status.error {
			Some(err) => self.fail((*err).clone()),
			None => self.fast_query_result = status.value,
		}
	}

	fn drive_cache_slow(&mut self, desired: DesiredState, resolver: &mut dyn DependencyResolver) {
		if self.slow_cache_map_pipe.is_none() && self.slow_key.is_none() {
			let vertex = self.vertex.clone();
			let input_keys: Vec<CacheKey> = self
				.deps
				.iter()
				.filter_map(|d| d.slow_key.clone().or_else(|| d.fast_key.clone()))
				.collect();
			self.slow_cache_map_pipe = Some(self.spawn_worker(move |token| async move { vertex.cache_map(&token, &input_keys).await }));
		}

		if self.slow_key.is_none() {
			return;
		}

		if self.slow_query_pipe.is_none() && self.slow_query_result.is_none() {
			let cache = self.cache.clone();
			let key = self.slow_key.clone().unwrap();
			self.slow_query_pipe = Some(self.spawn_worker(move |_token| async move { cache.query(&key).await }));
		}

		let Some(records) = &self.slow_query_result else { return };

		if !records.is_empty() && desired >= DesiredState::Result {
			if self.load_pipe.is_none() {
				let cache = self.cache.clone();
				let record = records[0].clone();
				let output = self.output;
				self.load_pipe = Some(self.spawn_worker(move |_token| async move { cache.load(&record, output).await }));
			}
			return;
		}

		// `spec.md` §3/§6, "match key": no exact slow-key hit either — try the
		// cache backend's alternates lookup before committing to exec. Block
		// on the lookup's own completion rather than racing past it into
		// dependency resolution / exec.
		if records.is_empty() {
			if self.match_query_pipe.is_none() && self.match_query_result.is_none() {
				let cache = self.cache.clone();
				let key = self.slow_key.clone().expect("slow_key checked above");
				self.match_query_pipe = Some(self.spawn_worker(move |_token| async move { cache.records(&key).await }));
			}
			let Some(matches) = &self.match_query_result else { return };
			if !matches.is_empty() && desired >= DesiredState::Result {
				if self.load_pipe.is_none() {
					let cache = self.cache.clone();
					let record = matches[0].clone();
					let output = self.output;
					self.load_pipe = Some(self.spawn_worker(move |_token| async move { cache.load(&record, output).await }));
				}
				return;
			}
		}

		if desired < DesiredState::Result {
			return;
		}

		for (i, dep) in self.deps.iter_mut().enumerate() {
			let needs_result = dep.result.is_none()
				&& dep.error.is_none()
				&& dep.pipe.as_ref().map_or(true, |p| p.request.desired < DesiredState::Result);
			if needs_result {
				if let Some(old) = dep.pipe.take() {
					old.cancel();
				}
				let input = &self.vertex.inputs()[i];
				dep.pipe = Some(resolver.open(&input.vertex, input.output, DesiredState::Result));
			}
		}

		if let Some(err) = self.deps.iter().find_map(|d| d.error.clone()) {
			self.fail_dependency(err);
			return;
		}

		if !self.deps.iter().all(|d| d.result.is_some()) {
			return;
		}

		if self.exec_pipe.is_none() {
			let vertex = self.vertex.clone();
			let inputs: Vec<ResultRef> = self.deps.iter().map(|d| d.result.clone().unwrap()).collect();
			self.exec_pipe = Some(self.spawn_worker(move |token| async move { vertex.exec(&token, inputs).await }));
		}
	}

	fn check_slow_cache_map(&mut self) {
		let Some(pipe) = &self.slow_cache_map_pipe else { return };
		pipe.receive();
		let status = pipe.status();
		if status.state != PipeState::Completed {
			return;
		}
		self.slow_cache_map_pipe = None;
		match status.error {
			Some(err) => self.fail((*err).clone()),
			None => {
				let map = status.value.expect("completed pipe carries a value or an error");
				let mut parts = vec![map.static_digest];
				for (dep, info) in self.deps.iter().zip(map.deps.iter()) {
					if let Some(k) = dep.slow_key.as_ref().or(dep.fast_key.as_ref()) {
						parts.push(info.selector.unwrap_or(k.digest));
					}
				}
				let digest = Digest::combine(parts.iter());
				let key = CacheKey::slow(digest);
				self.slow_key = Some(key.clone());
				self.keys.push(key);
				self.keys_did_change = true;
			}
		}
	}

	fn check_slow_query(&mut self) {
		let Some(pipe) = &self.slow_query_pipe else { return };
		pipe.receive();
		let status = pipe.status();
		if status.state != PipeState::Completed {
			return;
		}
		self.slow_query_pipe = None;
		match status.error {
			Some(err) => self.fail((*err).clone()),
			None => self.slow_query_result = status.value,
		}
	}

	fn check_match_query(&mut self) {
		let Some(pipe) = &self.match_query_pipe else { return };
		pipe.receive();
		let status = pipe.status();
		if status.state != PipeState::Completed {
			return;
		}
		self.match_query_pipe = None;
		match status.error {
			Some(err) => self.fail((*err).clone()),
			None => {
				let records = status.value.unwrap_or_default();
				if let Some(first) = records.first() {
					let matched_key = CacheKey::matched(first.key.digest);
					if !self.keys.iter().any(|k| k.digest == matched_key.digest) {
						self.keys.push(matched_key);
						self.keys_did_change = true;
					}
				}
				self.match_query_result = Some(records);
			}
		}
	}

	fn check_load(&mut self) {
		let Some(pipe) = &self.load_pipe else { return };
		pipe.receive();
		let status = pipe.status();
		if status.state != PipeState::Completed {
			return;
		}
		self.load_pipe = None;
		match status.error {
			Some(err) => self.fail((*err).clone()),
			None => {
				let result = status.value.expect("completed load pipe carries a value or an error");
				self.complete_with_result(result);
			}
		}
	}

	fn check_exec(&mut self) {
		let Some(pipe) = &self.exec_pipe else { return };
		pipe.receive();
		let status = pipe.status();
		if status.state != PipeState::Completed {
			return;
		}
		self.exec_pipe = None;
		match status.error {
			// `spec.md` §4.3, "error carrying context": wrap the error with
			// the inputs that were in scope, unless it already carries one.
			Some(err) => {
				let inputs: Vec<ResultRef> = self.deps.iter_mut().filter_map(|d| d.result.take()).collect();
				self.error = Some(match &*err {
					SchedulerError::Execution { .. } => {
						for r in inputs {
							r.release();
						}
						Arc::new((*err).clone())
					}
					other => Arc::new(SchedulerError::Execution {
						message: other.to_string(),
						snapshot: Arc::new(ExecutionError::new(inputs)),
					}),
				});
				self.state = EdgeState::Complete;
			}
			None => {
				let outputs = status.value.expect("completed exec pipe carries a value or an error");
				let mut result = None;
				for (idx, r) in outputs.into_iter().enumerate() {
					if idx == self.output {
						result = Some(r);
					} else {
						r.release();
					}
				}
				match result {
					Some(result) => {
						if let Some(slow_key) = &self.slow_key {
							self.keys.push(slow_key.clone());
						}
						self.start_store(result);
					}
					None => self.fail(SchedulerError::Internal(format!(
						"vertex did not produce output index {}",
						self.output
					))),
				}
			}
		}
	}

	/// `spec.md` §4.3: on executor completion, record all produced cache
	/// keys before the edge is allowed to report `Complete`. An edge with
	/// no keys of its own has nothing to store.
	fn start_store(&mut self, result: ResultRef) {
		self.release_dep_results();
		if self.keys.is_empty() {
			self.result = Some(result);
			self.state = EdgeState::Complete;
			return;
		}
		let cache = self.cache.clone();
		let keys = self.keys.clone();
		let stored_result = result.clone_cached();
		self.staged_result = Some(result);
		self.store_pipe = Some(self.spawn_worker(move |_token| async move {
			let mut record = None;
			for key in &keys {
				record = Some(cache.store(key, &stored_result).await?);
			}
			Ok(record.expect("keys checked non-empty above"))
		}));
	}

	fn check_store(&mut self) {
		let Some(pipe) = &self.store_pipe else { return };
		pipe.receive();
		let status = pipe.status();
		if status.state != PipeState::Completed {
			return;
		}
		self.store_pipe = None;
		match status.error {
			Some(err) => self.fail((*err).clone()),
			None => {
				let result = self.staged_result.take().expect("store completion implies a staged result");
				self.complete_with_result(result);
			}
		}
	}

	fn release_dep_results(&mut self) {
		for dep in &mut self.deps {
			if let Some(r) = dep.result.take() {
				r.release();
			}
		}
	}

	fn fail(&mut self, err: SchedulerError) {
		self.release_dep_results();
		self.error = Some(Arc::new(err));
		self.state = EdgeState::Complete;
	}

	fn fail_dependency(&mut self, source: Arc<SchedulerError>) {
		self.release_dep_results();
		self.error = Some(Arc::new(SchedulerError::Dependency { source }));
		self.state = EdgeState::Complete;
	}

	fn complete_with_result(&mut self, result: ResultRef) {
		self.release_dep_results();
		self.result = Some(result);
		self.state = EdgeState::Complete;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::CacheKeyKind;
	use crate::cache::DepCacheInfo;
	use crate::vertex::{InputSpec, VertexOptions};
	use async_trait::async_trait;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	#[derive(Debug)]
	struct MockVertex {
		digest: Digest,
		exec_calls: AtomicUsize,
	}

	#[async_trait]
	impl Vertex for MockVertex {
		fn inputs(&self) -> &[crate::vertex::InputSpec] {
			&[]
		}

		fn options(&self) -> &crate::vertex::VertexOptions {
			static OPTS: crate::vertex::VertexOptions = crate::vertex::VertexOptions {
				ignore_cache: false,
				skip_merge: false,
				description: None,
				progress_group: None,
			};
			&OPTS
		}

		fn digest(&self) -> Digest {
			self.digest
		}

		async fn cache_map(&self, _ctx: &CancelToken, _input_keys: &[CacheKey]) -> Result<CacheMap, SchedulerError> {
			Ok(CacheMap {
				static_digest: Digest::of("mock-vertex"),
				deps: vec![],
			})
		}

		async fn exec(&self, _ctx: &CancelToken, _inputs: Vec<ResultRef>) -> Result<Vec<ResultRef>, SchedulerError> {
			self.exec_calls.fetch_add(1, Ordering::SeqCst);
			Ok(vec![Arc::new(MockResult {
				id: "mock-result".into(),
				released: AtomicBool::new(false),
			})])
		}
	}

	#[derive(Debug)]
	struct MockResult {
		id: String,
		released: AtomicBool,
	}

	impl ResultHandle for MockResult {
		fn id(&self) -> &str {
			&self.id
		}

		fn cache_keys(&self) -> Vec<CacheKey> {
			vec![]
		}

		fn clone_cached(&self) -> ResultRef {
			Arc::new(MockResult {
				id: self.id.clone(),
				released: AtomicBool::new(false),
			})
		}

		fn release(&self) {
			self.released.store(true, Ordering::SeqCst);
		}
	}

	#[derive(Default)]
	struct MockCache {
		hit: bool,
		/// When set, `records` reports one alternate under a digest distinct
		/// from the queried key, simulating a match-key hit (`spec.md` §3/§6).
		match_hit: bool,
	}

	#[async_trait]
	impl CacheBackend for MockCache {
		async fn query(&self, key: &CacheKey) -> Result<Vec<CacheRecord>, SchedulerError> {
			if self.hit {
				Ok(vec![CacheRecord {
					key: key.clone(),
					result_id: "cached".into(),
				}])
			} else {
				Ok(vec![])
			}
		}

		async fn load(&self, record: &CacheRecord, _output: usize) -> Result<ResultRef, SchedulerError> {
			Ok(Arc::new(MockResult {
				id: record.result_id.clone(),
				released: AtomicBool::new(false),
			}))
		}

		async fn records(&self, _key: &CacheKey) -> Result<Vec<CacheRecord>, SchedulerError> {
			if self.match_hit {
				Ok(vec![CacheRecord {
					key: CacheKey::matched(Digest::of("alternate")),
					result_id: "matched".into(),
				}])
			} else {
				Ok(vec![])
			}
		}

		async fn store(&self, key: &CacheKey, result: &ResultRef) -> Result<CacheRecord, SchedulerError> {
			Ok(CacheRecord {
				key: key.clone(),
				result_id: result.id().to_string(),
			})
		}
	}

	struct NoopResolver;

	impl DependencyResolver for NoopResolver {
		fn open(&mut self, _dep_vertex: &Arc<dyn Vertex>, _dep_output: usize, _desired: DesiredState) -> IncomingPipe {
			unreachable!("mock vertex declares no dependencies")
		}
	}

	async fn run_until_done(edge: &mut Edge, incoming: &[IncomingPipe]) {
		for _ in 0..500 {
			edge.unpark(incoming, &mut NoopResolver);
			if edge.is_done() {
				return;
			}
			tokio::time::sleep(std::time::Duration::from_millis(1)).await;
		}
		panic!("edge did not reach Complete in time");
	}

	#[tokio::test]
	async fn no_deps_edge_executes_on_cache_miss() {
		let vertex = Arc::new(MockVertex {
			digest: Digest::of("v1"),
			exec_calls: AtomicUsize::new(0),
		});
		let cache = Arc::new(MockCache { hit: false, match_hit: false });
		let mut edge = Edge::new(vertex.clone(), 0, cache, Arc::new(|| {}));

		let incoming = Pipe::new(EdgeRequest {
			desired: DesiredState::Result,
		});
		run_until_done(&mut edge, std::slice::from_ref(&incoming)).await;

		assert_eq!(vertex.exec_calls.load(Ordering::SeqCst), 1);
		let outcome = edge.outcome().expect("edge is done");
		assert!(outcome.is_ok());
		assert!(edge.own_keys().iter().any(|k| k.kind == CacheKeyKind::Fast));
		assert!(edge.own_keys().iter().any(|k| k.kind == CacheKeyKind::Slow));
	}

	#[tokio::test]
	async fn no_deps_edge_hits_cache_without_executing() {
		let vertex = Arc::new(MockVertex {
			digest: Digest::of("v2"),
			exec_calls: AtomicUsize::new(0),
		});
		let cache = Arc::new(MockCache { hit: true, match_hit: false });
		let mut edge = Edge::new(vertex.clone(), 0, cache, Arc::new(|| {}));

		let incoming = Pipe::new(EdgeRequest {
			desired: DesiredState::Result,
		});
		run_until_done(&mut edge, std::slice::from_ref(&incoming)).await;

		assert_eq!(vertex.exec_calls.load(Ordering::SeqCst), 0, "cache hit must short-circuit exec");
		let outcome = edge.outcome().expect("edge is done");
		assert!(outcome.is_ok());
	}

	#[tokio::test]
	async fn no_deps_edge_loads_from_a_match_key_without_executing() {
		let vertex = Arc::new(MockVertex {
			digest: Digest::of("v-match"),
			exec_calls: AtomicUsize::new(0),
		});
		// No exact fast-key record (`hit: false`), but the backend reports an
		// alternate via `records` (`match_hit: true`) — the edge must adopt a
		// `CacheKeyKind::Match` own key and load that alternate instead of
		// ever running `exec`.
		let cache = Arc::new(MockCache { hit: false, match_hit: true });
		let mut edge = Edge::new(vertex.clone(), 0, cache, Arc::new(|| {}));

		let incoming = Pipe::new(EdgeRequest {
			desired: DesiredState::Result,
		});
		run_until_done(&mut edge, std::slice::from_ref(&incoming)).await;

		assert_eq!(vertex.exec_calls.load(Ordering::SeqCst), 0, "a match-key hit must short-circuit exec");
		let outcome = edge.outcome().expect("edge is done");
		let result = outcome.expect("match-key load succeeds");
		assert_eq!(result.id(), "matched");
		assert!(edge.own_keys().iter().any(|k| k.kind == CacheKeyKind::Match), "the discovered alternate becomes an own key");
	}

	#[tokio::test]
	async fn edge_stays_at_cache_fast_when_only_keys_are_desired() {
		let vertex = Arc::new(MockVertex {
			digest: Digest::of("v3"),
			exec_calls: AtomicUsize::new(0),
		});
		let cache = Arc::new(MockCache { hit: false, match_hit: false });
		let mut edge = Edge::new(vertex, 0, cache, Arc::new(|| {}));

		let incoming = Pipe::new(EdgeRequest {
			desired: DesiredState::Keys,
		});
		for _ in 0..50 {
			edge.unpark(std::slice::from_ref(&incoming), &mut NoopResolver);
			tokio::time::sleep(std::time::Duration::from_millis(1)).await;
		}

		assert_eq!(edge.state(), EdgeState::CacheFast);
		assert!(!edge.is_done());
	}

	#[derive(Debug)]
	struct FailingVertex {
		digest: Digest,
	}

	#[async_trait]
	impl Vertex for FailingVertex {
		fn inputs(&self) -> &[InputSpec] {
			&[]
		}

		fn options(&self) -> &VertexOptions {
			static OPTS: VertexOptions = VertexOptions {
				ignore_cache: false,
				skip_merge: false,
				description: None,
				progress_group: None,
			};
			&OPTS
		}

		fn digest(&self) -> Digest {
			self.digest
		}

		async fn cache_map(&self, _ctx: &CancelToken, _input_keys: &[CacheKey]) -> Result<CacheMap, SchedulerError> {
			Ok(CacheMap {
				static_digest: Digest::of("failing-vertex"),
				deps: vec![],
			})
		}

		async fn exec(&self, _ctx: &CancelToken, _inputs: Vec<ResultRef>) -> Result<Vec<ResultRef>, SchedulerError> {
			Err(SchedulerError::Internal("boom".into()))
		}
	}

	#[derive(Debug)]
	struct ParentVertex {
		digest: Digest,
		inputs: Vec<InputSpec>,
	}

	#[async_trait]
	impl Vertex for ParentVertex {
		fn inputs(&self) -> &[InputSpec] {
			&self.inputs
		}

		fn options(&self) -> &VertexOptions {
			static OPTS: VertexOptions = VertexOptions {
				ignore_cache: false,
				skip_merge: false,
				description: None,
				progress_group: None,
			};
			&OPTS
		}

		fn digest(&self) -> Digest {
			self.digest
		}

		async fn cache_map(&self, _ctx: &CancelToken, _input_keys: &[CacheKey]) -> Result<CacheMap, SchedulerError> {
			Ok(CacheMap {
				static_digest: Digest::of("parent-vertex"),
				deps: vec![DepCacheInfo {
					selector: None,
					needs_slow: false,
				}],
			})
		}

		async fn exec(&self, _ctx: &CancelToken, _inputs: Vec<ResultRef>) -> Result<Vec<ResultRef>, SchedulerError> {
			panic!("parent must not execute once its dependency has failed");
		}
	}

	/// Stands in for the dispatcher's graph index: owns the single dependency
	/// edge a [`ParentVertex`] refers to and ticks it forward whenever the
	/// test drives the parent edge's own `unpark`.
	struct BridgingResolver {
		dep_edge: Edge,
		dep_incoming: Vec<IncomingPipe>,
	}

	impl DependencyResolver for BridgingResolver {
		fn open(&mut self, _dep_vertex: &Arc<dyn Vertex>, _dep_output: usize, desired: DesiredState) -> IncomingPipe {
			let pipe = Pipe::new(EdgeRequest { desired });
			self.dep_incoming.push(pipe.clone());
			pipe
		}
	}

	#[tokio::test]
	async fn dependency_failure_propagates_without_running_exec() {
		let dep_vertex: Arc<dyn Vertex> = Arc::new(FailingVertex { digest: Digest::of("dep") });
		let parent_vertex: Arc<dyn Vertex> = Arc::new(ParentVertex {
			digest: Digest::of("parent"),
			inputs: vec![InputSpec {
				vertex: dep_vertex.clone(),
				output: 0,
				optional: false,
			}],
		});

		let dep_edge = Edge::new(dep_vertex, 0, Arc::new(MockCache { hit: false, match_hit: false }), Arc::new(|| {}));
		let mut resolver = BridgingResolver {
			dep_edge,
			dep_incoming: Vec::new(),
		};

		let mut edge = Edge::new(parent_vertex, 0, Arc::new(MockCache { hit: false, match_hit: false }), Arc::new(|| {}));
		let incoming = Pipe::new(EdgeRequest {
			desired: DesiredState::Result,
		});

		let mut done = false;
		for _ in 0..500 {
			edge.unpark(std::slice::from_ref(&incoming), &mut resolver);
			resolver.dep_edge.unpark(&resolver.dep_incoming, &mut NoopResolver);
			if edge.is_done() {
				done = true;
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(1)).await;
		}

		assert!(done, "parent edge did not reach Complete in time");
		match edge.outcome().expect("edge is done") {
			Err(err) => assert!(matches!(&*err, SchedulerError::Dependency { .. })),
			Ok(_) => panic!("parent must fail when its dependency fails"),
		}
	}

	/// A vertex with two declared inputs, the second marked optional
	/// (`spec.md` §8 scenario 5).
	#[derive(Debug)]
	struct TwoInputVertex {
		digest: Digest,
		inputs: Vec<InputSpec>,
	}

	#[async_trait]
	impl Vertex for TwoInputVertex {
		fn inputs(&self) -> &[InputSpec] {
			&self.inputs
		}

		fn options(&self) -> &VertexOptions {
			static OPTS: VertexOptions = VertexOptions {
				ignore_cache: false,
				skip_merge: false,
				description: None,
				progress_group: None,
			};
			&OPTS
		}

		fn digest(&self) -> Digest {
			self.digest
		}

		async fn cache_map(&self, _ctx: &CancelToken, input_keys: &[CacheKey]) -> Result<CacheMap, SchedulerError> {
			Ok(CacheMap {
				static_digest: Digest::of("two-input-vertex"),
				deps: input_keys
					.iter()
					.map(|_| DepCacheInfo {
						selector: None,
						needs_slow: false,
					})
					.collect(),
			})
		}

		async fn exec(&self, _ctx: &CancelToken, inputs: Vec<ResultRef>) -> Result<Vec<ResultRef>, SchedulerError> {
			Ok(vec![Arc::new(MockResult {
				id: format!("two-input-result:{}", inputs.len()),
				released: AtomicBool::new(false),
			})])
		}
	}

	/// Stands in for the graph index across more than one dependency: opens
	/// each dependency's edge by vertex digest and ticks all of them forward
	/// alongside the edge under test.
	struct FanOutResolver {
		edges: std::collections::HashMap<Digest, Edge>,
		incoming: std::collections::HashMap<Digest, Vec<IncomingPipe>>,
	}

	impl DependencyResolver for FanOutResolver {
		fn open(&mut self, dep_vertex: &Arc<dyn Vertex>, _dep_output: usize, desired: DesiredState) -> IncomingPipe {
			let pipe = Pipe::new(EdgeRequest { desired });
			self.incoming.entry(dep_vertex.digest()).or_default().push(pipe.clone());
			pipe
		}
	}

	impl FanOutResolver {
		fn tick_all(&mut self) {
			for (digest, edge) in self.edges.iter_mut() {
				let incoming = self.incoming.entry(*digest).or_default().clone();
				edge.unpark(&incoming, &mut NoopResolver);
			}
		}
	}

	#[tokio::test]
	async fn optional_dependency_failure_substitutes_a_sentinel_and_still_runs() {
		let required: Arc<dyn Vertex> = Arc::new(MockVertex {
			digest: Digest::of("required-input"),
			exec_calls: AtomicUsize::new(0),
		});
		let optional: Arc<dyn Vertex> = Arc::new(FailingVertex {
			digest: Digest::of("optional-input"),
		});
		let parent: Arc<dyn Vertex> = Arc::new(TwoInputVertex {
			digest: Digest::of("two-input-parent"),
			inputs: vec![
				InputSpec {
					vertex: required.clone(),
					output: 0,
					optional: false,
				},
				InputSpec {
					vertex: optional.clone(),
					output: 0,
					optional: true,
				},
			],
		});

		let mut edges = std::collections::HashMap::new();
		edges.insert(required.digest(), Edge::new(required.clone(), 0, Arc::new(MockCache { hit: false, match_hit: false }), Arc::new(|| {})));
		edges.insert(optional.digest(), Edge::new(optional.clone(), 0, Arc::new(MockCache { hit: false, match_hit: false }), Arc::new(|| {})));
		let mut resolver = FanOutResolver {
			edges,
			incoming: std::collections::HashMap::new(),
		};

		let mut edge = Edge::new(parent, 0, Arc::new(MockCache { hit: false, match_hit: false }), Arc::new(|| {}));
		let incoming = Pipe::new(EdgeRequest {
			desired: DesiredState::Result,
		});

		let mut done = false;
		for _ in 0..500 {
			edge.unpark(std::slice::from_ref(&incoming), &mut resolver);
			resolver.tick_all();
			if edge.is_done() {
				done = true;
				break;
			}
			tokio::time::sleep(std::time::Duration::from_millis(1)).await;
		}

		assert!(done, "parent edge did not reach Complete in time");
		let outcome = edge.outcome().expect("edge is done");
		assert!(outcome.is_ok(), "a failed optional input must not fail the edge");
		assert!(
			edge.own_keys().iter().any(|k| k.kind == CacheKeyKind::Fast),
			"the edge must still publish a cache key reflecting the sentinel"
		);
	}
}
