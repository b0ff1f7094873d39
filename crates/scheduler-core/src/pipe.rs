//! The pipe abstraction (`spec.md` §4.1).
//!
//! A [`Pipe`] is a channel between exactly two endpoints: the producer (the
//! dispatcher side of the edge that owns this pipe, or an async worker) and
//! the consumer (a dependent edge, or an external waiter). Status transitions
//! are strictly monotonic (`Initial -> Running -> {Completed, Cancelled}`),
//! but the *value* attached to a `Running` pipe may be overwritten any number
//! of times before the pipe completes — an input-request pipe to a dependency
//! edge carries that dependency's evolving `(state, keys, result)` snapshot
//! as it progresses through its own state machine, not just a single final
//! answer. Both callbacks fire outside the pipe's internal lock, so a worker
//! or the dispatcher can call `update`/`complete`/`cancel`/`receive` from
//! wherever they run without a callback reentering the lock it was called
//! under.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::SchedulerError;

/// A cooperative cancellation flag shared between a pipe and the worker it
/// was handed to. Cheap to clone; every clone observes the same flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

/// The lifecycle state of a [`Pipe`]. Transitions are strictly monotonic:
/// `Initial -> Running -> {Completed, Cancelled}`, or `Initial -> Cancelled`
/// directly if nothing ever started running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
	Initial,
	Running,
	Completed,
	Cancelled,
}

/// A snapshot of a pipe's status, as returned by [`Pipe::status`].
#[derive(Debug, Clone)]
pub struct PipeStatus<T> {
	pub state: PipeState,
	pub value: Option<T>,
	pub error: Option<Arc<SchedulerError>>,
}

struct PipeInner<T> {
	state: PipeState,
	value: Option<T>,
	error: Option<Arc<SchedulerError>>,
	/// Whether `receive()` has already observed the current `(state, value)`.
	seen: bool,
	on_send_completion: Option<Box<dyn FnMut() + Send>>,
	on_receive_completion: Option<Box<dyn FnMut() + Send>>,
}

/// A channel carrying a request payload set once at construction and a
/// status that advances monotonically to `Completed` or `Cancelled`, with an
/// evolving value along the way.
///
/// `Req` is whatever the consumer's interest looks like (an
/// [`crate::edge::EdgeRequest`] for input-request pipes, `()` for
/// function-backed pipes that carry no request payload beyond "start").
pub struct Pipe<Req, T> {
	pub request: Req,
	cancel_flag: CancelToken,
	inner: Mutex<PipeInner<T>>,
}

impl<Req, T: Clone + Send + 'static> Pipe<Req, T> {
	/// Construct a new pipe. Register callbacks with
	/// [`on_send_completion`](Self::on_send_completion) /
	/// [`on_receive_completion`](Self::on_receive_completion) before handing
	/// this pipe to a worker or consumer — callers always do so from within
	/// the dispatcher, before the pipe becomes reachable from another thread.
	pub fn new(request: Req) -> Arc<Self> {
		Arc::new(Self {
			request,
			cancel_flag: CancelToken::default(),
			inner: Mutex::new(PipeInner {
				state: PipeState::Initial,
				value: None,
				error: None,
				seen: true,
				on_send_completion: None,
				on_receive_completion: None,
			}),
		})
	}

	/// The cancellation flag a function-backed worker should poll. Cancelling
	/// this pipe cancels the token; cancelling the token does not, on its
	/// own, cancel the pipe.
	pub fn cancel_token(&self) -> CancelToken {
		self.cancel_flag.clone()
	}

	pub fn on_send_completion(&self, cb: impl FnMut() + Send + 'static) {
		self.inner.lock().unwrap().on_send_completion = Some(Box::new(cb));
	}

	pub fn on_receive_completion(&self, cb: impl FnMut() + Send + 'static) {
		self.inner.lock().unwrap().on_receive_completion = Some(Box::new(cb));
	}

	/// Publish a new, non-terminal value. Transitions `Initial -> Running` if
	/// this is the first update. No-op once `Completed` or `Cancelled`. Fires
	/// `OnSendCompletion` outside the lock, then re-registers it so a later
	/// update or the final `send` fires it again.
	pub fn update(&self, value: T) {
		let cb = {
			let mut inner = self.inner.lock().unwrap();
			if matches!(inner.state, PipeState::Completed | PipeState::Cancelled) {
				return;
			}
			inner.state = PipeState::Running;
			inner.value = Some(value);
			inner.seen = false;
			inner.on_send_completion.take()
		};
		if let Some(mut cb) = cb {
			cb();
			let mut inner = self.inner.lock().unwrap();
			if !matches!(inner.state, PipeState::Completed | PipeState::Cancelled) {
				inner.on_send_completion.get_or_insert(cb);
			}
		}
	}

	/// Complete this pipe with a final value or an error. No-op if already
	/// `Completed` or `Cancelled`. Fires `OnSendCompletion` outside the lock.
	pub fn send(&self, result: Result<T, SchedulerError>) {
		let cb = {
			let mut inner = self.inner.lock().unwrap();
			if matches!(inner.state, PipeState::Completed | PipeState::Cancelled) {
				return;
			}
			inner.state = PipeState::Completed;
			inner.seen = false;
			match result {
				Ok(v) => inner.value = Some(v),
				Err(e) => inner.error = Some(Arc::new(e)),
			}
			inner.on_send_completion.take()
		};
		if let Some(mut cb) = cb {
			cb();
		}
	}

	/// Consume the current status update. Returns `true` if this call
	/// observed a status that had not yet been observed. Fires
	/// `OnReceiveCompletion` outside the lock, exactly when it returns
	/// `true`.
	pub fn receive(&self) -> bool {
		let advanced = {
			let mut inner = self.inner.lock().unwrap();
			if inner.seen {
				false
			} else {
				inner.seen = true;
				true
			}
		};
		if advanced {
			let cb = {
				let mut inner = self.inner.lock().unwrap();
				inner.on_receive_completion.take()
			};
			if let Some(mut cb) = cb {
				cb();
				// Re-register: OnReceiveCompletion may fire more than once
				// over a pipe's life (once per interim update), so put the
				// callback back unless the pipe is already done.
				let mut inner = self.inner.lock().unwrap();
				if !matches!(inner.state, PipeState::Completed | PipeState::Cancelled) {
					inner.on_receive_completion.get_or_insert(cb);
				}
			}
		}
		advanced
	}

	/// Cancel this pipe. Idempotent: a no-op once `Completed` or already
	/// `Cancelled`. Fires both completion callbacks once.
	pub fn cancel(&self) {
		let (mut send_cb, mut recv_cb) = {
			let mut inner = self.inner.lock().unwrap();
			if matches!(inner.state, PipeState::Completed | PipeState::Cancelled) {
				return;
			}
			inner.state = PipeState::Cancelled;
			inner.seen = false;
			self.cancel_flag.cancel();
			(inner.on_send_completion.take(), inner.on_receive_completion.take())
		};
		if let Some(cb) = send_cb.as_mut() {
			cb();
		}
		if let Some(cb) = recv_cb.as_mut() {
			cb();
		}
	}

	/// A snapshot of this pipe's current status.
	pub fn status(&self) -> PipeStatus<T> {
		let inner = self.inner.lock().unwrap();
		PipeStatus {
			state: inner.state,
			value: inner.value.clone(),
			error: inner.error.clone(),
		}
	}

	pub fn is_done(&self) -> bool {
		matches!(self.inner.lock().unwrap().state, PipeState::Completed | PipeState::Cancelled)
	}
}

/// Type-erased view of a [`Pipe`], used by the dispatcher (and by an edge's
/// own bookkeeping) to poll and cancel a heterogeneous collection of outgoing
/// pipes without caring what each one's `T` is.
pub trait AnyPipe: Send + Sync {
	fn receive(&self) -> bool;
	fn is_done(&self) -> bool;
	fn cancel(&self);
}

impl<Req: Send + Sync, T: Clone + Send + 'static> AnyPipe for Pipe<Req, T> {
	fn receive(&self) -> bool {
		Pipe::receive(self)
	}

	fn is_done(&self) -> bool {
		Pipe::is_done(self)
	}

	fn cancel(&self) {
		Pipe::cancel(self)
	}
}

/// Spawn an async worker bound to a fresh function-backed pipe: `work` runs
/// on a tokio task and its result completes the pipe. Cancelling the
/// returned pipe cancels the [`CancelToken`] handed to `work`.
///
/// No completion callback is registered — use
/// [`spawn_function_pipe_signaled`] when the dispatcher needs to be woken up
/// when `work` finishes.
pub fn spawn_function_pipe<T, F, Fut>(work: F) -> Arc<Pipe<(), T>>
where
	T: Clone + Send + 'static,
	F: FnOnce(CancelToken) -> Fut + Send + 'static,
	Fut: Future<Output = Result<T, SchedulerError>> + Send + 'static,
{
	spawn_function_pipe_signaled(work, || {})
}

/// Like [`spawn_function_pipe`], but registers `on_complete` as the pipe's
/// `OnSendCompletion` callback *before* spawning the worker task. Registering
/// it on the `Arc` returned by `spawn_function_pipe` instead would race the
/// worker: on a multi-threaded runtime the task can finish and call `send`
/// before the caller gets a chance to register anything, permanently losing
/// the wakeup (callbacks are not re-registered past a terminal state).
pub fn spawn_function_pipe_signaled<T, F, Fut>(work: F, on_complete: impl FnMut() + Send + 'static) -> Arc<Pipe<(), T>>
where
	T: Clone + Send + 'static,
	F: FnOnce(CancelToken) -> Fut + Send + 'static,
	Fut: Future<Output = Result<T, SchedulerError>> + Send + 'static,
{
	let pipe = Pipe::new(());
	pipe.on_send_completion(on_complete);
	let token = pipe.cancel_token();
	let worker_pipe = pipe.clone();
	tokio::spawn(async move {
		let result = work(token).await;
		worker_pipe.send(result);
	});
	pipe
}
