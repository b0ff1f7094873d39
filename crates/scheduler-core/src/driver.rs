//! The Job/Build driver (`spec.md` §4.5).
//!
//! Thin glue between an external request — a definition plus the one target
//! within it the caller wants resolved — and the scheduler's single `build`
//! entry point. Validates that the target actually belongs to the submitted
//! definition (a driver bug otherwise, `spec.md` §7's `Validation` kind) and
//! otherwise gets out of the way: interning the rest of the definition's
//! vertices into canonical edges happens naturally as `Scheduler::build`
//! walks declared inputs, so there is nothing else for the driver to do here.

use std::sync::Arc;

use scheduler_util::Digest;
use tracing::info;

use crate::dispatcher::Scheduler;
use crate::errors::SchedulerError;
use crate::result::ResultRef;
use crate::vertex::Vertex;

/// The full set of vertices a build request operates over.
#[derive(Clone)]
pub struct Definition {
	pub vertices: Vec<Arc<dyn Vertex>>,
}

impl Definition {
	pub fn new(vertices: Vec<Arc<dyn Vertex>>) -> Self {
		Self { vertices }
	}

	fn find(&self, digest: Digest) -> Option<&Arc<dyn Vertex>> {
		self.vertices.iter().find(|v| v.digest() == digest)
	}
}

/// Which vertex output a build request resolves to.
#[derive(Debug, Clone, Copy)]
pub struct TargetRef {
	pub digest: Digest,
	pub output: usize,
}

/// An external build request: a definition plus its target.
pub struct BuildRequest {
	pub definition: Definition,
	pub target: TargetRef,
}

/// Validate `request` and build its target. Progress is surfaced through
/// `tracing` (`spec.md` §4.5, "Surfaces progress via the observability
/// collaborator") rather than a bespoke callback type, matching the ambient
/// logging stack the rest of this crate uses.
pub async fn run(scheduler: &Arc<Scheduler>, request: BuildRequest) -> Result<ResultRef, SchedulerError> {
	let target_vertex = request.definition.find(request.target.digest).cloned().ok_or(SchedulerError::Validation {
		digest: request.target.digest,
		output: request.target.output,
	})?;

	info!(digest = ?request.target.digest, output = request.target.output, "build requested");
	let result = scheduler.build(target_vertex, request.target.output).await;
	match &result {
		Ok(r) => info!(result_id = r.id(), "build completed"),
		Err(err) => info!(%err, "build failed"),
	}
	result
}

/// Like [`run`], but cancellable: `cancel` is raced against completion the
/// same way [`Scheduler::build_cancellable`] does.
pub async fn run_cancellable(
	scheduler: &Arc<Scheduler>,
	request: BuildRequest,
	cancel: impl std::future::Future<Output = ()> + Send,
) -> Result<ResultRef, SchedulerError> {
	let target_vertex = request.definition.find(request.target.digest).cloned().ok_or(SchedulerError::Validation {
		digest: request.target.digest,
		output: request.target.output,
	})?;

	info!(digest = ?request.target.digest, output = request.target.output, "build requested");
	let result = scheduler.build_cancellable(target_vertex, request.target.output, cancel).await;
	match &result {
		Ok(r) => info!(result_id = r.id(), "build completed"),
		Err(err) => info!(%err, "build failed"),
	}
	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipe::CancelToken;
	use crate::cache::{CacheBackend, CacheKey, CacheMap, CacheRecord};
	use crate::config::SchedulerConfig;
	use crate::vertex::{InputSpec, VertexOptions};
	use async_trait::async_trait;

	#[derive(Debug)]
	struct StubVertex {
		digest: Digest,
	}

	#[async_trait]
	impl Vertex for StubVertex {
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
				static_digest: Digest::of("stub"),
				deps: vec![],
			})
		}
		async fn exec(&self, _ctx: &CancelToken, _inputs: Vec<ResultRef>) -> Result<Vec<ResultRef>, SchedulerError> {
			use crate::result::ResultHandle;
			#[derive(Debug)]
			struct R;
			impl ResultHandle for R {
				fn id(&self) -> &str {
					"stub-result"
				}
				fn cache_keys(&self) -> Vec<CacheKey> {
					vec![]
				}
				fn clone_cached(&self) -> ResultRef {
					Arc::new(R)
				}
				fn release(&self) {}
			}
			Ok(vec![Arc::new(R)])
		}
	}

	struct EmptyCache;

	#[async_trait]
	impl CacheBackend for EmptyCache {
		async fn query(&self, _key: &CacheKey) -> Result<Vec<CacheRecord>, SchedulerError> {
			Ok(vec![])
		}
		async fn load(&self, _record: &CacheRecord, _output: usize) -> Result<ResultRef, SchedulerError> {
			unimplemented!()
		}
		async fn records(&self, _key: &CacheKey) -> Result<Vec<CacheRecord>, SchedulerError> {
			Ok(vec![])
		}
		async fn store(&self, key: &CacheKey, result: &ResultRef) -> Result<CacheRecord, SchedulerError> {
			Ok(CacheRecord {
				key: key.clone(),
				result_id: result.id().to_string(),
			})
		}
	}

	#[tokio::test]
	async fn unknown_target_is_a_validation_error() {
		let scheduler = Scheduler::spawn(Arc::new(EmptyCache), SchedulerConfig::default());
		let request = BuildRequest {
			definition: Definition::new(vec![Arc::new(StubVertex { digest: Digest::of("known") })]),
			target: TargetRef {
				digest: Digest::of("unknown"),
				output: 0,
			},
		};

		let result = run(&scheduler, request).await;
		assert!(matches!(result, Err(SchedulerError::Validation { .. })));
		scheduler.stop();
	}

	#[tokio::test]
	async fn known_target_builds() {
		let vertex: Arc<dyn Vertex> = Arc::new(StubVertex { digest: Digest::of("known") });
		let scheduler = Scheduler::spawn(Arc::new(EmptyCache), SchedulerConfig::default());
		let request = BuildRequest {
			definition: Definition::new(vec![vertex.clone()]),
			target: TargetRef {
				digest: vertex.digest(),
				output: 0,
			},
		};

		let result = run(&scheduler, request).await.expect("known target builds");
		assert_eq!(result.id(), "stub-result");
		scheduler.stop();
	}
}
