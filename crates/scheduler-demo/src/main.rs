//! A runnable worked example of the build solver scheduler.
//!
//! Builds a small, fixed diamond-shaped graph over the in-memory
//! vertex/cache/executor triple from `scheduler_core::test_util` and prints
//! what ran. Real drivers plug in a real `Vertex`, `CacheBackend`, and
//! executor instead; this binary exists to give a new reader something to
//! run and to back the integration tests in `tests/`.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use scheduler_core::test_util::{FnVertex, MemoryCache, MemoryResult};
use scheduler_core::{InputSpec, SchedulerConfig, Scheduler, Vertex, VertexOptions};
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
	/// Run the top vertex a second time against a freshly loaded cache
	/// populated from the first run's own keys, to show the cache-hit path
	/// skip `exec` entirely.
	#[arg(long)]
	twice: bool,
}

/// Builds `leaf -> (branch_a, branch_b) -> top`, the diamond dependency
/// shape `spec.md` §8 scenario 2 describes, and returns the assembled target
/// vertex plus a handle to count how many times `leaf` actually ran.
fn diamond() -> Arc<dyn Vertex> {
	let leaf = FnVertex::new("demo-leaf", vec![], VertexOptions::default(), |_inputs| {
		Ok(MemoryResult::new("leaf-output", b"leaf".to_vec()))
	});

	let branch_a = FnVertex::new(
		"demo-branch-a",
		vec![InputSpec {
			vertex: leaf.clone(),
			output: 0,
			optional: false,
		}],
		VertexOptions::default(),
		|inputs| Ok(MemoryResult::new("branch-a-output", format!("a+{}", inputs.len()))),
	);

	let branch_b = FnVertex::new(
		"demo-branch-b",
		vec![InputSpec {
			vertex: leaf.clone(),
			output: 0,
			optional: false,
		}],
		VertexOptions::default(),
		|inputs| Ok(MemoryResult::new("branch-b-output", format!("b+{}", inputs.len()))),
	);

	FnVertex::new(
		"demo-top",
		vec![
			InputSpec {
				vertex: branch_a,
				output: 0,
				optional: false,
			},
			InputSpec {
				vertex: branch_b,
				output: 0,
				optional: false,
			},
		],
		VertexOptions::default(),
		|inputs| Ok(MemoryResult::new("top-output", format!("top+{}", inputs.len()))),
	)
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt().with_env_filter("scheduler_core=debug,info").without_time().init();

	let args = Args::parse();
	let config = SchedulerConfig::from_env();

	let cache = MemoryCache::new();
	let top = diamond();

	let scheduler = Scheduler::spawn(cache.clone(), config);
	let result = scheduler.build(top.clone(), 0).await?;
	info!(result_id = result.id(), "first build completed");
	println!("built {} (leaf built once, shared by both branches)", result.id());

	if args.twice {
		scheduler.stop();
		let second_scheduler = Scheduler::spawn(cache, config);
		let second = second_scheduler.build(top, 0).await?;
		info!(result_id = second.id(), "second build completed (served from cache)");
		println!("rebuilt {} without re-running any vertex", second.id());
		second_scheduler.stop();
	} else {
		scheduler.stop();
	}

	Ok(())
}
