//! The graph index / `EdgeFactory` (`spec.md` §4.2).
//!
//! Every edge the scheduler ever touches is owned here, keyed by the
//! `(vertex digest, output index)` pair that `spec.md`'s uniqueness invariant
//! is stated over. The index is touched only from the dispatcher's single
//! task (`spec.md` §5's single-writer model), so unlike the source material's
//! "naturally lock-free or sharded map" framing, a plain `HashMap` is
//! sufficient here — there is only ever one writer, full stop.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use scheduler_util::Digest;

use crate::cache::{CacheBackend, CacheKey};
use crate::edge::Edge;
use crate::vertex::Vertex;

/// The identity of a live edge: a vertex's content digest plus the output it
/// selects. `spec.md` §3's uniqueness invariant is stated over this pair.
pub type EdgeId = (Digest, usize);

/// Owns every live [`Edge`] and the cache-key claims edges have registered.
pub struct GraphIndex {
	cache: Arc<dyn CacheBackend>,
	/// `spec.md` §4.4: "All pipe-completion callbacks wake the dispatcher by
	/// calling signal(target-or-source)." Handed to every edge this index
	/// creates so its worker pipes can wake the dispatch loop on completion.
	signal: Arc<dyn Fn(EdgeId) + Send + Sync>,
	edges: HashMap<EdgeId, Edge>,
	/// Compare-and-set cache-key claims (`spec.md` §4.2, "LoadOrStore"):
	/// whichever edge claims a digest first owns it until a merge reassigns
	/// it via [`GraphIndex::set_edge`].
	key_claims: HashMap<Digest, EdgeId>,
	/// Redirects for edges absorbed by a merge (`spec.md` §8, "Merge
	/// correctness"): once `old` is merged into `new`, any later `get_edge`
	/// call for `old`'s `(vertex, output)` pair must still resolve to `new`,
	/// never fabricate a fresh, disconnected edge.
	aliases: HashMap<EdgeId, EdgeId>,
	/// Runtime ownership (`spec.md` §4.3, "created to serve an input of"):
	/// recorded by [`GraphIndex::record_owner`] whenever a consumer edge
	/// opens `candidate` as one of its own dependency pipes. Keyed by the
	/// owned edge, since one edge can gain several owners over its life.
	/// Deliberately independent of the *static* vertex DAG `is_ancestor`
	/// walks: this reflects the actual resolved edge graph after merges have
	/// redirected dependencies through [`GraphIndex::aliases`], so it can
	/// disagree with `is_ancestor` instead of being a subset of it.
	owners: HashMap<EdgeId, HashSet<EdgeId>>,
}

impl GraphIndex {
	pub fn new(cache: Arc<dyn CacheBackend>, signal: Arc<dyn Fn(EdgeId) + Send + Sync>) -> Self {
		Self {
			cache,
			signal,
			edges: HashMap::new(),
			key_claims: HashMap::new(),
			aliases: HashMap::new(),
			owners: HashMap::new(),
		}
	}

	/// Replace the signal callback every edge created from now on is wired
	/// with. Used once, at construction time, to break the cycle between
	/// `GraphIndex` (built before the dispatcher's `Arc<DispatcherState>`
	/// exists) and a signal closure that needs to capture that same `Arc`.
	pub fn set_signal(&mut self, signal: Arc<dyn Fn(EdgeId) + Send + Sync>) {
		self.signal = signal;
	}

	/// `getEdge`: return the existing edge for `(vertex, output)`, creating
	/// and registering one if this is the first reference. Chases
	/// [`GraphIndex::aliases`] first, so a vertex absorbed by an earlier merge
	/// resolves to its surviving edge instead of fabricating a new one.
	pub fn get_edge(&mut self, vertex: &Arc<dyn Vertex>, output: usize) -> EdgeId {
		let id = self.resolve_alias((vertex.digest(), output));
		let cache = self.cache.clone();
		let signal = self.signal.clone();
		self.edges.entry(id).or_insert_with(|| {
			let edge_signal: Arc<dyn Fn() + Send + Sync> = Arc::new(move || signal(id));
			Edge::new(vertex.clone(), output, cache, edge_signal)
		});
		id
	}

	/// Follow the alias chain for `id` to whichever edge it currently
	/// resolves to. [`GraphIndex::set_edge`] keeps this chain flat (at most
	/// one hop) by redirecting existing aliases at merge time, but the loop
	/// guards against that invariant ever slipping.
	fn resolve_alias(&self, mut id: EdgeId) -> EdgeId {
		let mut seen = HashSet::new();
		while let Some(&next) = self.aliases.get(&id) {
			if !seen.insert(id) {
				break;
			}
			id = next;
		}
		id
	}

	pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
		self.edges.get(id)
	}

	pub fn edge_mut(&mut self, id: &EdgeId) -> Option<&mut Edge> {
		self.edges.get_mut(id)
	}

	pub fn contains(&self, id: &EdgeId) -> bool {
		self.edges.contains_key(id)
	}

	/// Remove `id`'s edge from the index so the dispatcher can drive it
	/// without holding a borrow of the index itself — its
	/// [`crate::edge::DependencyResolver`] needs `&mut GraphIndex` at the same
	/// time `unpark` needs `&mut Edge`. Pair with [`GraphIndex::put_edge`].
	pub fn take_edge(&mut self, id: &EdgeId) -> Option<Edge> {
		self.edges.remove(id)
	}

	/// Reinsert an edge taken out via [`GraphIndex::take_edge`].
	pub fn put_edge(&mut self, id: EdgeId, edge: Edge) {
		self.edges.insert(id, edge);
	}

	/// `hasOwner(a, b)`: did `a` actually open `b` as one of its own
	/// dependency pipes at runtime? Backed by [`GraphIndex::owners`], which
	/// [`GraphIndex::record_owner`] populates as edges are driven — not by
	/// walking the static vertex DAG, so it stays independent of
	/// `is_ancestor`'s transitive closure even when a merge has since
	/// redirected `b`'s identity.
	pub fn has_owner(&self, owner: &EdgeId, candidate: &EdgeId) -> bool {
		self.owners.get(candidate).is_some_and(|owners| owners.contains(owner))
	}

	/// Record that `owner` opened `dep` as one of its dependency pipes
	/// (`spec.md` §4.3, "created to serve an input of"). Called from
	/// [`crate::dispatcher::ResolverCtx::open`] with the already
	/// alias-resolved dependency id, so ownership tracks the live edge graph
	/// rather than the vertices' original declared inputs.
	pub fn record_owner(&mut self, owner: EdgeId, dep: EdgeId) {
		if owner != dep {
			self.owners.entry(dep).or_default().insert(owner);
		}
	}

	/// Same reachability test, usable before a dependency's `Edge` exists yet
	/// (the ancestry check in `spec.md` §4.3's merge rule runs against a
	/// vertex, not necessarily a registered edge).
	pub fn is_ancestor(&self, ancestor_digest: Digest, vertex: &Arc<dyn Vertex>) -> bool {
		let mut seen = HashSet::new();
		Self::vertex_reaches(ancestor_digest, vertex, &mut seen)
	}

	fn vertex_reaches(target: Digest, vertex: &Arc<dyn Vertex>, seen: &mut HashSet<Digest>) -> bool {
		if vertex.digest() == target {
			return true;
		}
		if !seen.insert(vertex.digest()) {
			return false;
		}
		vertex.inputs().iter().any(|input| Self::vertex_reaches(target, &input.vertex, seen))
	}

	/// Attempt to claim `key` for `claimant`. Returns the edge that already
	/// holds the claim if one got there first; `None` means the claim
	/// succeeded.
	pub fn claim_key(&mut self, key: &CacheKey, claimant: EdgeId) -> Option<EdgeId> {
		match self.key_claims.entry(key.digest) {
			Entry::Occupied(existing) => {
				let holder = *existing.get();
				if holder == claimant {
					None
				} else {
					Some(holder)
				}
			}
			Entry::Vacant(slot) => {
				slot.insert(claimant);
				None
			}
		}
	}

	/// `setEdge(old, new)`: redirect the factory mapping from a merged-away
	/// edge to its surviving target, and drop the merged-away edge. Its
	/// resources were already folded into `new` by the caller
	/// (`spec.md` §4.3, "Edge merging") before this is called.
	///
	/// Also records `old -> new` in [`GraphIndex::aliases`] so a later
	/// `get_edge` for the absorbed vertex resolves to `new` instead of
	/// fabricating a disconnected edge (`spec.md` §8, "Merge correctness").
	/// Any alias that already pointed at `old` (from an earlier merge chain)
	/// is redirected to `new` too, keeping every chain a single hop.
	pub fn set_edge(&mut self, old: EdgeId, new: EdgeId) {
		self.edges.remove(&old);
		for claim in self.key_claims.values_mut() {
			if *claim == old {
				*claim = new;
			}
		}
		for target in self.aliases.values_mut() {
			if *target == old {
				*target = new;
			}
		}
		self.aliases.insert(old, new);

		if let Some(old_owners) = self.owners.remove(&old) {
			self.owners.entry(new).or_default().extend(old_owners);
		}
		for owners in self.owners.values_mut() {
			if owners.remove(&old) {
				owners.insert(new);
			}
		}
		if let Some(owners) = self.owners.get_mut(&new) {
			owners.remove(&new);
		}
	}
}
