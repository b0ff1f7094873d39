//! Convenient graph manipulation.
//!
//! We roll our own instead of using `petgraph` because the instruction graph a
//! driver submits may have parallel edges (the same vertex feeding two distinct
//! input ports of the same consumer).

use std::fmt::Debug;

/// The index of a node in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphNodeIdx(usize);

impl From<GraphNodeIdx> for usize {
	fn from(value: GraphNodeIdx) -> Self {
		value.0
	}
}

impl GraphNodeIdx {
	/// Get this index as a `usize`.
	pub fn as_usize(&self) -> usize {
		self.0
	}
}

/// The index of an edge in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphEdgeIdx(usize);

impl From<GraphEdgeIdx> for usize {
	fn from(value: GraphEdgeIdx) -> Self {
		value.0
	}
}

impl GraphEdgeIdx {
	/// Get this index as a `usize`.
	pub fn as_usize(&self) -> usize {
		self.0
	}
}

/// A directed graph with parallel edges.
///
/// [`Graph`]s are built once (a driver loading a submitted definition) and
/// [`finalize`](Self::finalize)d into a [`FinalizedGraph`] before being read.
#[derive(Debug, Clone)]
pub struct Graph<NodeType, EdgeType>
where
	NodeType: Debug,
	EdgeType: Debug,
{
	nodes: Vec<NodeType>,
	edges: Vec<(GraphNodeIdx, GraphNodeIdx, EdgeType)>,
}

impl<NodeType, EdgeType> Default for Graph<NodeType, EdgeType>
where
	NodeType: Debug,
	EdgeType: Debug,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<NodeType, EdgeType> Graph<NodeType, EdgeType>
where
	NodeType: Debug,
	EdgeType: Debug,
{
	/// Create an empty graph.
	pub fn new() -> Self {
		Self {
			nodes: Vec::new(),
			edges: Vec::new(),
		}
	}

	/// Convert this graph to an immutable structure with fast reads.
	pub fn finalize(self) -> FinalizedGraph<NodeType, EdgeType> {
		let mut edge_map_in = (0..self.nodes.len()).map(|_| Vec::new()).collect::<Vec<_>>();
		let mut edge_map_out = (0..self.nodes.len()).map(|_| Vec::new()).collect::<Vec<_>>();
		for (i, edge) in self.edges.iter().enumerate() {
			edge_map_out[usize::from(edge.0)].push(GraphEdgeIdx(i));
			edge_map_in[usize::from(edge.1)].push(GraphEdgeIdx(i));
		}

		FinalizedGraph {
			graph: self,
			edge_map_in,
			edge_map_out,
		}
	}

	/// Add a node to this graph.
	#[inline]
	pub fn add_node(&mut self, node: NodeType) -> GraphNodeIdx {
		let i = self.nodes.len();
		self.nodes.push(node);
		GraphNodeIdx(i)
	}

	/// Add a directed edge `from -> to` to this graph.
	#[inline]
	pub fn add_edge(&mut self, from: GraphNodeIdx, to: GraphNodeIdx, edge_value: EdgeType) -> GraphEdgeIdx {
		let i = self.edges.len();
		self.edges.push((from, to, edge_value));
		GraphEdgeIdx(i)
	}

	/// The number of nodes in this graph.
	#[inline]
	pub fn len_nodes(&self) -> usize {
		self.nodes.len()
	}
}

/// An immutable directed graph with fast `edges_starting_at` / `edges_ending_at`
/// lookups.
///
/// This does not, on its own, guarantee acyclicity: the scheduler's own ancestry
/// check (see `scheduler-core::graph_index::is_ancestor`) is what refuses to
/// create a cycle, by walking this structure before a merge is allowed to commit.
pub struct FinalizedGraph<NodeType, EdgeType>
where
	NodeType: Debug,
	EdgeType: Debug,
{
	graph: Graph<NodeType, EdgeType>,
	edge_map_out: Vec<Vec<GraphEdgeIdx>>,
	edge_map_in: Vec<Vec<GraphEdgeIdx>>,
}

impl<NodeType, EdgeType> Debug for FinalizedGraph<NodeType, EdgeType>
where
	NodeType: Debug,
	EdgeType: Debug,
{
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FinalizedGraph")
			.field("nodes", &self.graph.nodes)
			.field("edges", &self.graph.edges)
			.finish()
	}
}

impl<NodeType, EdgeType> FinalizedGraph<NodeType, EdgeType>
where
	NodeType: Debug,
	EdgeType: Debug,
{
	/// Get a node by index.
	#[inline]
	pub fn get_node(&self, node_idx: GraphNodeIdx) -> &NodeType {
		self.graph.nodes.get(usize::from(node_idx)).unwrap()
	}

	/// The number of nodes in this graph.
	#[inline]
	pub fn len_nodes(&self) -> usize {
		self.graph.nodes.len()
	}

	/// Iterate over all nodes, with their index.
	#[inline]
	pub fn iter_nodes_idx(&self) -> impl Iterator<Item = (GraphNodeIdx, &NodeType)> {
		self.graph.nodes.iter().enumerate().map(|(i, n)| (GraphNodeIdx(i), n))
	}

	/// Get an edge by index: `(from, to, value)`.
	#[inline]
	pub fn get_edge(&self, edge_idx: GraphEdgeIdx) -> &(GraphNodeIdx, GraphNodeIdx, EdgeType) {
		self.graph.edges.get(usize::from(edge_idx)).unwrap()
	}

	/// Get all edges starting at the given node.
	pub fn edges_starting_at(&self, node: GraphNodeIdx) -> &[GraphEdgeIdx] {
		self.edge_map_out.get(usize::from(node)).unwrap()
	}

	/// Get all edges ending at the given node.
	pub fn edges_ending_at(&self, node: GraphNodeIdx) -> &[GraphEdgeIdx] {
		self.edge_map_in.get(usize::from(node)).unwrap()
	}
}
