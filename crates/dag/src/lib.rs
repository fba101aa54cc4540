// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::VecDeque;

use petgraph::{
    prelude::DiGraph,
    visit::{Dfs, Walker},
    Direction,
};

use self::subgraph::subgraph;

mod subgraph;

/// NodeIndex as employed in wikipack usage
pub type NodeIndex = petgraph::prelude::NodeIndex<u32>;

/// Directed graph wrapper providing the mechanisms the pack
/// resolution code needs: deduplicated nodes and edges, reachability
/// walks, and a cycle-reporting topological sort.
#[derive(Debug, Clone)]
pub struct Dag<N>(DiGraph<N, (), u32>);

impl<N> Default for Dag<N> {
    fn default() -> Self {
        Self(DiGraph::default())
    }
}

/// The nodes still participating in at least one cycle once all
/// acyclic nodes have been peeled off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle<N>(pub Vec<N>);

impl<N> Dag<N>
where
    N: Clone + PartialEq,
{
    /// Construct a new Dag
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds node N to the graph and returns the index.
    /// If N already exists, it'll return the index of that node.
    pub fn add_node_or_get_index(&mut self, node: N) -> NodeIndex {
        if let Some(index) = self.get_index(&node) {
            index
        } else {
            self.0.add_node(node)
        }
    }

    /// Returns true if the node exists
    pub fn node_exists(&self, node: &N) -> bool {
        self.get_index(node).is_some()
    }

    /// Add an edge from a to b, deduplicated. Cycles are not refused
    /// here; [`Self::toposort`] reports them.
    pub fn add_edge(&mut self, a: NodeIndex, b: NodeIndex) -> bool {
        if self.0.find_edge(a, b).is_some() {
            return false;
        }

        self.0.add_edge(a, b, ());

        true
    }

    pub fn node_count(&self) -> usize {
        self.0.node_count()
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &'_ N> {
        self.0.node_indices().map(|i| &self.0[i])
    }

    /// Perform a depth-first search, given the start index
    pub fn dfs(&self, start: NodeIndex) -> impl Iterator<Item = &'_ N> {
        let dfs = Dfs::new(&self.0, start);

        dfs.iter(&self.0).map(|i| &self.0[i])
    }

    /// Kahn's algorithm. Returns nodes in dependency-first order
    /// (edge a -> b puts b before a), or the members of the offending
    /// cycle(s).
    pub fn toposort(&self) -> Result<Vec<N>, Cycle<N>> {
        let (sorted, remaining) = self.peel();

        if remaining.is_empty() {
            return Ok(sorted);
        }

        // A node blocked behind a cycle survives the forward peel but
        // not the transposed one; the intersection is the cycle itself.
        let (_, reverse_remaining) = self.transpose().peel();

        Err(Cycle(
            remaining
                .into_iter()
                .filter(|i| reverse_remaining.contains(i))
                .map(|i| self.0[i].clone())
                .collect(),
        ))
    }

    /// Peel zero-dependency nodes until none remain, returning the
    /// consumed nodes in order and the indices left unconsumed
    fn peel(&self) -> (Vec<N>, Vec<NodeIndex>) {
        let mut degrees: Vec<usize> = self
            .0
            .node_indices()
            .map(|i| self.0.neighbors_directed(i, Direction::Outgoing).count())
            .collect();

        let mut ready = self
            .0
            .node_indices()
            .filter(|i| degrees[i.index()] == 0)
            .collect::<VecDeque<_>>();

        let mut sorted = Vec::with_capacity(self.0.node_count());
        let mut consumed = vec![false; self.0.node_count()];

        while let Some(index) = ready.pop_front() {
            sorted.push(self.0[index].clone());
            consumed[index.index()] = true;

            for parent in self.0.neighbors_directed(index, Direction::Incoming) {
                degrees[parent.index()] -= 1;

                if degrees[parent.index()] == 0 {
                    ready.push_back(parent);
                }
            }
        }

        let remaining = self.0.node_indices().filter(|i| !consumed[i.index()]).collect();

        (sorted, remaining)
    }

    /// Transpose the graph, returning the clone
    pub fn transpose(&self) -> Self {
        let mut transposed = self.0.clone();
        transposed.reverse();
        Self(transposed)
    }

    /// Split the graph at the given start node(s) - returning a new graph
    pub fn subgraph(&self, starting_nodes: &[N]) -> Self {
        Self(subgraph(&self.0, starting_nodes))
    }

    /// Return the index for node of type N
    pub fn get_index(&self, node: &N) -> Option<NodeIndex> {
        self.0.node_indices().find(|i| self.0[*i] == *node)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn diamond() -> Dag<&'static str> {
        // ui -> core, ui -> theme, theme -> core
        let mut dag = Dag::new();
        let ui = dag.add_node_or_get_index("ui");
        let core = dag.add_node_or_get_index("core");
        let theme = dag.add_node_or_get_index("theme");
        dag.add_edge(ui, core);
        dag.add_edge(ui, theme);
        dag.add_edge(theme, core);
        dag
    }

    #[test]
    fn nodes_deduplicate() {
        let mut dag = Dag::new();
        let a = dag.add_node_or_get_index("a");
        let again = dag.add_node_or_get_index("a");
        assert_eq!(a, again);
        assert_eq!(dag.node_count(), 1);
    }

    #[test]
    fn toposort_dependencies_first() {
        let order = diamond().toposort().unwrap();
        let pos = |n| order.iter().position(|x| *x == n).unwrap();

        assert!(pos("core") < pos("theme"));
        assert!(pos("theme") < pos("ui"));
    }

    #[test]
    fn toposort_reports_cycle_members() {
        let mut dag = diamond();
        let core = dag.get_index(&"core").unwrap();
        let ui = dag.get_index(&"ui").unwrap();
        let lone = dag.add_node_or_get_index("lone");
        dag.add_edge(core, ui);
        dag.add_edge(lone, core);

        let Cycle(mut members) = dag.toposort().unwrap_err();
        members.sort_unstable();

        // `lone` only points into the cycle and is peeled off
        assert_eq!(members, vec!["core", "theme", "ui"]);
    }

    #[test]
    fn transposed_subgraph_walks_dependents() {
        let reversed = diamond().transpose();
        let reachable = reversed.subgraph(&["core"]);

        let mut nodes: Vec<_> = reachable.iter_nodes().copied().collect();
        nodes.sort_unstable();
        assert_eq!(nodes, vec!["core", "theme", "ui"]);
    }
}
