// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use petgraph::{prelude::DiGraph, visit::Dfs, Direction};

/// Extract the reachable subgraph from the given start nodes.
/// Used in transposed form to find the dependents of a pack slated
/// for removal.
pub fn subgraph<N>(graph: &DiGraph<N, (), u32>, starting_nodes: &[N]) -> DiGraph<N, (), u32>
where
    N: PartialEq + Clone,
{
    let add_node = |out: &mut DiGraph<N, (), u32>, node: N| {
        if let Some(index) = out.node_indices().find(|i| out[*i] == node) {
            index
        } else {
            out.add_node(node)
        }
    };

    let mut res = DiGraph::default();
    let mut dfs = Dfs::empty(&graph);

    for starting_node in starting_nodes {
        let Some(start) = graph.node_indices().find(|n| graph[*n] == *starting_node) else {
            continue;
        };

        dfs.move_to(start);

        while let Some(node) = dfs.next(&graph) {
            let node_index = add_node(&mut res, graph[node].clone());

            for neighbor in graph.neighbors_directed(node, Direction::Outgoing) {
                let neighbor_index = add_node(&mut res, graph[neighbor].clone());
                res.update_edge(node_index, neighbor_index, ());
            }
        }
    }

    res
}
