// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Pure derivations from a validated [`Manifest`]

use std::collections::BTreeSet;

use serde::Serialize;

use crate::Manifest;

/// Forest of pack containment, roots being packs not contained in
/// any other pack
#[derive(Debug, Clone, Serialize)]
pub struct Hierarchy {
    pub roots: Vec<Node>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub version: String,
    pub pages: Vec<String>,
    pub children: Vec<Node>,
}

/// Both edge sets over the declared packs, nodes and edges in
/// deterministic order
#[derive(Debug, Clone, Serialize)]
pub struct Graph {
    pub nodes: Vec<String>,
    pub contains: Vec<(String, String)>,
    pub depends: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub pack_count: usize,
    pub page_count: usize,
}

pub fn hierarchy(manifest: &Manifest) -> Hierarchy {
    let contained: BTreeSet<&str> = manifest
        .packs
        .values()
        .flat_map(|pack| pack.contains.iter().map(String::as_str))
        .collect();

    let roots = manifest
        .packs
        .values()
        .filter(|pack| !contained.contains(pack.id.as_str()))
        .map(|pack| node(manifest, &pack.id))
        .collect();

    Hierarchy { roots }
}

fn node(manifest: &Manifest, id: &str) -> Node {
    let pack = &manifest.packs[id];

    let mut children: Vec<&String> = pack.contains.iter().collect();
    children.sort();

    Node {
        id: pack.id.clone(),
        version: pack.version.to_string(),
        pages: pack.pages.keys().cloned().collect(),
        children: children.into_iter().map(|child| node(manifest, child)).collect(),
    }
}

pub fn graph(manifest: &Manifest) -> Graph {
    let nodes = manifest.packs.keys().cloned().collect();

    let mut contains = vec![];
    let mut depends = vec![];

    for pack in manifest.packs.values() {
        for child in &pack.contains {
            contains.push((pack.id.clone(), child.clone()));
        }
        for dependency in &pack.depends_on {
            depends.push((pack.id.clone(), dependency.clone()));
        }
    }

    contains.sort();
    depends.sort();

    Graph {
        nodes,
        contains,
        depends,
    }
}

pub fn stats(manifest: &Manifest) -> Stats {
    Stats {
        pack_count: manifest.packs.len(),
        page_count: manifest.packs.values().map(|pack| pack.pages.len()).sum(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::from_slice;

    fn fixture() -> Manifest {
        from_slice(
            br#"
schema_version: "1.0.0"
packs:
  suite:
    version: "1.0.0"
    contains: [core, ui]
  core:
    version: "1.2.0"
    pages: [Home, "Template:Card"]
  ui:
    version: "0.9.0"
    depends_on: [core]
    pages: [Dashboard]
"#,
        )
        .unwrap()
    }

    #[test]
    fn hierarchy_roots_and_children() {
        let tree = hierarchy(&fixture());

        assert_eq!(tree.roots.len(), 1);

        let suite = &tree.roots[0];
        assert_eq!(suite.id, "suite");

        let children: Vec<_> = suite.children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(children, vec!["core", "ui"]);
        assert_eq!(suite.children[0].version, "1.2.0");
    }

    #[test]
    fn graph_edges_deterministic() {
        let graph = graph(&fixture());

        assert_eq!(graph.nodes, vec!["core", "suite", "ui"]);
        assert_eq!(
            graph.contains,
            vec![
                ("suite".to_owned(), "core".to_owned()),
                ("suite".to_owned(), "ui".to_owned())
            ]
        );
        assert_eq!(graph.depends, vec![("ui".to_owned(), "core".to_owned())]);
    }

    #[test]
    fn stats_counts() {
        let stats = stats(&fixture());

        assert_eq!(stats.pack_count, 3);
        assert_eq!(stats.page_count, 3);
    }
}
