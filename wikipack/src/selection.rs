// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Pure resolvers: transitive pack selection and per-page plan
//! resolution.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;

use crate::title;

/// Transitive closure of a manual selection under both `contains`
/// and `depends_on`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Closure {
    pub packs: Vec<String>,
    pub pages: Vec<String>,
    /// Every pack contributing a page of that name, sorted
    pub page_owners: BTreeMap<String, Vec<String>>,
}

pub fn closure(manifest: &manifest::Manifest, selected: &[String]) -> Closure {
    let mut packs = BTreeSet::new();
    let mut queue: VecDeque<&str> = selected.iter().map(String::as_str).collect();

    while let Some(id) = queue.pop_front() {
        let Some(pack) = manifest.packs.get(id) else {
            continue;
        };

        if !packs.insert(pack.id.clone()) {
            continue;
        }

        for reference in pack.contains.iter().chain(pack.depends_on.iter()) {
            queue.push_back(reference);
        }
    }

    let mut page_owners: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for id in &packs {
        for page in manifest.packs[id].pages.keys() {
            page_owners.entry(page.clone()).or_default().push(id.clone());
        }
    }

    Closure {
        packs: packs.into_iter().collect(),
        pages: page_owners.keys().cloned().collect(),
        page_owners,
    }
}

/// What the orchestrator should do with one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageAction {
    Create,
    Update,
    Rename,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub page: String,
    pub final_title: String,
    pub action: PageAction,
}

/// Inputs gathered by the caller before resolution
#[derive(Debug, Default)]
pub struct PlanInput<'a> {
    /// Explicit per-page overrides; a skip always wins
    pub overrides: BTreeMap<&'a str, PageAction>,
    /// Page names already installed, which update instead of create
    pub installed: BTreeSet<&'a str>,
    /// Final titles the host wiki reports as taken by someone else
    pub collisions: BTreeSet<&'a str>,
    /// Per-page renames, keyed by declared name
    pub renames: BTreeMap<&'a str, &'a str>,
    /// When set, colliding pages move under this prefix
    pub global_prefix: Option<&'a str>,
}

/// Flatten a closure into page-level actions. Colliding pages are
/// renamed under the global prefix (namespace preserved) when one is
/// configured.
pub fn resolve_plan(closure: &Closure, input: &PlanInput<'_>) -> Vec<PlanEntry> {
    closure
        .pages
        .iter()
        .map(|page| {
            let rename = input.renames.get(page.as_str()).copied();
            let base_title = title::resolve("", rename, page);

            if let Some(PageAction::Skip) = input.overrides.get(page.as_str()) {
                return PlanEntry {
                    page: page.clone(),
                    final_title: base_title,
                    action: PageAction::Skip,
                };
            }

            let collides = input.collisions.contains(base_title.as_str());

            let (final_title, action) = match (input.global_prefix, collides) {
                (Some(prefix), true) => (title::resolve(prefix, rename, page), PageAction::Rename),
                _ if input.installed.contains(page.as_str()) => (base_title, PageAction::Update),
                _ => (base_title, PageAction::Create),
            };

            let action = input.overrides.get(page.as_str()).copied().unwrap_or(action);

            PlanEntry {
                page: page.clone(),
                final_title,
                action,
            }
        })
        .collect()
}
