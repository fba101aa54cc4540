// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Pack apply orchestrator: turns a session's resolved install /
//! update / remove sets into registry and wiki writes. Validation
//! failures abort the whole apply; page-level failures are collected
//! and fail only their pack.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::db::{self, pack};
use crate::title;
use crate::wiki;

#[derive(Debug, Clone)]
pub struct PagePlan {
    pub name: String,
    pub final_title: String,
    /// Absolute path of the page body inside the worktree
    pub file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PackPlan {
    pub name: String,
    pub version: String,
    pub source_commit: Option<String>,
    pub depends_on: Vec<String>,
    pub pages: Vec<PagePlan>,
}

/// One resolved apply for a single ref
#[derive(Debug, Clone)]
pub struct Request {
    pub ref_id: i64,
    pub user: String,
    pub installs: Vec<PackPlan>,
    pub updates: Vec<PackPlan>,
    pub removes: Vec<String>,
    /// Removing a pack never deletes wiki pages unless this is set
    pub delete_pages: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub success: bool,
    pub installed: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub errors: Vec<Failure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub pack: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    MissingFile,
    WriteFailed,
    DependencyViolation,
}

pub struct Orchestrator {
    db: db::Database,
    wiki: Arc<dyn wiki::Client>,
}

impl Orchestrator {
    pub fn new(db: db::Database, wiki: Arc<dyn wiki::Client>) -> Self {
        Self { db, wiki }
    }

    /// Run all phases. Cancellation takes effect between packs; the
    /// in-flight pack runs to completion and stays recorded.
    pub async fn run(
        &self,
        request: &Request,
        cancel: &CancellationToken,
        progress: &(dyn Fn(i64, &str) + Send + Sync),
    ) -> Result<Report, Error> {
        let mut report = Report::default();

        let installed: BTreeSet<String> = self
            .db
            .list_packs(request.ref_id)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect();

        // Phase 1: installs and updates need every dependency either
        // staged alongside or already installed
        let staged: BTreeSet<&str> = request
            .installs
            .iter()
            .chain(request.updates.iter())
            .map(|p| p.name.as_str())
            .collect();

        for plan in request.installs.iter().chain(request.updates.iter()) {
            for dependency in &plan.depends_on {
                if !staged.contains(dependency.as_str()) && !installed.contains(dependency) {
                    report.errors.push(Failure {
                        kind: FailureKind::DependencyViolation,
                        pack: plan.name.clone(),
                        page: None,
                        detail: format!("missing dependency {dependency}"),
                    });
                }
            }
        }

        // Phase 2: a removal is blocked by installed dependents that
        // are not being removed too
        let removing: BTreeSet<&str> = request.removes.iter().map(String::as_str).collect();
        let edges = self.db.pack_dependencies(request.ref_id).await?;

        for removed in &request.removes {
            let blockers: Vec<&str> = edges
                .iter()
                .filter(|(dependent, dependency)| {
                    dependency == removed
                        && !removing.contains(dependent.as_str())
                        && installed.contains(dependent)
                })
                .map(|(dependent, _)| dependent.as_str())
                .collect();

            if !blockers.is_empty() {
                report.errors.push(Failure {
                    kind: FailureKind::DependencyViolation,
                    pack: removed.clone(),
                    page: None,
                    detail: format!("still required by {}", blockers.join(", ")),
                });
            }
        }

        if !report.errors.is_empty() {
            return Ok(report);
        }

        let install_order = order_by_dependencies(&request.installs)?;
        let update_order = order_by_dependencies(&request.updates)?;
        let remove_order = removal_order(&request.removes, &edges);

        let total = (install_order.len() + update_order.len() + remove_order.len()).max(1) as i64;
        let mut done = 0i64;

        // Phases 3 and 4: writes, dependency-first
        for plan in install_order.iter().chain(update_order.iter()) {
            if cancel.is_cancelled() {
                report.failed.push(plan.name.clone());
                continue;
            }

            progress(done * 100 / total, &format!("applying pack {}", plan.name));
            self.apply_pack(request, plan, &mut report).await?;
            done += 1;
        }

        // Phase 5: removals, dependents first
        for name in &remove_order {
            if cancel.is_cancelled() {
                report.failed.push(name.clone());
                continue;
            }

            progress(done * 100 / total, &format!("removing pack {name}"));
            self.remove_pack(request, name, &mut report).await?;
            done += 1;
        }

        report.success = report.failed.is_empty() && report.errors.is_empty();

        Ok(report)
    }

    /// Read every page body, write it to the wiki, then record the
    /// pack in one transaction. Any page failure fails the pack and
    /// no rows are written.
    async fn apply_pack(&self, request: &Request, plan: &PackPlan, report: &mut Report) -> Result<(), Error> {
        let mut failures = vec![];
        let mut pages = vec![];

        for page in &plan.pages {
            let content = match tokio::fs::read_to_string(&page.file).await {
                Ok(content) => content,
                Err(error) => {
                    failures.push(Failure {
                        kind: FailureKind::MissingFile,
                        pack: plan.name.clone(),
                        page: Some(page.name.clone()),
                        detail: format!("{}: {error}", page.file.display()),
                    });
                    continue;
                }
            };

            let written = match self.wiki.write(&page.final_title, &content).await {
                Ok(written) => written,
                Err(error) => {
                    failures.push(Failure {
                        kind: FailureKind::WriteFailed,
                        pack: plan.name.clone(),
                        page: Some(page.name.clone()),
                        detail: error.to_string(),
                    });
                    continue;
                }
            };

            pages.push(pack::PageRecord {
                name: page.name.clone(),
                final_title: page.final_title.clone(),
                page_namespace: title::split(&page.final_title).0.map(str::to_owned),
                wiki_page_id: Some(written.page_id),
                last_rev_id: Some(written.rev_id),
                content_hash: Some(hex::encode(Sha256::digest(content.as_bytes()))),
            });
        }

        if !failures.is_empty() {
            warn!(
                "pack {} failed with {} page error(s), skipping registration",
                plan.name,
                failures.len()
            );
            report.failed.push(plan.name.clone());
            report.errors.extend(failures);
            return Ok(());
        }

        self.db
            .record_pack_install(
                request.ref_id,
                pack::InstallRecord {
                    name: plan.name.clone(),
                    version: plan.version.clone(),
                    source_commit: plan.source_commit.clone(),
                    installed_by: request.user.clone(),
                    depends_on: plan.depends_on.clone(),
                    pages,
                },
            )
            .await?;

        info!("applied pack {} ({} pages)", plan.name, plan.pages.len());
        report.installed.push(plan.name.clone());

        Ok(())
    }

    /// Page rows and the pack row always go; wiki pages only when
    /// the request says so
    async fn remove_pack(&self, request: &Request, name: &str, report: &mut Report) -> Result<(), Error> {
        let Some(pack) = self.db.pack_by_name(request.ref_id, name).await? else {
            report.failed.push(name.to_owned());
            report.errors.push(Failure {
                kind: FailureKind::NotFound,
                pack: name.to_owned(),
                page: None,
                detail: "no installed pack of that name".to_owned(),
            });
            return Ok(());
        };

        if request.delete_pages {
            for page in self.db.list_pages(pack.id).await? {
                if let Err(error) = self.wiki.delete(&page.final_title).await {
                    warn!("could not delete wiki page {}: {error}", page.final_title);
                    report.errors.push(Failure {
                        kind: FailureKind::WriteFailed,
                        pack: name.to_owned(),
                        page: Some(page.name),
                        detail: error.to_string(),
                    });
                }
            }
        }

        self.db.delete_pack(pack.id).await?;
        report.removed.push(name.to_owned());

        Ok(())
    }
}

/// Dependency-first order over the staged set. The manifest was
/// validated acyclic, so a cycle here is an invariant violation.
fn order_by_dependencies(plans: &[PackPlan]) -> Result<Vec<&PackPlan>, Error> {
    let staged: BTreeSet<&str> = plans.iter().map(|p| p.name.as_str()).collect();

    let mut graph = dag::Dag::new();

    for plan in plans {
        let node = graph.add_node_or_get_index(plan.name.as_str());

        for dependency in &plan.depends_on {
            if staged.contains(dependency.as_str()) {
                let dep = graph.add_node_or_get_index(dependency.as_str());
                graph.add_edge(node, dep);
            }
        }
    }

    let order = graph
        .toposort()
        .map_err(|dag::Cycle(members)| Error::Internal(format!(
            "staged packs form a dependency cycle: {}",
            members.join(", ")
        )))?;

    Ok(order
        .into_iter()
        .filter_map(|name| plans.iter().find(|p| p.name == name))
        .collect())
}

/// Reverse topological order over the installed dependency edges:
/// dependents are removed before their dependencies
fn removal_order(removes: &[String], edges: &[(String, String)]) -> Vec<String> {
    let removing: BTreeSet<&str> = removes.iter().map(String::as_str).collect();

    let mut graph = dag::Dag::new();

    for name in removes {
        graph.add_node_or_get_index(name.as_str());
    }

    for (dependent, dependency) in edges {
        if removing.contains(dependent.as_str()) && removing.contains(dependency.as_str()) {
            let a = graph.add_node_or_get_index(dependent.as_str());
            let b = graph.add_node_or_get_index(dependency.as_str());
            graph.add_edge(a, b);
        }
    }

    let mut order: Vec<String> = graph
        .toposort()
        .unwrap_or_else(|dag::Cycle(members)| members)
        .into_iter()
        .map(str::to_owned)
        .collect();

    order.reverse();
    order
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("registry: {0}")]
    Database(#[from] db::Error),
    #[error("internal: {0}")]
    Internal(String),
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use crate::db::{refs, Clock, Database};
    use crate::wiki::Client;

    use super::*;

    struct Fixture {
        orchestrator: Orchestrator,
        wiki: Arc<wiki::Memory>,
        ref_id: i64,
        worktree: TempDir,
    }

    async fn fixture() -> Fixture {
        let db = Database::memory(Clock::system()).await.unwrap();
        let repo = db
            .add_repo("https://git.example/content", "main", "/cache/x.git")
            .await
            .unwrap();
        let reference = db.ensure_ref(repo.id, "main", refs::Change::default()).await.unwrap();

        let worktree = TempDir::new().unwrap();
        std::fs::write(worktree.path().join("Home.wiki"), "= Home =").unwrap();
        std::fs::write(worktree.path().join("Card.wiki"), "card body").unwrap();

        let wiki = Arc::new(wiki::Memory::new());

        Fixture {
            orchestrator: Orchestrator::new(db, wiki.clone()),
            wiki,
            ref_id: reference.id,
            worktree,
        }
    }

    fn plan(fixture: &Fixture, name: &str, depends_on: Vec<&str>, pages: Vec<(&str, &str, &str)>) -> PackPlan {
        PackPlan {
            name: name.to_owned(),
            version: "1.0.0".to_owned(),
            source_commit: Some("abc".to_owned()),
            depends_on: depends_on.into_iter().map(str::to_owned).collect(),
            pages: pages
                .into_iter()
                .map(|(page, final_title, file)| PagePlan {
                    name: page.to_owned(),
                    final_title: final_title.to_owned(),
                    file: fixture.worktree.path().join(file),
                })
                .collect(),
        }
    }

    fn request(fixture: &Fixture) -> Request {
        Request {
            ref_id: fixture.ref_id,
            user: "alice".to_owned(),
            installs: vec![],
            updates: vec![],
            removes: vec![],
            delete_pages: false,
        }
    }

    #[tokio::test]
    async fn install_with_dependency_in_order() {
        let fixture = fixture().await;

        let mut req = request(&fixture);
        req.installs = vec![
            plan(&fixture, "ui", vec!["core"], vec![("Card", "Template:Pubs/Card", "Card.wiki")]),
            plan(&fixture, "core", vec![], vec![("Home", "Pubs/Home", "Home.wiki")]),
        ];

        let report = fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        assert!(report.success);
        // dependency first despite submission order
        assert_eq!(report.installed, vec!["core", "ui"]);
        assert!(report.failed.is_empty());

        assert!(fixture.wiki.exists("Pubs/Home").await.unwrap());
        assert!(fixture.wiki.exists("Template:Pubs/Card").await.unwrap());

        let db = &fixture.orchestrator.db;
        let core = db.pack_by_name(fixture.ref_id, "core").await.unwrap().unwrap();
        let page = db.page_by_name(core.id, "Home").await.unwrap().unwrap();
        assert_eq!(page.final_title, "Pubs/Home");
        assert!(page.wiki_page_id.is_some());
        assert!(page.content_hash.is_some());
    }

    #[tokio::test]
    async fn missing_dependency_aborts_everything() {
        let fixture = fixture().await;

        let mut req = request(&fixture);
        req.installs = vec![plan(&fixture, "ui", vec!["core"], vec![("Card", "Card", "Card.wiki")])];

        let report = fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.installed.is_empty());
        assert_eq!(report.errors[0].kind, FailureKind::DependencyViolation);
        assert!(!fixture.wiki.exists("Card").await.unwrap());
    }

    #[tokio::test]
    async fn removal_blocked_by_dependent() {
        let fixture = fixture().await;
        let db = &fixture.orchestrator.db;

        let core = db.register_pack(fixture.ref_id, "core", "1.0.0", None, "alice").await.unwrap();
        let ui = db.register_pack(fixture.ref_id, "ui", "1.0.0", None, "alice").await.unwrap();
        db.set_pack_dependencies(ui.id, &[core.id]).await.unwrap();

        let mut req = request(&fixture);
        req.removes = vec!["core".to_owned()];

        let report = fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.errors[0].kind, FailureKind::DependencyViolation);
        assert_eq!(report.errors[0].pack, "core");
        assert!(report.errors[0].detail.contains("ui"));
        assert!(db.pack_by_name(fixture.ref_id, "core").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_file_fails_only_its_pack() {
        let fixture = fixture().await;

        let mut req = request(&fixture);
        req.installs = vec![
            plan(&fixture, "core", vec![], vec![("Home", "Core/Home", "Home.wiki")]),
            plan(&fixture, "docs", vec![], vec![("Guide", "Docs/Guide", "Ghost.wiki")]),
        ];

        let report = fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.installed, vec!["core"]);
        assert_eq!(report.failed, vec!["docs"]);
        assert_eq!(report.errors[0].kind, FailureKind::MissingFile);

        // the failed pack registered nothing
        let db = &fixture.orchestrator.db;
        assert!(db.pack_by_name(fixture.ref_id, "docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removal_deletes_pages_only_when_asked() {
        let fixture = fixture().await;
        let db = &fixture.orchestrator.db;

        let mut req = request(&fixture);
        req.installs = vec![plan(&fixture, "core", vec![], vec![("Home", "Core/Home", "Home.wiki")])];
        fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        // keep pages on the wiki
        let mut req = request(&fixture);
        req.removes = vec!["core".to_owned()];
        let report = fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.removed, vec!["core"]);
        assert!(fixture.wiki.exists("Core/Home").await.unwrap());
        assert!(db.pack_by_name(fixture.ref_id, "core").await.unwrap().is_none());

        // reinstall, then remove with deletion
        let mut req = request(&fixture);
        req.installs = vec![plan(&fixture, "core", vec![], vec![("Home", "Core/Home", "Home.wiki")])];
        fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        let mut req = request(&fixture);
        req.removes = vec!["core".to_owned()];
        req.delete_pages = true;
        fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        assert!(!fixture.wiki.exists("Core/Home").await.unwrap());
    }

    #[tokio::test]
    async fn dependents_removed_before_dependencies() {
        let fixture = fixture().await;
        let db = &fixture.orchestrator.db;

        let core = db.register_pack(fixture.ref_id, "core", "1.0.0", None, "alice").await.unwrap();
        let ui = db.register_pack(fixture.ref_id, "ui", "1.0.0", None, "alice").await.unwrap();
        db.set_pack_dependencies(ui.id, &[core.id]).await.unwrap();

        let mut req = request(&fixture);
        req.removes = vec!["core".to_owned(), "ui".to_owned()];

        let report = fixture
            .orchestrator
            .run(&req, &CancellationToken::new(), &|_, _| {})
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.removed, vec!["ui", "core"]);
    }
}
