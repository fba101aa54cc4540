// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Git content layer: one bare mirror per repository URL, one
//! checked-out worktree per (repo, ref), reconciled with the repo and
//! ref registries. This module is the only writer of `cache/` and
//! `worktrees/`.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use log::{info, warn};
use thiserror::Error;
use tokio::{fs, io, sync::Mutex};
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

use crate::db::{self, refs, repo};
use crate::installation::Installation;

pub use self::git::{Git, Runner};

pub mod git;

/// Manage bare mirrors and worktrees for all registered content
/// repositories
pub struct Manager<R = Git> {
    db: db::Database,
    installation: Installation,
    git: R,
    url_locks: Locks<String>,
    ref_locks: Locks<(String, String)>,
}

/// Outcome of a whole-repo sync; per-ref failures do not abort the
/// remaining refs
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: usize,
    pub failures: Vec<(String, String)>,
}

impl<R: Runner> Manager<R> {
    pub fn new(db: db::Database, installation: Installation, git: R) -> Self {
        Self {
            db,
            installation,
            git,
            url_locks: Locks::default(),
            ref_locks: Locks::default(),
        }
    }

    /// Clone the mirror if absent and ensure the repo row exists.
    /// Idempotent: a second call returns the same bare path and row.
    pub async fn ensure_bare_repo(&self, url: &Url, default_ref: &str) -> Result<repo::Repo, Error> {
        let normalized = normalize_url(url);
        let _guard = self.url_locks.lock(normalized.clone()).await;

        let bare = self.bare_path(&normalized);

        if !bare.exists() {
            if let Some(parent) = bare.parent() {
                fs::create_dir_all(parent).await?;
            }

            info!("mirroring {normalized} into {bare:?}");
            self.git.clone_mirror(&normalized, &bare).await?;
        }

        let repo = self
            .db
            .ensure_repo(&normalized, default_ref, &bare.to_string_lossy())
            .await?;

        // the clone is also the first fetch
        let repo = self
            .db
            .update_repo(
                repo.id,
                repo::Change {
                    last_fetched: Some(self.db.clock().stamp()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(repo)
    }

    /// Create the worktree for (url, ref) if absent, resolving the
    /// ref to a commit, and ensure the ref row
    pub async fn ensure_worktree(&self, url: &Url, source_ref: &str) -> Result<refs::Ref, Error> {
        let normalized = normalize_url(url);

        let repo = self
            .db
            .repo_by_url(&normalized)
            .await?
            .ok_or_else(|| Error::UnknownRepo(normalized.clone()))?;

        let _guard = self.ref_locks.lock((normalized.clone(), source_ref.to_owned())).await;

        let bare = PathBuf::from(&repo.bare_path);
        if !bare.exists() {
            // registry row survived a lost cache directory; recreate
            let _url_guard = self.url_locks.lock(normalized.clone()).await;
            if let Some(parent) = bare.parent() {
                fs::create_dir_all(parent).await?;
            }
            self.git.clone_mirror(&normalized, &bare).await?;
        }

        let commit = self
            .git
            .rev_parse(&bare, source_ref)
            .await?
            .ok_or_else(|| Error::UnknownRef {
                url: normalized.clone(),
                source_ref: source_ref.to_owned(),
            })?;

        let worktree = self.worktree_path(&normalized, source_ref);

        if !worktree.exists() {
            if let Some(parent) = worktree.parent() {
                fs::create_dir_all(parent).await?;
            }
            self.git.worktree_add(&bare, &worktree, &commit).await?;
        }

        let reference = self
            .db
            .ensure_ref(
                repo.id,
                source_ref,
                refs::Change {
                    last_commit: Some(commit),
                    worktree_path: Some(worktree.to_string_lossy().into_owned()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(reference)
    }

    /// Fetch the mirror and fast-forward one worktree. Fails when the
    /// ref no longer exists upstream.
    pub async fn sync_ref(&self, url: &Url, source_ref: &str) -> Result<refs::Ref, Error> {
        let normalized = normalize_url(url);

        let repo = self
            .db
            .repo_by_url(&normalized)
            .await?
            .ok_or_else(|| Error::UnknownRepo(normalized.clone()))?;

        let bare = PathBuf::from(&repo.bare_path);

        {
            let _guard = self.url_locks.lock(normalized.clone()).await;
            self.git.fetch(&bare).await?;
        }

        let _guard = self.ref_locks.lock((normalized.clone(), source_ref.to_owned())).await;

        let commit = self
            .git
            .rev_parse(&bare, source_ref)
            .await?
            .ok_or_else(|| Error::RefVanished {
                url: normalized.clone(),
                source_ref: source_ref.to_owned(),
            })?;

        let worktree = self.worktree_path(&normalized, source_ref);

        if worktree.exists() {
            self.git.worktree_reset(&worktree, &commit).await?;
        } else {
            // lazy recreation after a pruned or lost checkout
            if let Some(parent) = worktree.parent() {
                fs::create_dir_all(parent).await?;
            }
            self.git.worktree_add(&bare, &worktree, &commit).await?;
        }

        let reference = self
            .db
            .ensure_ref(
                repo.id,
                source_ref,
                refs::Change {
                    last_commit: Some(commit),
                    worktree_path: Some(worktree.to_string_lossy().into_owned()),
                    ..Default::default()
                },
            )
            .await?;

        self.db
            .update_repo(
                repo.id,
                repo::Change {
                    last_fetched: Some(self.db.clock().stamp()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(reference)
    }

    /// Sync every known ref of a repo, continuing past per-ref
    /// failures
    pub async fn sync_repo(&self, url: &Url) -> Result<SyncReport, Error> {
        let normalized = normalize_url(url);

        let repo = self
            .db
            .repo_by_url(&normalized)
            .await?
            .ok_or_else(|| Error::UnknownRepo(normalized.clone()))?;

        let mut report = SyncReport::default();

        for reference in self.db.list_refs(repo.id).await? {
            match self.sync_ref(url, &reference.source_ref).await {
                Ok(_) => report.synced += 1,
                Err(error) => {
                    warn!("sync of {normalized}@{} failed: {error}", reference.source_ref);
                    report.failures.push((reference.source_ref, error.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Remove the worktree directory and the ref row
    pub async fn remove_ref(&self, url: &Url, source_ref: &str) -> Result<(), Error> {
        let normalized = normalize_url(url);

        let repo = self
            .db
            .repo_by_url(&normalized)
            .await?
            .ok_or_else(|| Error::UnknownRepo(normalized.clone()))?;

        let reference = self
            .db
            .ref_by_key(repo.id, source_ref)
            .await?
            .ok_or_else(|| Error::UnknownRef {
                url: normalized.clone(),
                source_ref: source_ref.to_owned(),
            })?;

        let _guard = self.ref_locks.lock((normalized.clone(), source_ref.to_owned())).await;

        let worktree = self.worktree_path(&normalized, source_ref);
        if worktree.exists() {
            let bare = PathBuf::from(&repo.bare_path);
            if let Err(error) = self.git.worktree_remove(&bare, &worktree).await {
                warn!("git worktree remove failed ({error}), deleting {worktree:?} directly");
                fs::remove_dir_all(&worktree).await?;
            }
        }

        self.db.delete_ref(reference.id).await?;

        Ok(())
    }

    /// Remove all refs, the bare mirror, and the repo row
    pub async fn remove_repo(&self, url: &Url) -> Result<(), Error> {
        let normalized = normalize_url(url);

        let repo = self
            .db
            .repo_by_url(&normalized)
            .await?
            .ok_or_else(|| Error::UnknownRepo(normalized.clone()))?;

        for reference in self.db.list_refs(repo.id).await? {
            self.remove_ref(url, &reference.source_ref).await?;
        }

        let _guard = self.url_locks.lock(normalized.clone()).await;

        let bare = PathBuf::from(&repo.bare_path);
        if bare.exists() {
            fs::remove_dir_all(&bare).await?;
        }

        // worktree container directory for this url, if empty by now
        let _ = fs::remove_dir(self.installation.worktrees_path(url_hash(&normalized))).await;

        self.db.delete_repo(repo.id).await?;

        Ok(())
    }

    /// Startup scan: prune worktree directories no ref row points at.
    /// Refs whose worktree is missing are recreated lazily on next
    /// use.
    pub async fn reconcile(&self) -> Result<(), Error> {
        let known: Vec<PathBuf> = self
            .db
            .list_all_refs()
            .await?
            .into_iter()
            .filter_map(|r| r.worktree_path.map(PathBuf::from))
            .collect();

        let worktrees = self.installation.worktrees_dir();
        let mut repos = match fs::read_dir(&worktrees).await {
            Ok(dir) => dir,
            Err(_) => return Ok(()),
        };

        while let Some(repo_dir) = repos.next_entry().await? {
            let mut refs = fs::read_dir(repo_dir.path()).await?;

            while let Some(ref_dir) = refs.next_entry().await? {
                let path = ref_dir.path();

                if !known.contains(&path) {
                    info!("pruning orphaned worktree {path:?}");
                    fs::remove_dir_all(&path).await?;
                }
            }
        }

        Ok(())
    }

    pub fn bare_path(&self, normalized_url: &str) -> PathBuf {
        self.installation.cache_path(format!("{}.git", url_hash(normalized_url)))
    }

    pub fn worktree_path(&self, normalized_url: &str, source_ref: &str) -> PathBuf {
        self.installation
            .worktrees_path(url_hash(normalized_url))
            .join(hex::encode(xxh3_64(source_ref.as_bytes()).to_be_bytes()))
    }
}

/// Canonical form used as the repo natural key: lowercased scheme and
/// host, no trailing slash or `.git`. The path keeps its case.
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();

    let scheme = url.scheme().to_ascii_lowercase();
    let _ = url.set_scheme(&scheme);

    if let Some(host) = url.host_str() {
        let host = host.to_ascii_lowercase();
        let _ = url.set_host(Some(&host));
    }

    let mut normalized = url.to_string();

    while normalized.ends_with('/') {
        normalized.pop();
    }

    if let Some(stripped) = normalized.strip_suffix(".git") {
        normalized = stripped.to_owned();
    }

    normalized
}

fn url_hash(normalized_url: &str) -> String {
    hex::encode(xxh3_64(normalized_url.as_bytes()).to_be_bytes())
}

/// Keyed async locks, created on first use
struct Locks<K> {
    inner: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for Locks<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: std::hash::Hash + Eq + Clone> Locks<K> {
    async fn lock(&self, key: K) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };

        lock.lock_owned().await
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown repository {0}")]
    UnknownRepo(String),
    #[error("unknown ref {source_ref} for {url}")]
    UnknownRef { url: String, source_ref: String },
    #[error("ref {source_ref} no longer exists upstream in {url}")]
    RefVanished { url: String, source_ref: String },
    #[error("git: {0}")]
    Git(#[from] git::Error),
    #[error("registry: {0}")]
    Database(#[from] db::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use crate::db::Clock;

    use super::*;

    /// Scripted runner: materializes directories instead of talking
    /// to git, and counts clones
    #[derive(Default)]
    struct Stub {
        clones: AtomicUsize,
        missing_refs: Vec<String>,
    }

    impl Runner for Stub {
        async fn clone_mirror(&self, _url: &str, dest: &Path) -> Result<(), git::Error> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(dest).unwrap();
            Ok(())
        }

        async fn fetch(&self, _bare: &Path) -> Result<(), git::Error> {
            Ok(())
        }

        async fn rev_parse(&self, _repo: &Path, rev: &str) -> Result<Option<String>, git::Error> {
            if self.missing_refs.iter().any(|r| r == rev) {
                Ok(None)
            } else {
                Ok(Some(format!("commit-of-{rev}")))
            }
        }

        async fn worktree_add(&self, _bare: &Path, path: &Path, _reference: &str) -> Result<(), git::Error> {
            std::fs::create_dir_all(path).unwrap();
            Ok(())
        }

        async fn worktree_reset(&self, _worktree: &Path, _commit: &str) -> Result<(), git::Error> {
            Ok(())
        }

        async fn worktree_remove(&self, _bare: &Path, path: &Path) -> Result<(), git::Error> {
            std::fs::remove_dir_all(path).unwrap();
            Ok(())
        }
    }

    async fn fixture() -> (Manager<Stub>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let installation = Installation::open(tmp.path()).unwrap();
        let db = db::Database::memory(Clock::system()).await.unwrap();
        (Manager::new(db, installation, Stub::default()), tmp)
    }

    fn url() -> Url {
        Url::parse("https://git.example/wiki/Content.git").unwrap()
    }

    #[tokio::test]
    async fn ensure_bare_repo_is_idempotent() {
        let (manager, _tmp) = fixture().await;

        let first = manager.ensure_bare_repo(&url(), "main").await.unwrap();
        let second = manager.ensure_bare_repo(&url(), "main").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.bare_path, second.bare_path);
        assert_eq!(manager.git.clones.load(Ordering::SeqCst), 1);
        assert_eq!(manager.db.list_repos().await.unwrap().len(), 1);
        assert!(second.last_fetched.is_some());
    }

    #[tokio::test]
    async fn url_normalization_dedupes() {
        let (manager, _tmp) = fixture().await;

        manager.ensure_bare_repo(&url(), "main").await.unwrap();
        manager
            .ensure_bare_repo(&Url::parse("https://git.example/wiki/Content").unwrap(), "main")
            .await
            .unwrap();

        assert_eq!(manager.db.list_repos().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn url_case_differences_dedupe() {
        let (manager, _tmp) = fixture().await;

        manager.ensure_bare_repo(&url(), "main").await.unwrap();
        manager
            .ensure_bare_repo(
                &Url::parse("HTTPS://GIT.EXAMPLE/wiki/Content.git").unwrap(),
                "main",
            )
            .await
            .unwrap();

        assert_eq!(manager.db.list_repos().await.unwrap().len(), 1);
    }

    #[test]
    fn normalization_lowercases_scheme_and_host() {
        let url = Url::parse("HTTPS://Git.Example/Wiki/Content.git/").unwrap();

        assert_eq!(normalize_url(&url), "https://git.example/Wiki/Content");
    }

    #[tokio::test]
    async fn worktree_requires_known_repo() {
        let (manager, _tmp) = fixture().await;

        assert!(matches!(
            manager.ensure_worktree(&url(), "main").await,
            Err(Error::UnknownRepo(_))
        ));
    }

    #[tokio::test]
    async fn worktree_resolves_ref_and_registers() {
        let (manager, _tmp) = fixture().await;

        manager.ensure_bare_repo(&url(), "main").await.unwrap();
        let reference = manager.ensure_worktree(&url(), "main").await.unwrap();

        assert_eq!(reference.last_commit.as_deref(), Some("commit-of-main"));
        assert!(reference.worktree_path.is_some());
        assert!(PathBuf::from(reference.worktree_path.unwrap()).exists());
    }

    #[tokio::test]
    async fn missing_upstream_ref_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let installation = Installation::open(tmp.path()).unwrap();
        let db = db::Database::memory(Clock::system()).await.unwrap();
        let manager = Manager::new(
            db,
            installation,
            Stub {
                missing_refs: vec!["gone".to_owned()],
                ..Default::default()
            },
        );

        manager.ensure_bare_repo(&url(), "main").await.unwrap();

        assert!(matches!(
            manager.ensure_worktree(&url(), "gone").await,
            Err(Error::UnknownRef { .. })
        ));
    }

    #[tokio::test]
    async fn sync_repo_aggregates_failures() {
        let tmp = TempDir::new().unwrap();
        let installation = Installation::open(tmp.path()).unwrap();
        let db = db::Database::memory(Clock::system()).await.unwrap();
        let manager = Manager::new(
            db,
            installation,
            Stub {
                missing_refs: vec!["retired".to_owned()],
                ..Default::default()
            },
        );

        manager.ensure_bare_repo(&url(), "main").await.unwrap();
        manager.ensure_worktree(&url(), "main").await.unwrap();

        // a ref that has since vanished upstream
        let repo = manager.db.repo_by_url(&normalize_url(&url())).await.unwrap().unwrap();
        manager
            .db
            .ensure_ref(repo.id, "retired", refs::Change::default())
            .await
            .unwrap();

        let report = manager.sync_repo(&url()).await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "retired");
    }

    #[tokio::test]
    async fn remove_repo_clears_rows_and_directories() {
        let (manager, _tmp) = fixture().await;

        let repo = manager.ensure_bare_repo(&url(), "main").await.unwrap();
        let reference = manager.ensure_worktree(&url(), "main").await.unwrap();
        let worktree = PathBuf::from(reference.worktree_path.clone().unwrap());
        let bare = PathBuf::from(&repo.bare_path);

        manager.remove_repo(&url()).await.unwrap();

        assert!(!worktree.exists());
        assert!(!bare.exists());
        assert!(manager.db.repo_by_url(&normalize_url(&url())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_prunes_orphans() {
        let (manager, tmp) = fixture().await;

        manager.ensure_bare_repo(&url(), "main").await.unwrap();
        let kept = manager.ensure_worktree(&url(), "main").await.unwrap();

        let orphan = tmp.path().join("worktrees").join("deadbeef").join("cafe");
        std::fs::create_dir_all(&orphan).unwrap();

        manager.reconcile().await.unwrap();

        assert!(!orphan.exists());
        assert!(PathBuf::from(kept.worktree_path.unwrap()).exists());
    }
}
