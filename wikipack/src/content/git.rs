// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Invocation of the system `git` binary. Working-tree mutations go
//! through the CLI rather than a library binding so that mirror and
//! worktree semantics match what operators can reproduce by hand.

use std::{future::Future, io, path::Path, process::Output, time::Duration};

use log::debug;
use thiserror::Error;
use tokio::process::Command;

/// Transient transport hiccups get one more attempt after this delay,
/// doubled once
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// The git operations the content manager needs. Implemented by
/// [`Git`] for real use; tests substitute a scripted runner.
pub trait Runner: Send + Sync {
    fn clone_mirror(&self, url: &str, dest: &Path) -> impl Future<Output = Result<(), Error>> + Send;

    /// Update all refs in a bare mirror from its origin
    fn fetch(&self, bare: &Path) -> impl Future<Output = Result<(), Error>> + Send;

    /// Resolve a revision to a commit hash, or None when the
    /// revision does not exist
    fn rev_parse(&self, repo: &Path, rev: &str) -> impl Future<Output = Result<Option<String>, Error>> + Send;

    fn worktree_add(
        &self,
        bare: &Path,
        path: &Path,
        reference: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Move a detached worktree to the given commit
    fn worktree_reset(&self, worktree: &Path, commit: &str) -> impl Future<Output = Result<(), Error>> + Send;

    fn worktree_remove(&self, bare: &Path, path: &Path) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Git;

impl Runner for Git {
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<(), Error> {
        self.run(None, &["clone", "--mirror", url, &dest.to_string_lossy()])
            .await
            .map(|_| ())
    }

    async fn fetch(&self, bare: &Path) -> Result<(), Error> {
        self.run(Some(bare), &["remote", "update", "--prune"]).await.map(|_| ())
    }

    async fn rev_parse(&self, repo: &Path, rev: &str) -> Result<Option<String>, Error> {
        // ^{commit} peels annotated tags
        match self
            .run(Some(repo), &["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
            .await
        {
            Ok(out) => Ok(Some(out)),
            Err(Error::Failed { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn worktree_add(&self, bare: &Path, path: &Path, reference: &str) -> Result<(), Error> {
        self.run(
            Some(bare),
            &["worktree", "add", "--detach", &path.to_string_lossy(), reference],
        )
        .await
        .map(|_| ())
    }

    async fn worktree_reset(&self, worktree: &Path, commit: &str) -> Result<(), Error> {
        self.run(Some(worktree), &["reset", "--hard", commit]).await.map(|_| ())
    }

    async fn worktree_remove(&self, bare: &Path, path: &Path) -> Result<(), Error> {
        self.run(
            Some(bare),
            &["worktree", "remove", "--force", &path.to_string_lossy()],
        )
        .await
        .map(|_| ())
    }
}

impl Git {
    /// Run git once, retrying a single time on failure
    async fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, Error> {
        match self.run_once(cwd, args).await {
            Ok(output) => Ok(output),
            Err(first) => {
                debug!("git {args:?} failed ({first}), retrying");
                tokio::time::sleep(RETRY_DELAY * 2).await;
                self.run_once(cwd, args).await
            }
        }
    }

    async fn run_once(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, Error> {
        let mut command = Command::new("git");

        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output: Output = command.args(args).output().await.map_err(Error::Spawn)?;

        if !output.status.success() {
            return Err(Error::Failed {
                command: format!("git {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn git: {0}")]
    Spawn(io::Error),
    #[error("{command}: {stderr}")]
    Failed { command: String, stderr: String },
}
