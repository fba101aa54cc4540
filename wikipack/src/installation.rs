// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::trace;

/// On-disk layout rooted at the service data directory:
/// `db/` for the registry database, `cache/` for bare mirrors and
/// `worktrees/` for per-ref checkouts.
#[derive(Debug, Clone)]
pub struct Installation {
    pub root: PathBuf,
}

impl Installation {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root: PathBuf = root.into();

        for dir in [root.join("db"), root.join("cache"), root.join("worktrees")] {
            fs::create_dir_all(dir)?;
        }

        trace!("installation root: {root:?}");

        Ok(Self { root })
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("db").join("wikipack.db")
    }

    pub fn cache_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join("cache").join(path)
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn worktrees_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.worktrees_dir().join(path)
    }
}
