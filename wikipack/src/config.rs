// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Service configuration, loaded from `config.yaml` under the data
/// root. Every field has a default so a bare directory works.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory holding db/, cache/ and worktrees/
    pub root: PathBuf,
    pub listen: SocketAddr,
    /// Bounded operation queue; overflow is reported to the caller
    pub queue_capacity: usize,
    /// Worker pool for long-running operations
    pub workers: usize,
    /// Operations older than this are swept
    pub retention_days: u64,
    /// Keep still-running operations regardless of age
    pub sweep_only_completed: bool,
    /// Upper bound on a single apply; unset means unbounded
    pub apply_timeout_secs: Option<u64>,
    pub wiki: Wiki,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Wiki {
    /// Host wiki endpoint; unset selects the in-memory store, which
    /// only makes sense for local experiments and tests
    pub endpoint: Option<Url>,
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/wikipack"),
            listen: ([127, 0, 0, 1], 8744).into(),
            queue_capacity: 64,
            workers: 4,
            retention_days: 14,
            sweep_only_completed: true,
            apply_timeout_secs: Some(600),
            wiki: Wiki::default(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or from `<root>/config.yaml` when
    /// present, falling back to defaults
    pub fn load(root: impl Into<PathBuf>, path: Option<&Path>) -> Result<Self, Error> {
        let root: PathBuf = root.into();

        let candidate = match path {
            Some(path) => path.to_path_buf(),
            None => root.join("config.yaml"),
        };

        let mut config = match fs::read_to_string(&candidate) {
            Ok(contents) => serde_yaml::from_str(&contents)?,
            Err(error) if error.kind() == io::ErrorKind::NotFound && path.is_none() => Config::default(),
            Err(error) => return Err(Error::Read(candidate, error)),
        };

        config.root = root;

        Ok(config)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn apply_timeout(&self) -> Option<Duration> {
        self.apply_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read config file {0:?}: {1}")]
    Read(PathBuf, io::Error),
    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
