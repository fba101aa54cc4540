// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Manifest store: fetch -> parse -> validate -> derive, cached per
//! (repo url, ref, last_fetched). Advancing `last_fetched` is the
//! contractual invalidation signal.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use log::debug;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::content::normalize_url;
use crate::db::{self, refs};
use crate::request;

pub const MANIFEST_FILE: &str = "manifest.yml";

/// Cache key: any change of last_fetched produces a fresh key
type Key = (String, String, i64);

/// A validated manifest along with everything derived from it
#[derive(Debug)]
pub struct Entry {
    pub manifest: manifest::Manifest,
    pub hierarchy: manifest::Hierarchy,
    pub graph: manifest::Graph,
    pub stats: manifest::Stats,
}

#[derive(Debug, Clone)]
pub struct Meta {
    pub hash: String,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct Response<T> {
    pub data: T,
    pub meta: Meta,
}

pub struct Store {
    db: db::Database,
    cache: Mutex<HashMap<Key, Arc<Entry>>>,
    // one computation in flight per (url, ref); late arrivals find
    // the cache filled
    flights: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl Store {
    pub fn new(db: db::Database) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Full entry lookup, cache respected
    pub async fn get(&self, url: &Url, source_ref: &str) -> Result<Response<Arc<Entry>>, Error> {
        self.lookup(url, source_ref, false).await
    }

    /// Bypass and replace the cached entry
    pub async fn refresh(&self, url: &Url, source_ref: &str) -> Result<Response<Arc<Entry>>, Error> {
        self.lookup(url, source_ref, true).await
    }

    pub async fn get_manifest(&self, url: &Url, source_ref: &str) -> Result<Response<manifest::Manifest>, Error> {
        let response = self.get(url, source_ref).await?;

        Ok(Response {
            data: response.data.manifest.clone(),
            meta: response.meta,
        })
    }

    pub async fn get_hierarchy(&self, url: &Url, source_ref: &str) -> Result<Response<manifest::Hierarchy>, Error> {
        let response = self.get(url, source_ref).await?;

        Ok(Response {
            data: response.data.hierarchy.clone(),
            meta: response.meta,
        })
    }

    pub async fn get_graph(&self, url: &Url, source_ref: &str) -> Result<Response<manifest::Graph>, Error> {
        let response = self.get(url, source_ref).await?;

        Ok(Response {
            data: response.data.graph.clone(),
            meta: response.meta,
        })
    }

    async fn lookup(&self, url: &Url, source_ref: &str, bypass: bool) -> Result<Response<Arc<Entry>>, Error> {
        let normalized = normalize_url(url);

        let (reference, key) = self.key(&normalized, source_ref).await?;

        if !bypass {
            if let Some(entry) = self.cache.lock().await.get(&key) {
                return Ok(Response {
                    meta: Meta {
                        hash: entry.manifest.hash.clone(),
                        from_cache: true,
                    },
                    data: entry.clone(),
                });
            }
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry((normalized.clone(), source_ref.to_owned()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _in_flight = flight.lock().await;

        // coalesced: someone else may have filled the cache while we
        // waited on the flight lock
        if !bypass {
            if let Some(entry) = self.cache.lock().await.get(&key) {
                return Ok(Response {
                    meta: Meta {
                        hash: entry.manifest.hash.clone(),
                        from_cache: true,
                    },
                    data: entry.clone(),
                });
            }
        }

        let entry = Arc::new(self.compute(&normalized, &reference).await?);

        {
            let mut cache = self.cache.lock().await;
            // stale keys of the same (url, ref) are dead weight
            cache.retain(|(u, r, _), _| !(u == &key.0 && r == &key.1));
            cache.insert(key, entry.clone());
        }

        Ok(Response {
            meta: Meta {
                hash: entry.manifest.hash.clone(),
                from_cache: false,
            },
            data: entry,
        })
    }

    async fn key(&self, normalized: &str, source_ref: &str) -> Result<(refs::Ref, Key), Error> {
        let repo = self
            .db
            .repo_by_url(normalized)
            .await?
            .ok_or_else(|| Error::UnknownRepo(normalized.to_owned()))?;

        let reference = self
            .db
            .ref_by_key(repo.id, source_ref)
            .await?
            .ok_or_else(|| Error::UnknownRef {
                url: normalized.to_owned(),
                source_ref: source_ref.to_owned(),
            })?;

        let key = (
            normalized.to_owned(),
            source_ref.to_owned(),
            repo.last_fetched.unwrap_or_default(),
        );

        Ok((reference, key))
    }

    async fn compute(&self, normalized: &str, reference: &refs::Ref) -> Result<Entry, Error> {
        let bytes = self.fetch(normalized, reference).await?;

        let manifest = manifest::from_slice(&bytes)?;

        self.db
            .update_ref(
                reference.id,
                refs::Change {
                    manifest_hash: Some(manifest.hash.clone()),
                    manifest_last_parsed: Some(self.db.clock().stamp()),
                    ..Default::default()
                },
            )
            .await?;

        let hierarchy = manifest::hierarchy(&manifest);
        let graph = manifest::graph(&manifest);
        let stats = manifest::stats(&manifest);

        Ok(Entry {
            manifest,
            hierarchy,
            graph,
            stats,
        })
    }

    /// The worktree copy is authoritative; HTTP raw content is the
    /// fallback when no checkout exists yet
    async fn fetch(&self, normalized: &str, reference: &refs::Ref) -> Result<Vec<u8>, Error> {
        if let Some(worktree) = &reference.worktree_path {
            let path = PathBuf::from(worktree).join(MANIFEST_FILE);

            match tokio::fs::read(&path).await {
                Ok(bytes) if bytes.is_empty() => {
                    return Err(Error::Missing {
                        source_ref: reference.source_ref.clone(),
                    })
                }
                Ok(bytes) => return Ok(bytes),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::Missing {
                        source_ref: reference.source_ref.clone(),
                    })
                }
                Err(error) => return Err(Error::Read(error)),
            }
        }

        debug!("no worktree for {normalized}@{}, fetching manifest over http", reference.source_ref);

        let raw = format!("{normalized}/raw/{}/{MANIFEST_FILE}", reference.source_ref);
        let url = Url::parse(&raw).map_err(|_| Error::Missing {
            source_ref: reference.source_ref.clone(),
        })?;

        let bytes = request::get(url).await.map_err(Error::Fetch)?;

        if bytes.is_empty() {
            return Err(Error::Missing {
                source_ref: reference.source_ref.clone(),
            });
        }

        Ok(bytes)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown repository {0}")]
    UnknownRepo(String),
    #[error("unknown ref {source_ref} for {url}")]
    UnknownRef { url: String, source_ref: String },
    #[error("transport failure fetching manifest: {0}")]
    Fetch(reqwest::Error),
    #[error("no manifest published for ref {source_ref}")]
    Missing { source_ref: String },
    #[error("failed to read manifest: {0}")]
    Read(std::io::Error),
    #[error(transparent)]
    Manifest(#[from] manifest::Error),
    #[error("registry: {0}")]
    Database(#[from] db::Error),
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use crate::db::{repo, Clock, Database};

    use super::*;

    const MANIFEST: &str = r#"
schema_version: "1.0.0"
packs:
  core:
    version: "1.0.0"
    pages: [Home]
"#;

    async fn fixture(last_fetched: i64) -> (Store, TempDir, Url) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(MANIFEST_FILE), MANIFEST).unwrap();

        let db = Database::memory(Clock::system()).await.unwrap();
        let url = Url::parse("https://git.example/content").unwrap();

        let repo = db
            .add_repo("https://git.example/content", "main", "/cache/x.git")
            .await
            .unwrap();
        db.update_repo(
            repo.id,
            repo::Change {
                last_fetched: Some(last_fetched),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.ensure_ref(
            repo.id,
            "main",
            refs::Change {
                worktree_path: Some(tmp.path().to_string_lossy().into_owned()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        (Store::new(db), tmp, url)
    }

    #[tokio::test]
    async fn cache_hit_after_miss() {
        let (store, _tmp, url) = fixture(1_000).await;

        let first = store.get_manifest(&url, "main").await.unwrap();
        assert!(!first.meta.from_cache);

        let second = store.get_manifest(&url, "main").await.unwrap();
        assert!(second.meta.from_cache);
        assert_eq!(first.meta.hash, second.meta.hash);
    }

    #[tokio::test]
    async fn advancing_last_fetched_invalidates() {
        let (store, _tmp, url) = fixture(1_000).await;

        store.get(&url, "main").await.unwrap();

        let repo = store
            .db
            .repo_by_url("https://git.example/content")
            .await
            .unwrap()
            .unwrap();
        store
            .db
            .update_repo(
                repo.id,
                repo::Change {
                    last_fetched: Some(2_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let response = store.get(&url, "main").await.unwrap();
        assert!(!response.meta.from_cache);

        // unchanged content keeps a stable hash across invalidations
        let again = store.get(&url, "main").await.unwrap();
        assert!(again.meta.from_cache);
        assert_eq!(response.meta.hash, again.meta.hash);
    }

    #[tokio::test]
    async fn refresh_bypasses_cache() {
        let (store, _tmp, url) = fixture(1_000).await;

        store.get(&url, "main").await.unwrap();
        let refreshed = store.refresh(&url, "main").await.unwrap();

        assert!(!refreshed.meta.from_cache);
    }

    #[tokio::test]
    async fn missing_manifest_categorized() {
        let (store, tmp, url) = fixture(1_000).await;
        std::fs::remove_file(tmp.path().join(MANIFEST_FILE)).unwrap();

        assert!(matches!(
            store.get(&url, "main").await,
            Err(Error::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn parse_failure_surfaces() {
        let (store, tmp, url) = fixture(1_000).await;
        std::fs::write(tmp.path().join(MANIFEST_FILE), "schema_version: \"9.9.9\"\npacks: {}\n").unwrap();

        assert!(matches!(store.get(&url, "main").await, Err(Error::Manifest(_))));
    }

    #[tokio::test]
    async fn manifest_parse_stamps_ref_row() {
        let (store, _tmp, url) = fixture(1_000).await;

        let response = store.get(&url, "main").await.unwrap();

        let repo = store
            .db
            .repo_by_url("https://git.example/content")
            .await
            .unwrap()
            .unwrap();
        let reference = store.db.ref_by_key(repo.id, "main").await.unwrap().unwrap();

        assert_eq!(reference.manifest_hash.as_deref(), Some(response.meta.hash.as_str()));
        assert!(reference.manifest_last_parsed.is_some());
    }
}
