// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use sqlx::QueryBuilder;

use super::{Database, Error};

/// A tracked ref (branch or tag) of a content repository
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Ref {
    pub id: i64,
    pub repo_id: i64,
    pub source_ref: String,
    pub last_commit: Option<String>,
    pub manifest_hash: Option<String>,
    pub manifest_last_parsed: Option<i64>,
    pub worktree_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Default, Clone)]
pub struct Change {
    pub last_commit: Option<String>,
    pub manifest_hash: Option<String>,
    pub manifest_last_parsed: Option<i64>,
    pub worktree_path: Option<String>,
}

const COLUMNS: &str = "id, repo_id, source_ref, last_commit, manifest_hash, manifest_last_parsed, \
                       worktree_path, created_at, updated_at";

impl Database {
    /// Upsert by (repo_id, source_ref), applying the provided fields.
    /// Idempotent.
    pub async fn ensure_ref(&self, repo_id: i64, source_ref: &str, change: Change) -> Result<Ref, Error> {
        let now = self.stamp();

        let row = sqlx::query_as::<_, Ref>(
            "
            INSERT INTO content_ref (
                repo_id, source_ref, last_commit, manifest_hash, manifest_last_parsed,
                worktree_path, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (repo_id, source_ref) DO UPDATE SET
                last_commit = coalesce(excluded.last_commit, content_ref.last_commit),
                manifest_hash = coalesce(excluded.manifest_hash, content_ref.manifest_hash),
                manifest_last_parsed =
                    coalesce(excluded.manifest_last_parsed, content_ref.manifest_last_parsed),
                worktree_path = coalesce(excluded.worktree_path, content_ref.worktree_path),
                updated_at = excluded.updated_at
            RETURNING id, repo_id, source_ref, last_commit, manifest_hash, manifest_last_parsed,
                      worktree_path, created_at, updated_at;
            ",
        )
        .bind(repo_id)
        .bind(source_ref)
        .bind(change.last_commit)
        .bind(change.manifest_hash)
        .bind(change.manifest_last_parsed)
        .bind(change.worktree_path)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn get_ref(&self, id: i64) -> Result<Ref, Error> {
        let row = sqlx::query_as::<_, Ref>(&format!("SELECT {COLUMNS} FROM content_ref WHERE id = ?;"))
            .bind(id)
            .fetch_one(self.pool())
            .await?;

        Ok(row)
    }

    pub async fn ref_by_key(&self, repo_id: i64, source_ref: &str) -> Result<Option<Ref>, Error> {
        let row = sqlx::query_as::<_, Ref>(&format!(
            "SELECT {COLUMNS} FROM content_ref WHERE repo_id = ? AND source_ref = ?;"
        ))
        .bind(repo_id)
        .bind(source_ref)
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn update_ref(&self, id: i64, change: Change) -> Result<Ref, Error> {
        let mut query = QueryBuilder::new("UPDATE content_ref SET updated_at = ");
        query.push_bind(self.stamp());

        if let Some(last_commit) = change.last_commit {
            query.push(", last_commit = ").push_bind(last_commit);
        }
        if let Some(manifest_hash) = change.manifest_hash {
            query.push(", manifest_hash = ").push_bind(manifest_hash);
        }
        if let Some(manifest_last_parsed) = change.manifest_last_parsed {
            query.push(", manifest_last_parsed = ").push_bind(manifest_last_parsed);
        }
        if let Some(worktree_path) = change.worktree_path {
            query.push(", worktree_path = ").push_bind(worktree_path);
        }

        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(self.pool()).await?;

        if result.rows_affected() == 0 {
            return Err(Error::RowNotFound);
        }

        self.get_ref(id).await
    }

    pub async fn delete_ref(&self, id: i64) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM content_ref WHERE id = ?;")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RowNotFound);
        }

        Ok(())
    }

    /// Refs of one repo, ordered by source_ref ascending
    pub async fn list_refs(&self, repo_id: i64) -> Result<Vec<Ref>, Error> {
        let rows = sqlx::query_as::<_, Ref>(&format!(
            "SELECT {COLUMNS} FROM content_ref WHERE repo_id = ? ORDER BY source_ref ASC;"
        ))
        .bind(repo_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Every tracked ref across all repos, for the startup scan
    pub async fn list_all_refs(&self) -> Result<Vec<Ref>, Error> {
        let rows = sqlx::query_as::<_, Ref>(&format!(
            "SELECT {COLUMNS} FROM content_ref ORDER BY repo_id ASC, source_ref ASC;"
        ))
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod test {
    use crate::db::{Clock, Database};

    use super::*;

    async fn fixture() -> (Database, i64) {
        let db = Database::memory(Clock::system()).await.unwrap();
        let repo = db
            .add_repo("https://git.example/content", "main", "/cache/x.git")
            .await
            .unwrap();
        (db, repo.id)
    }

    #[tokio::test]
    async fn ensure_preserves_fields_across_upserts() {
        let (db, repo_id) = fixture().await;

        let first = db
            .ensure_ref(
                repo_id,
                "main",
                Change {
                    last_commit: Some("abc123".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // a later ensure without last_commit keeps the recorded one
        let second = db
            .ensure_ref(
                repo_id,
                "main",
                Change {
                    worktree_path: Some("/worktrees/x/y".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.last_commit.as_deref(), Some("abc123"));
        assert_eq!(second.worktree_path.as_deref(), Some("/worktrees/x/y"));
    }

    #[tokio::test]
    async fn refs_ordered_by_source_ref() {
        let (db, repo_id) = fixture().await;

        for name in ["release", "develop", "main"] {
            db.ensure_ref(repo_id, name, Change::default()).await.unwrap();
        }

        let names: Vec<_> = db
            .list_refs(repo_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.source_ref)
            .collect();

        assert_eq!(names, vec!["develop", "main", "release"]);
    }

    #[tokio::test]
    async fn removing_repo_cascades_to_refs() {
        let (db, repo_id) = fixture().await;

        let reference = db.ensure_ref(repo_id, "main", Change::default()).await.unwrap();

        db.delete_repo(repo_id).await.unwrap();

        assert!(matches!(db.get_ref(reference.id).await, Err(Error::RowNotFound)));
    }
}
