// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use sqlx::QueryBuilder;

use super::{Database, Error};

/// A registered content repository, unique by normalized URL
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Repo {
    pub id: i64,
    pub url: String,
    pub default_ref: String,
    pub bare_path: String,
    pub last_fetched: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update; absent fields are left untouched
#[derive(Debug, Default, Clone)]
pub struct Change {
    pub default_ref: Option<String>,
    pub bare_path: Option<String>,
    pub last_fetched: Option<i64>,
}

const COLUMNS: &str = "id, url, default_ref, bare_path, last_fetched, created_at, updated_at";

impl Database {
    /// Insert a new repo row. A duplicate URL is a conflict.
    pub async fn add_repo(&self, url: &str, default_ref: &str, bare_path: &str) -> Result<Repo, Error> {
        let now = self.stamp();

        let repo = sqlx::query_as::<_, Repo>(
            "
            INSERT INTO content_repo (url, default_ref, bare_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, url, default_ref, bare_path, last_fetched, created_at, updated_at;
            ",
        )
        .bind(url)
        .bind(default_ref)
        .bind(bare_path)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(repo)
    }

    /// Upsert by URL. The existing row keeps its id and created_at;
    /// default_ref and bare_path are refreshed. Idempotent.
    pub async fn ensure_repo(&self, url: &str, default_ref: &str, bare_path: &str) -> Result<Repo, Error> {
        let now = self.stamp();

        let repo = sqlx::query_as::<_, Repo>(
            "
            INSERT INTO content_repo (url, default_ref, bare_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (url) DO UPDATE SET
                default_ref = excluded.default_ref,
                bare_path = excluded.bare_path,
                updated_at = excluded.updated_at
            RETURNING id, url, default_ref, bare_path, last_fetched, created_at, updated_at;
            ",
        )
        .bind(url)
        .bind(default_ref)
        .bind(bare_path)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(repo)
    }

    pub async fn get_repo(&self, id: i64) -> Result<Repo, Error> {
        let repo = sqlx::query_as::<_, Repo>(&format!(
            "SELECT {COLUMNS} FROM content_repo WHERE id = ?;"
        ))
        .bind(id)
        .fetch_one(self.pool())
        .await?;

        Ok(repo)
    }

    /// Natural-key lookup; a miss is not an error
    pub async fn repo_by_url(&self, url: &str) -> Result<Option<Repo>, Error> {
        let repo = sqlx::query_as::<_, Repo>(&format!(
            "SELECT {COLUMNS} FROM content_repo WHERE url = ?;"
        ))
        .bind(url)
        .fetch_optional(self.pool())
        .await?;

        Ok(repo)
    }

    pub async fn update_repo(&self, id: i64, change: Change) -> Result<Repo, Error> {
        let mut query = QueryBuilder::new("UPDATE content_repo SET updated_at = ");
        query.push_bind(self.stamp());

        if let Some(default_ref) = change.default_ref {
            query.push(", default_ref = ").push_bind(default_ref);
        }
        if let Some(bare_path) = change.bare_path {
            query.push(", bare_path = ").push_bind(bare_path);
        }
        if let Some(last_fetched) = change.last_fetched {
            query.push(", last_fetched = ").push_bind(last_fetched);
        }

        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(self.pool()).await?;

        if result.rows_affected() == 0 {
            return Err(Error::RowNotFound);
        }

        self.get_repo(id).await
    }

    /// Delete the repo row; refs cascade
    pub async fn delete_repo(&self, id: i64) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM content_repo WHERE id = ?;")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RowNotFound);
        }

        Ok(())
    }

    pub async fn list_repos(&self) -> Result<Vec<Repo>, Error> {
        let repos = sqlx::query_as::<_, Repo>(&format!(
            "SELECT {COLUMNS} FROM content_repo ORDER BY url ASC;"
        ))
        .fetch_all(self.pool())
        .await?;

        Ok(repos)
    }
}

#[cfg(test)]
mod test {
    use crate::db::{Clock, Database};

    use super::*;

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let db = Database::memory(Clock::system()).await.unwrap();

        let first = db
            .ensure_repo("https://git.example/wiki/content", "main", "/cache/abc.git")
            .await
            .unwrap();
        let second = db
            .ensure_repo("https://git.example/wiki/content", "main", "/cache/abc.git")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(db.list_repos().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn add_duplicate_is_conflict() {
        let db = Database::memory(Clock::system()).await.unwrap();

        db.add_repo("https://git.example/a", "main", "/cache/a.git")
            .await
            .unwrap();
        let err = db
            .add_repo("https://git.example/a", "main", "/cache/a.git")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn update_bumps_updated_at() {
        let early = Clock::fixed(chrono::DateTime::from_timestamp(1_000, 0).unwrap());
        let db = Database::memory(early).await.unwrap();

        let repo = db
            .add_repo("https://git.example/a", "main", "/cache/a.git")
            .await
            .unwrap();
        assert_eq!(repo.updated_at, 1_000);

        // same database, later clock
        let db = Database {
            clock: Clock::fixed(chrono::DateTime::from_timestamp(2_000, 0).unwrap()),
            ..db
        };

        let repo = db
            .update_repo(
                repo.id,
                Change {
                    last_fetched: Some(2_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(repo.last_fetched, Some(2_000));
        assert_eq!(repo.updated_at, 2_000);
        assert_eq!(repo.created_at, 1_000);
    }

    #[tokio::test]
    async fn missing_rows() {
        let db = Database::memory(Clock::system()).await.unwrap();

        assert!(matches!(db.get_repo(42).await, Err(Error::RowNotFound)));
        assert!(db.repo_by_url("https://nowhere.example").await.unwrap().is_none());
        assert!(matches!(db.delete_repo(42).await, Err(Error::RowNotFound)));
    }
}
