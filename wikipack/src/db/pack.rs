// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use derive_more::Display;
use sqlx::QueryBuilder;

use super::{Database, Error};

/// Install status recorded for a pack row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Status {
    #[display("installed")]
    Installed,
    #[display("removed")]
    Removed,
}

impl Status {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "installed" => Ok(Status::Installed),
            "removed" => Ok(Status::Removed),
            _ => Err(Error::InvalidColumn(value.to_owned(), "pack.status")),
        }
    }
}

/// An installed pack: the record of a prior apply, distinct from the
/// declarative pack parsed out of a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pack {
    pub id: i64,
    pub ref_id: i64,
    pub name: String,
    pub version: String,
    pub source_commit: Option<String>,
    pub installed_by: String,
    pub installed_at: i64,
    pub status: Status,
    pub updated_at: i64,
}

/// Everything one pack apply writes, applied atomically by
/// [`Database::record_pack_install`]
#[derive(Debug, Clone)]
pub struct InstallRecord {
    pub name: String,
    pub version: String,
    pub source_commit: Option<String>,
    pub installed_by: String,
    /// Pack names within the same ref
    pub depends_on: Vec<String>,
    pub pages: Vec<PageRecord>,
}

#[derive(Debug, Clone)]
pub struct PageRecord {
    pub name: String,
    pub final_title: String,
    pub page_namespace: Option<String>,
    pub wiki_page_id: Option<i64>,
    pub last_rev_id: Option<i64>,
    pub content_hash: Option<String>,
}

const COLUMNS: &str =
    "id, ref_id, name, version, source_commit, installed_by, installed_at, status, updated_at";

impl Database {
    /// Upsert by (ref_id, name). On re-install the row keeps its id
    /// but version, source_commit and installed_by move to the newest
    /// caller. Idempotent.
    pub async fn register_pack(
        &self,
        ref_id: i64,
        name: &str,
        version: &str,
        source_commit: Option<&str>,
        installed_by: &str,
    ) -> Result<Pack, Error> {
        let now = self.stamp();

        let row = sqlx::query_as::<_, encoding::Row>(
            "
            INSERT INTO pack (ref_id, name, version, source_commit, installed_by,
                              installed_at, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'installed', ?)
            ON CONFLICT (ref_id, name) DO UPDATE SET
                version = excluded.version,
                source_commit = excluded.source_commit,
                installed_by = excluded.installed_by,
                installed_at = excluded.installed_at,
                status = 'installed',
                updated_at = excluded.updated_at
            RETURNING id, ref_id, name, version, source_commit, installed_by,
                      installed_at, status, updated_at;
            ",
        )
        .bind(ref_id)
        .bind(name)
        .bind(version)
        .bind(source_commit)
        .bind(installed_by)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        row.try_into()
    }

    pub async fn get_pack(&self, id: i64) -> Result<Pack, Error> {
        sqlx::query_as::<_, encoding::Row>(&format!("SELECT {COLUMNS} FROM pack WHERE id = ?;"))
            .bind(id)
            .fetch_one(self.pool())
            .await?
            .try_into()
    }

    pub async fn pack_by_name(&self, ref_id: i64, name: &str) -> Result<Option<Pack>, Error> {
        sqlx::query_as::<_, encoding::Row>(&format!(
            "SELECT {COLUMNS} FROM pack WHERE ref_id = ? AND name = ?;"
        ))
        .bind(ref_id)
        .bind(name)
        .fetch_optional(self.pool())
        .await?
        .map(Pack::try_from)
        .transpose()
    }

    /// Installed packs for one ref, ordered by name
    pub async fn list_packs(&self, ref_id: i64) -> Result<Vec<Pack>, Error> {
        sqlx::query_as::<_, encoding::Row>(&format!(
            "SELECT {COLUMNS} FROM pack WHERE ref_id = ? AND status = 'installed' ORDER BY name ASC;"
        ))
        .bind(ref_id)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(Pack::try_from)
        .collect()
    }

    /// Delete the pack row; pages and dependency edges cascade
    pub async fn delete_pack(&self, id: i64) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM pack WHERE id = ?;")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RowNotFound);
        }

        Ok(())
    }

    /// Replace the dependency edge set of a pack. Edges always point
    /// at packs within the same ref.
    pub async fn set_pack_dependencies(&self, pack_id: i64, depends_on: &[i64]) -> Result<(), Error> {
        let mut transaction = self.pool().begin().await?;

        sqlx::query("DELETE FROM pack_dependency WHERE pack_id = ?;")
            .bind(pack_id)
            .execute(&mut *transaction)
            .await?;

        if !depends_on.is_empty() {
            QueryBuilder::new("INSERT INTO pack_dependency (pack_id, depends_on_pack_id) ")
                .push_values(depends_on, |mut b, dep| {
                    b.push_bind(pack_id).push_bind(dep);
                })
                .build()
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;

        Ok(())
    }

    /// Record an install or update as one transaction: pack row,
    /// page rows, dropped pages and dependency edges all land
    /// together or not at all. Dependencies must already have rows in
    /// the same ref (installs are applied in dependency order).
    pub async fn record_pack_install(&self, ref_id: i64, record: InstallRecord) -> Result<Pack, Error> {
        let now = self.stamp();

        let mut transaction = self.pool().begin().await?;

        let row = sqlx::query_as::<_, encoding::Row>(
            "
            INSERT INTO pack (ref_id, name, version, source_commit, installed_by,
                              installed_at, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'installed', ?)
            ON CONFLICT (ref_id, name) DO UPDATE SET
                version = excluded.version,
                source_commit = excluded.source_commit,
                installed_by = excluded.installed_by,
                installed_at = excluded.installed_at,
                status = 'installed',
                updated_at = excluded.updated_at
            RETURNING id, ref_id, name, version, source_commit, installed_by,
                      installed_at, status, updated_at;
            ",
        )
        .bind(ref_id)
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.source_commit)
        .bind(&record.installed_by)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *transaction)
        .await?;

        let pack: Pack = row.try_into()?;

        for page in &record.pages {
            sqlx::query(
                "
                INSERT INTO page (pack_id, name, final_title, page_namespace, wiki_page_id,
                                  last_rev_id, content_hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (pack_id, name) DO UPDATE SET
                    final_title = excluded.final_title,
                    page_namespace = excluded.page_namespace,
                    wiki_page_id = coalesce(excluded.wiki_page_id, page.wiki_page_id),
                    last_rev_id = coalesce(excluded.last_rev_id, page.last_rev_id),
                    content_hash = coalesce(excluded.content_hash, page.content_hash),
                    updated_at = excluded.updated_at;
                ",
            )
            .bind(pack.id)
            .bind(&page.name)
            .bind(&page.final_title)
            .bind(&page.page_namespace)
            .bind(page.wiki_page_id)
            .bind(page.last_rev_id)
            .bind(&page.content_hash)
            .bind(now)
            .bind(now)
            .execute(&mut *transaction)
            .await?;
        }

        // pages the manifest no longer declares
        let mut prune = QueryBuilder::new("DELETE FROM page WHERE pack_id = ");
        prune.push_bind(pack.id);
        if !record.pages.is_empty() {
            prune.push(" AND name NOT IN (");
            let mut separated = prune.separated(", ");
            for page in &record.pages {
                separated.push_bind(&page.name);
            }
            separated.push_unseparated(")");
        }
        prune.build().execute(&mut *transaction).await?;

        sqlx::query("DELETE FROM pack_dependency WHERE pack_id = ?;")
            .bind(pack.id)
            .execute(&mut *transaction)
            .await?;

        for dependency in &record.depends_on {
            let (dep_id,): (i64,) =
                sqlx::query_as("SELECT id FROM pack WHERE ref_id = ? AND name = ?;")
                    .bind(ref_id)
                    .bind(dependency)
                    .fetch_one(&mut *transaction)
                    .await?;

            sqlx::query("INSERT INTO pack_dependency (pack_id, depends_on_pack_id) VALUES (?, ?);")
                .bind(pack.id)
                .bind(dep_id)
                .execute(&mut *transaction)
                .await?;
        }

        transaction.commit().await?;

        Ok(pack)
    }

    /// All dependency edges within a ref, as (pack name, depends-on
    /// name) pairs in deterministic order
    pub async fn pack_dependencies(&self, ref_id: i64) -> Result<Vec<(String, String)>, Error> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "
            SELECT a.name, b.name
            FROM pack_dependency d
            JOIN pack a ON a.id = d.pack_id
            JOIN pack b ON b.id = d.depends_on_pack_id
            WHERE a.ref_id = ?
            ORDER BY a.name ASC, b.name ASC;
            ",
        )
        .bind(ref_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}

mod encoding {
    use sqlx::FromRow;

    use super::{Pack, Status};
    use crate::db::Error;

    #[derive(FromRow)]
    pub struct Row {
        pub id: i64,
        pub ref_id: i64,
        pub name: String,
        pub version: String,
        pub source_commit: Option<String>,
        pub installed_by: String,
        pub installed_at: i64,
        pub status: String,
        pub updated_at: i64,
    }

    impl TryFrom<Row> for Pack {
        type Error = Error;

        fn try_from(row: Row) -> Result<Self, Error> {
            Ok(Pack {
                id: row.id,
                ref_id: row.ref_id,
                name: row.name,
                version: row.version,
                source_commit: row.source_commit,
                installed_by: row.installed_by,
                installed_at: row.installed_at,
                status: Status::parse(&row.status)?,
                updated_at: row.updated_at,
            })
        }
    }
}
