// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use sqlx::QueryBuilder;

use super::{Database, Error};

/// An installed wiki page owned by a pack. `name` is the manifest
/// declaration; `final_title` is what was written to the wiki after
/// prefix and rename resolution, unique across all packs.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Page {
    pub id: i64,
    pub pack_id: i64,
    pub name: String,
    pub final_title: String,
    pub page_namespace: Option<String>,
    pub wiki_page_id: Option<i64>,
    pub last_rev_id: Option<i64>,
    pub content_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Default, Clone)]
pub struct Change {
    pub final_title: Option<String>,
    pub wiki_page_id: Option<i64>,
    pub last_rev_id: Option<i64>,
    pub content_hash: Option<String>,
}

const COLUMNS: &str = "id, pack_id, name, final_title, page_namespace, wiki_page_id, last_rev_id, \
                       content_hash, created_at, updated_at";

impl Database {
    /// Upsert by (pack_id, name). A final_title held by another pack
    /// is a conflict, which is how cross-pack collisions surface.
    #[allow(clippy::too_many_arguments)]
    pub async fn register_page(
        &self,
        pack_id: i64,
        name: &str,
        final_title: &str,
        page_namespace: Option<&str>,
        wiki_page_id: Option<i64>,
        last_rev_id: Option<i64>,
        content_hash: Option<&str>,
    ) -> Result<Page, Error> {
        let now = self.stamp();

        let page = sqlx::query_as::<_, Page>(
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
                updated_at = excluded.updated_at
            RETURNING id, pack_id, name, final_title, page_namespace, wiki_page_id,
                      last_rev_id, content_hash, created_at, updated_at;
            ",
        )
        .bind(pack_id)
        .bind(name)
        .bind(final_title)
        .bind(page_namespace)
        .bind(wiki_page_id)
        .bind(last_rev_id)
        .bind(content_hash)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(page)
    }

    pub async fn get_page(&self, id: i64) -> Result<Page, Error> {
        let page = sqlx::query_as::<_, Page>(&format!("SELECT {COLUMNS} FROM page WHERE id = ?;"))
            .bind(id)
            .fetch_one(self.pool())
            .await?;

        Ok(page)
    }

    pub async fn page_by_name(&self, pack_id: i64, name: &str) -> Result<Option<Page>, Error> {
        let page = sqlx::query_as::<_, Page>(&format!(
            "SELECT {COLUMNS} FROM page WHERE pack_id = ? AND name = ?;"
        ))
        .bind(pack_id)
        .bind(name)
        .fetch_optional(self.pool())
        .await?;

        Ok(page)
    }

    /// Lookup over the global final_title index
    pub async fn page_by_title(&self, final_title: &str) -> Result<Option<Page>, Error> {
        let page = sqlx::query_as::<_, Page>(&format!(
            "SELECT {COLUMNS} FROM page WHERE final_title = ?;"
        ))
        .bind(final_title)
        .fetch_optional(self.pool())
        .await?;

        Ok(page)
    }

    pub async fn update_page(&self, id: i64, change: Change) -> Result<Page, Error> {
        let mut query = QueryBuilder::new("UPDATE page SET updated_at = ");
        query.push_bind(self.stamp());

        if let Some(final_title) = change.final_title {
            query.push(", final_title = ").push_bind(final_title);
        }
        if let Some(wiki_page_id) = change.wiki_page_id {
            query.push(", wiki_page_id = ").push_bind(wiki_page_id);
        }
        if let Some(last_rev_id) = change.last_rev_id {
            query.push(", last_rev_id = ").push_bind(last_rev_id);
        }
        if let Some(content_hash) = change.content_hash {
            query.push(", content_hash = ").push_bind(content_hash);
        }

        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(self.pool()).await?;

        if result.rows_affected() == 0 {
            return Err(Error::RowNotFound);
        }

        self.get_page(id).await
    }

    pub async fn delete_page(&self, id: i64) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM page WHERE id = ?;")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::RowNotFound);
        }

        Ok(())
    }

    /// Pages of one pack, ordered by name
    pub async fn list_pages(&self, pack_id: i64) -> Result<Vec<Page>, Error> {
        let pages = sqlx::query_as::<_, Page>(&format!(
            "SELECT {COLUMNS} FROM page WHERE pack_id = ? ORDER BY name ASC;"
        ))
        .bind(pack_id)
        .fetch_all(self.pool())
        .await?;

        Ok(pages)
    }

    /// All installed pages under a ref, joined through their packs
    pub async fn list_pages_for_ref(&self, ref_id: i64) -> Result<Vec<Page>, Error> {
        let pages = sqlx::query_as::<_, Page>(
            "
            SELECT p.id, p.pack_id, p.name, p.final_title, p.page_namespace, p.wiki_page_id,
                   p.last_rev_id, p.content_hash, p.created_at, p.updated_at
            FROM page p
            JOIN pack k ON k.id = p.pack_id
            WHERE k.ref_id = ?
            ORDER BY k.name ASC, p.name ASC;
            ",
        )
        .bind(ref_id)
        .fetch_all(self.pool())
        .await?;

        Ok(pages)
    }
}
