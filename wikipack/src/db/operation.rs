// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use derive_more::Display;
use serde::{Deserialize, Serialize};

use super::{Database, Error};

/// What a long-running operation is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    #[display("repo_add")]
    RepoAdd,
    #[display("repo_sync")]
    RepoSync,
    #[display("repo_remove")]
    RepoRemove,
    #[display("pack_install")]
    PackInstall,
    #[display("pack_update")]
    PackUpdate,
    #[display("pack_remove")]
    PackRemove,
    #[display("pack_apply")]
    PackApply,
}

impl Kind {
    fn parse(value: &str) -> Result<Self, Error> {
        Ok(match value {
            "repo_add" => Kind::RepoAdd,
            "repo_sync" => Kind::RepoSync,
            "repo_remove" => Kind::RepoRemove,
            "pack_install" => Kind::PackInstall,
            "pack_update" => Kind::PackUpdate,
            "pack_remove" => Kind::PackRemove,
            "pack_apply" => Kind::PackApply,
            _ => return Err(Error::InvalidColumn(value.to_owned(), "operation.kind")),
        })
    }
}

/// Lifecycle state. Transitions are monotonic:
/// queued -> running -> success | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[display("queued")]
    Queued,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }

    fn parse(value: &str) -> Result<Self, Error> {
        Ok(match value {
            "queued" => Status::Queued,
            "running" => Status::Running,
            "success" => Status::Success,
            "failed" => Status::Failed,
            _ => return Err(Error::InvalidColumn(value.to_owned(), "operation.status")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: String,
    pub kind: Kind,
    pub status: Status,
    pub user_id: String,
    pub message: String,
    pub progress: i64,
    pub result_data: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
}

const COLUMNS: &str = "operation_id, kind, status, user_id, message, progress, result_data, \
                       created_at, updated_at, started_at";

impl Database {
    pub async fn create_operation(
        &self,
        id: &str,
        kind: Kind,
        user_id: &str,
        message: &str,
    ) -> Result<Operation, Error> {
        let now = self.stamp();

        sqlx::query(
            "
            INSERT INTO operation (operation_id, kind, status, user_id, message,
                                   progress, created_at, updated_at)
            VALUES (?, ?, 'queued', ?, ?, 0, ?, ?);
            ",
        )
        .bind(id)
        .bind(kind.to_string())
        .bind(user_id)
        .bind(message)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_operation(id).await
    }

    pub async fn get_operation(&self, id: &str) -> Result<Operation, Error> {
        sqlx::query_as::<_, encoding::Row>(&format!(
            "SELECT {COLUMNS} FROM operation WHERE operation_id = ?;"
        ))
        .bind(id)
        .fetch_one(self.pool())
        .await?
        .try_into()
    }

    /// queued -> running, recording started_at
    pub async fn start_operation(&self, id: &str) -> Result<Operation, Error> {
        let now = self.stamp();

        let result = sqlx::query(
            "
            UPDATE operation
            SET status = 'running', started_at = ?, updated_at = ?
            WHERE operation_id = ? AND status = 'queued';
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id).await);
        }

        self.get_operation(id).await
    }

    /// Progress update; the stored value is clamped to [0, 100] and
    /// status stays running
    pub async fn set_progress(&self, id: &str, progress: i64, message: &str) -> Result<Operation, Error> {
        let result = sqlx::query(
            "
            UPDATE operation
            SET progress = ?, message = ?, updated_at = ?
            WHERE operation_id = ? AND status = 'running';
            ",
        )
        .bind(progress.clamp(0, 100))
        .bind(message)
        .bind(self.stamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id).await);
        }

        self.get_operation(id).await
    }

    pub async fn complete_operation(
        &self,
        id: &str,
        message: &str,
        result_data: Option<&str>,
    ) -> Result<Operation, Error> {
        self.finish_operation(id, Status::Success, message, result_data).await
    }

    pub async fn fail_operation(
        &self,
        id: &str,
        message: &str,
        result_data: Option<&str>,
    ) -> Result<Operation, Error> {
        self.finish_operation(id, Status::Failed, message, result_data).await
    }

    async fn finish_operation(
        &self,
        id: &str,
        status: Status,
        message: &str,
        result_data: Option<&str>,
    ) -> Result<Operation, Error> {
        let progress = if status == Status::Success { 100 } else { -1 };

        let mut query = sqlx::QueryBuilder::new("UPDATE operation SET status = ");
        query.push_bind(status.to_string());
        query.push(", message = ").push_bind(message);
        query.push(", updated_at = ").push_bind(self.stamp());
        if progress >= 0 {
            query.push(", progress = ").push_bind(progress);
        }
        if let Some(data) = result_data {
            query.push(", result_data = ").push_bind(data);
        }
        query
            .push(" WHERE operation_id = ")
            .push_bind(id)
            .push(" AND status IN ('queued', 'running')");

        let result = query.build().execute(self.pool()).await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id).await);
        }

        self.get_operation(id).await
    }

    /// Most recently touched first
    pub async fn list_operations(&self, limit: i64) -> Result<Vec<Operation>, Error> {
        sqlx::query_as::<_, encoding::Row>(&format!(
            "SELECT {COLUMNS} FROM operation ORDER BY updated_at DESC LIMIT ?;"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(Operation::try_from)
        .collect()
    }

    /// Retention sweep. Deletes operations untouched since `cutoff`;
    /// with `only_completed` still-running records are preserved
    /// regardless of age. Returns the number of rows removed.
    pub async fn sweep_operations(&self, cutoff: i64, only_completed: bool) -> Result<u64, Error> {
        let result = if only_completed {
            sqlx::query(
                "DELETE FROM operation WHERE updated_at < ? AND status IN ('success', 'failed');",
            )
            .bind(cutoff)
            .execute(self.pool())
            .await?
        } else {
            sqlx::query("DELETE FROM operation WHERE updated_at < ?;")
                .bind(cutoff)
                .execute(self.pool())
                .await?
        };

        Ok(result.rows_affected())
    }

    /// Distinguish a missing row from an illegal transition
    async fn transition_error(&self, id: &str) -> Error {
        match self.get_operation(id).await {
            Ok(operation) => Error::Conflict(format!(
                "operation {id} is {} and cannot transition",
                operation.status
            )),
            Err(error) => error,
        }
    }
}

mod encoding {
    use sqlx::FromRow;

    use super::{Kind, Operation, Status};
    use crate::db::Error;

    #[derive(FromRow)]
    pub struct Row {
        pub operation_id: String,
        pub kind: String,
        pub status: String,
        pub user_id: String,
        pub message: String,
        pub progress: i64,
        pub result_data: Option<String>,
        pub created_at: i64,
        pub updated_at: i64,
        pub started_at: Option<i64>,
    }

    impl TryFrom<Row> for Operation {
        type Error = Error;

        fn try_from(row: Row) -> Result<Self, Error> {
            Ok(Operation {
                id: row.operation_id,
                kind: Kind::parse(&row.kind)?,
                status: Status::parse(&row.status)?,
                user_id: row.user_id,
                message: row.message,
                progress: row.progress,
                result_data: row.result_data,
                created_at: row.created_at,
                updated_at: row.updated_at,
                started_at: row.started_at,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use crate::db::{Clock, Database};

    use super::*;

    #[tokio::test]
    async fn lifecycle() {
        let db = Database::memory(Clock::system()).await.unwrap();

        let op = db
            .create_operation("op-1", Kind::RepoAdd, "alice", "adding repo")
            .await
            .unwrap();
        assert_eq!(op.status, Status::Queued);
        assert!(op.started_at.is_none());

        let op = db.start_operation("op-1").await.unwrap();
        assert_eq!(op.status, Status::Running);
        assert!(op.started_at.is_some());

        let op = db.set_progress("op-1", 45, "halfway").await.unwrap();
        assert_eq!(op.progress, 45);
        assert_eq!(op.status, Status::Running);

        let op = db
            .complete_operation("op-1", "done", Some(r#"{"files":42}"#))
            .await
            .unwrap();
        assert_eq!(op.status, Status::Success);
        assert_eq!(op.progress, 100);
        assert_eq!(op.result_data.as_deref(), Some(r#"{"files":42}"#));
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let db = Database::memory(Clock::system()).await.unwrap();

        db.create_operation("op-1", Kind::PackApply, "alice", "")
            .await
            .unwrap();
        db.start_operation("op-1").await.unwrap();

        assert_eq!(db.set_progress("op-1", 150, "").await.unwrap().progress, 100);
        assert_eq!(db.set_progress("op-1", -3, "").await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn terminal_states_are_final() {
        let db = Database::memory(Clock::system()).await.unwrap();

        db.create_operation("op-1", Kind::RepoSync, "alice", "")
            .await
            .unwrap();
        db.start_operation("op-1").await.unwrap();
        db.fail_operation("op-1", "upstream went away", None).await.unwrap();

        assert!(matches!(
            db.start_operation("op-1").await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            db.complete_operation("op-1", "late", None).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            db.set_progress("op-1", 10, "").await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn sweep_respects_only_completed() {
        let db = Database::memory(Clock::fixed(
            chrono::DateTime::from_timestamp(1_000, 0).unwrap(),
        ))
        .await
        .unwrap();

        db.create_operation("old-done", Kind::RepoAdd, "alice", "").await.unwrap();
        db.start_operation("old-done").await.unwrap();
        db.complete_operation("old-done", "ok", None).await.unwrap();

        db.create_operation("old-running", Kind::RepoSync, "alice", "").await.unwrap();
        db.start_operation("old-running").await.unwrap();

        let deleted = db.sweep_operations(2_000, true).await.unwrap();
        assert_eq!(deleted, 1);

        assert!(db.get_operation("old-running").await.is_ok());
        assert!(matches!(
            db.get_operation("old-done").await,
            Err(Error::RowNotFound)
        ));
    }
}
