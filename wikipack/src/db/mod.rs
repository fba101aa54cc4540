// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The five registries (repos, refs, packs, pages, operations) over a
//! single SQLite database. These modules are the sole writers of the
//! persisted tables.

use std::str::FromStr;
use std::{fmt, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use thiserror::Error;

pub mod operation;
pub mod pack;
pub mod page;
pub mod refs;
pub mod repo;

/// Injectable time source. Every row stamp flows through the owning
/// [`Database`]'s clock so tests can pin time.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

impl Clock {
    pub fn system() -> Self {
        Self(Arc::new(Utc::now))
    }

    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self(Arc::new(move || at))
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }

    /// Unix epoch seconds, the representation stored in every table
    pub fn stamp(&self) -> i64 {
        self.now().timestamp()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").finish()
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    clock: Clock,
}

impl Database {
    pub async fn new(path: impl AsRef<Path>, clock: Clock) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Self::migrate(pool, clock).await
    }

    /// In-memory database, used by tests and ephemeral runs. Pinned
    /// to a single connection so all callers observe one database.
    pub async fn memory(clock: Clock) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::migrate(pool, clock).await
    }

    async fn migrate(pool: Pool<Sqlite>, clock: Clock) -> Result<Self, Error> {
        sqlx::migrate!("src/db/migrations").run(&pool).await?;

        Ok(Self { pool, clock })
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub(crate) fn stamp(&self) -> i64 {
        self.clock.stamp()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("row not found")]
    RowNotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("sqlx")]
    Sqlx(#[source] sqlx::Error),
    #[error("sqlx migration")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid enum value {0:?} in column {1}")]
    InvalidColumn(String, &'static str),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Error::RowNotFound,
            sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation => {
                Error::Conflict(db.to_string())
            }
            error => Error::Sqlx(error),
        }
    }
}
