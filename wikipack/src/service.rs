// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Wires the components together for one running instance. No
//! ambient singletons: everything hangs off this struct and is torn
//! down with it.

use std::{io, sync::Arc};

use thiserror::Error;

use crate::config::Config;
use crate::content;
use crate::db::{self, Clock};
use crate::installation::Installation;
use crate::operation;
use crate::session;
use crate::store::Store;
use crate::wiki;

pub struct Service {
    pub config: Config,
    pub installation: Installation,
    pub db: db::Database,
    pub content: content::Manager,
    pub store: Arc<Store>,
    pub operations: Arc<operation::Runtime>,
    pub engine: session::Engine,
    pub wiki: Arc<dyn wiki::Client>,
}

impl Service {
    pub async fn start(config: Config) -> Result<Arc<Self>, Error> {
        let installation = Installation::open(&config.root)?;
        let db = db::Database::new(installation.db_path(), Clock::system()).await?;

        let content = content::Manager::new(db.clone(), installation.clone(), content::Git);
        content.reconcile().await?;

        let store = Arc::new(Store::new(db.clone()));

        let wiki: Arc<dyn wiki::Client> = match &config.wiki.endpoint {
            Some(endpoint) => Arc::new(wiki::Http::new(endpoint.clone(), config.wiki.token.clone())),
            None => Arc::new(wiki::Memory::new()),
        };

        let operations = operation::Runtime::new(db.clone(), config.workers, config.queue_capacity);

        let engine = session::Engine::new(
            db.clone(),
            store.clone(),
            wiki.clone(),
            operations.clone(),
            config.apply_timeout(),
        );

        Ok(Arc::new(Self {
            config,
            installation,
            db,
            content,
            store,
            operations,
            engine,
            wiki,
        }))
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("installation: {0}")]
    Installation(#[from] io::Error),
    #[error("registry: {0}")]
    Database(#[from] db::Error),
    #[error("content layer: {0}")]
    Content(#[from] content::Error),
}
