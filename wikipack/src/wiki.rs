// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Seam to the embedding host's page storage. The service only needs
//! a narrow surface: existence checks, writes, deletes and a title
//! listing for collision warnings.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::request;

/// Identifiers the host assigns to a written page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Written {
    pub page_id: i64,
    pub rev_id: i64,
}

/// Host page-storage API. Object-safe so callers can hold a
/// `dyn Client` regardless of transport.
pub trait Client: Send + Sync {
    fn exists<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<bool, Error>>;

    fn write<'a>(&'a self, title: &'a str, content: &'a str) -> BoxFuture<'a, Result<Written, Error>>;

    fn delete<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<(), Error>>;

    /// Snapshot of every title currently on the wiki
    fn titles(&self) -> BoxFuture<'_, Result<Vec<String>, Error>>;
}

/// JSON-over-HTTP client against the host wiki endpoint
#[derive(Debug, Clone)]
pub struct Http {
    base: Url,
    token: Option<String>,
}

impl Http {
    pub fn new(base: Url, token: Option<String>) -> Self {
        Self { base, token }
    }

    fn page_url(&self, title: &str) -> Result<Url, Error> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Endpoint(self.base.clone()))?
            .push("pages")
            .push(title);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl Client for Http {
    fn exists<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        async move {
            let url = self.page_url(title)?;
            let response = self.authorized(request::client().head(url)).send().await?;

            Ok(response.status().is_success())
        }
        .boxed()
    }

    fn write<'a>(&'a self, title: &'a str, content: &'a str) -> BoxFuture<'a, Result<Written, Error>> {
        async move {
            let url = self.page_url(title)?;
            let response = self
                .authorized(request::client().put(url))
                .json(&serde_json::json!({ "content": content }))
                .send()
                .await?
                .error_for_status()?;

            Ok(response.json().await?)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            let url = self.page_url(title)?;
            self.authorized(request::client().delete(url))
                .send()
                .await?
                .error_for_status()?;

            Ok(())
        }
        .boxed()
    }

    fn titles(&self) -> BoxFuture<'_, Result<Vec<String>, Error>> {
        async move {
            let mut url = self.base.clone();
            url.path_segments_mut()
                .map_err(|()| Error::Endpoint(self.base.clone()))?
                .push("pages");

            let response = self
                .authorized(request::client().get(url))
                .send()
                .await?
                .error_for_status()?;

            Ok(response.json().await?)
        }
        .boxed()
    }
}

/// In-memory wiki for tests and local dry runs
#[derive(Debug, Default)]
pub struct Memory {
    pages: Mutex<BTreeMap<String, (String, Written)>>,
    next_id: Mutex<i64>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a page as if it existed before the service ever ran
    pub async fn seed(&self, title: &str, content: &str) {
        self.write(title, content).await.expect("memory write");
    }

    pub async fn content(&self, title: &str) -> Option<String> {
        self.pages.lock().await.get(title).map(|(content, _)| content.clone())
    }
}

impl Client for Memory {
    fn exists<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        async move { Ok(self.pages.lock().await.contains_key(title)) }.boxed()
    }

    fn write<'a>(&'a self, title: &'a str, content: &'a str) -> BoxFuture<'a, Result<Written, Error>> {
        async move {
            let mut pages = self.pages.lock().await;
            let mut next = self.next_id.lock().await;
            *next += 1;

            let written = match pages.get(title) {
                Some((_, existing)) => Written {
                    page_id: existing.page_id,
                    rev_id: *next,
                },
                None => Written {
                    page_id: *next,
                    rev_id: *next,
                },
            };

            pages.insert(title.to_owned(), (content.to_owned(), written));

            Ok(written)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            self.pages
                .lock()
                .await
                .remove(title)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(title.to_owned()))
        }
        .boxed()
    }

    fn titles(&self) -> BoxFuture<'_, Result<Vec<String>, Error>> {
        async move { Ok(self.pages.lock().await.keys().cloned().collect()) }.boxed()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("page {0} not found")]
    NotFound(String),
    #[error("wiki endpoint {0} cannot be a base url")]
    Endpoint(Url),
    #[error("wiki transport: {0}")]
    Transport(#[from] reqwest::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip() {
        let wiki = Memory::new();

        let written = wiki.write("Pubs/Home", "hello").await.unwrap();
        assert!(wiki.exists("Pubs/Home").await.unwrap());

        let rewritten = wiki.write("Pubs/Home", "hello again").await.unwrap();
        assert_eq!(written.page_id, rewritten.page_id);
        assert!(rewritten.rev_id > written.rev_id);

        wiki.delete("Pubs/Home").await.unwrap();
        assert!(!wiki.exists("Pubs/Home").await.unwrap());
        assert!(matches!(
            wiki.delete("Pubs/Home").await,
            Err(Error::NotFound(_))
        ));
    }
}
