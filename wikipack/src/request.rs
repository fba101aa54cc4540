// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use once_cell::sync::Lazy;
use reqwest::Result;
use url::Url;

/// Shared client for tcp socket reuse and connection limit
static CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::ClientBuilder::new()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("build reqwest client")
});

/// Fetch a resource at the provided [`Url`] in full
pub async fn get(url: Url) -> Result<Vec<u8>> {
    let response = CLIENT.get(url).send().await?.error_for_status()?;

    Ok(response.bytes().await?.to_vec())
}

pub fn client() -> &'static reqwest::Client {
    &CLIENT
}
