// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use clap::{ArgMatches, Command};
use thiserror::Error;

use wikipack::api;
use wikipack::service::Service;

pub fn command() -> Command {
    Command::new("serve").about("Run the HTTP facade until interrupted")
}

pub async fn handle(_args: &ArgMatches, service: Arc<Service>) -> Result<(), super::Error> {
    api::serve(service).await.map_err(|e| super::Error::Serve(Error::Io(e)))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
