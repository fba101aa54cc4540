// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{arg, ArgAction, ArgMatches, Command};
use thiserror::Error;
use url::Url;

use wikipack::service::Service;
use wikipack::store;

/// Return a command for handling `manifest` subcommands
pub fn command() -> Command {
    let target = |c: Command| {
        c.arg(arg!(<URI> "repository url").value_parser(clap::value_parser!(Url)))
            .arg(arg!(<REF> "tracked ref"))
            .arg(
                arg!(--refresh "bypass the manifest cache")
                    .short('r')
                    .action(ArgAction::SetTrue),
            )
    };

    Command::new("manifest")
        .about("Inspect the manifest published by a tracked ref")
        .subcommand_required(true)
        .subcommand(target(Command::new("show").about("Validated manifest and stats")))
        .subcommand(target(Command::new("hierarchy").about("Pack containment forest")))
        .subcommand(target(Command::new("graph").about("Contains and depends edge sets")))
}

/// Handle subcommands to `manifest`
pub async fn handle(args: &ArgMatches, service: &Service) -> Result<(), super::Error> {
    let Some((verb, args)) = args.subcommand() else {
        unreachable!()
    };

    let url = args.get_one::<Url>("URI").cloned().unwrap();
    let source_ref = args.get_one::<String>("REF").cloned().unwrap();
    let refresh = args.get_flag("refresh");

    show(service, verb, &url, &source_ref, refresh)
        .await
        .map_err(super::Error::Manifest)
}

async fn show(service: &Service, verb: &str, url: &Url, source_ref: &str, refresh: bool) -> Result<(), Error> {
    let response = if refresh {
        service.store.refresh(url, source_ref).await?
    } else {
        service.store.get(url, source_ref).await?
    };

    let entry = &response.data;

    let body = match verb {
        "show" => serde_json::json!({
            "manifest": entry.manifest,
            "stats": entry.stats,
        }),
        "hierarchy" => serde_json::to_value(&entry.hierarchy)?,
        "graph" => serde_json::to_value(&entry.graph)?,
        _ => unreachable!(),
    };

    println!("{}", serde_json::to_string_pretty(&body)?);
    println!(
        "# hash {} ({})",
        response.meta.hash,
        if response.meta.from_cache { "cached" } else { "fresh" }
    );

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error("render: {0}")]
    Render(#[from] serde_json::Error),
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Store(store::Error::Fetch(_)) => 3,
            Error::Store(store::Error::Manifest(_)) | Error::Store(store::Error::Missing { .. }) => 4,
            Error::Store(store::Error::UnknownRepo(_)) | Error::Store(store::Error::UnknownRef { .. }) => 4,
            _ => 1,
        }
    }
}
