// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{arg, ArgMatches, Command};
use itertools::Itertools;
use thiserror::Error;
use url::Url;

use wikipack::content;
use wikipack::db;
use wikipack::service::Service;

/// Return a command for handling `repo` subcommands
pub fn command() -> Command {
    Command::new("repo")
        .about("Manage content repositories")
        .long_about("Manage the Git repositories whose manifests publish packs")
        .subcommand_required(true)
        .subcommand(
            Command::new("add")
                .about("Mirror a repository and track a ref")
                .arg(arg!(<URI> "repository url").value_parser(clap::value_parser!(Url)))
                .arg(arg!([REF] "ref to track").default_value("main")),
        )
        .subcommand(Command::new("list").about("List tracked repositories"))
        .subcommand(
            Command::new("sync")
                .about("Fetch a repository and fast-forward all its worktrees")
                .arg(arg!(<URI> "repository url").value_parser(clap::value_parser!(Url))),
        )
        .subcommand(
            Command::new("remove")
                .about("Drop a repository, its refs and its mirror")
                .arg(arg!(<URI> "repository url").value_parser(clap::value_parser!(Url))),
        )
}

/// Handle subcommands to `repo`
pub async fn handle(args: &ArgMatches, service: &Service) -> Result<(), super::Error> {
    match args.subcommand() {
        Some(("add", args)) => {
            let url = args.get_one::<Url>("URI").cloned().unwrap();
            let source_ref = args.get_one::<String>("REF").cloned().unwrap();
            add(service, url, source_ref).await
        }
        Some(("list", _)) => list(service).await,
        Some(("sync", args)) => {
            let url = args.get_one::<Url>("URI").cloned().unwrap();
            sync(service, url).await
        }
        Some(("remove", args)) => {
            let url = args.get_one::<Url>("URI").cloned().unwrap();
            remove(service, url).await
        }
        _ => unreachable!(),
    }
    .map_err(super::Error::Repo)
}

async fn add(service: &Service, url: Url, source_ref: String) -> Result<(), Error> {
    let repo = service.content.ensure_bare_repo(&url, &source_ref).await?;
    let reference = service.content.ensure_worktree(&url, &source_ref).await?;

    println!(
        "added {} @ {} ({})",
        repo.url,
        reference.source_ref,
        reference.last_commit.as_deref().unwrap_or("?")
    );

    Ok(())
}

async fn list(service: &Service) -> Result<(), Error> {
    let repos = service.db.list_repos().await?;

    if repos.is_empty() {
        println!("No repositories have been added yet");
        return Ok(());
    }

    let now = service.db.clock().stamp();

    for repo in repos.into_iter().sorted_by(|a, b| a.url.cmp(&b.url)) {
        let refs = service.db.list_refs(repo.id).await?;
        let age = repo
            .last_fetched
            .map(|at| format!("{}m ago", (now - at).max(0) / 60))
            .unwrap_or_else(|| "never".to_owned());

        println!(
            " - {} [{} ref(s), fetched {age}] {}",
            repo.url,
            refs.len(),
            refs.iter().map(|r| r.source_ref.as_str()).join(", ")
        );
    }

    Ok(())
}

async fn sync(service: &Service, url: Url) -> Result<(), Error> {
    let report = service.content.sync_repo(&url).await?;

    println!("synced {} ref(s)", report.synced);

    for (source_ref, failure) in &report.failures {
        println!(" ! {source_ref}: {failure}");
    }

    if !report.failures.is_empty() {
        return Err(Error::SyncIncomplete(report.failures.len()));
    }

    Ok(())
}

async fn remove(service: &Service, url: Url) -> Result<(), Error> {
    service.content.remove_repo(&url).await?;
    println!("removed {url}");

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("content layer: {0}")]
    Content(#[from] content::Error),
    #[error("registry: {0}")]
    Database(#[from] db::Error),
    #[error("{0} ref(s) failed to sync")]
    SyncIncomplete(usize),
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Content(content::Error::Git(_))
            | Error::Content(content::Error::RefVanished { .. })
            | Error::SyncIncomplete(_) => 3,
            Error::Content(content::Error::UnknownRepo(_))
            | Error::Content(content::Error::UnknownRef { .. }) => 4,
            _ => 1,
        }
    }
}
