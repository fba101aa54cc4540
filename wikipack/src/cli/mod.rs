// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;

use wikipack::config::{self, Config};
use wikipack::service::{self, Service};

mod manifest;
mod op;
mod pack;
mod repo;
mod serve;
mod version;

/// Generate the CLI command structure
fn command() -> Command {
    Command::new("wikipack")
        .about("Content-pack management service for wikis")
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("root")
                .short('D')
                .long("directory")
                .global(true)
                .help("Data directory")
                .action(ArgAction::Set)
                .default_value("/var/lib/wikipack"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .help("Config file (defaults to <root>/config.yaml)")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg_required_else_help(true)
        .subcommand(manifest::command())
        .subcommand(op::command())
        .subcommand(pack::command())
        .subcommand(repo::command())
        .subcommand(serve::command())
        .subcommand(version::command())
}

/// Process all CLI arguments
pub async fn process() -> Result<(), Error> {
    let matches = command().get_matches();

    if matches.get_flag("version") {
        version::print();
        return Ok(());
    }

    let Some((name, args)) = matches.subcommand() else {
        command().print_help().ok();
        return Ok(());
    };

    if name == "version" {
        version::print();
        return Ok(());
    }

    let service = start(&matches).await?;

    match name {
        "manifest" => manifest::handle(args, &service).await,
        "op" => op::handle(args, &service).await,
        "pack" => pack::handle(args, &service).await,
        "repo" => repo::handle(args, &service).await,
        "serve" => serve::handle(args, service).await,
        _ => unreachable!(),
    }
}

async fn start(matches: &ArgMatches) -> Result<std::sync::Arc<Service>, Error> {
    let root = matches.get_one::<String>("root").cloned().unwrap();
    let config_path = matches.get_one::<PathBuf>("config").cloned();

    let config = Config::load(root, config_path.as_deref())?;

    Ok(Service::start(config).await?)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config: {0}")]
    Config(#[from] config::Error),

    #[error("startup: {0}")]
    Startup(#[from] service::Error),

    #[error("error handling manifest: {0}")]
    Manifest(#[from] manifest::Error),

    #[error("error handling op: {0}")]
    Op(#[from] op::Error),

    #[error("error handling pack: {0}")]
    Pack(#[from] pack::Error),

    #[error("error handling repo: {0}")]
    Repo(#[from] repo::Error),

    #[error("error while serving: {0}")]
    Serve(#[from] serve::Error),
}

impl Error {
    /// Process exit code: 2 is taken by argument parsing, 3 means
    /// upstream git/network trouble, 4 a validation failure, 5 a
    /// state-sync mismatch, 6 a full operation queue
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) => 4,
            Error::Startup(_) => 1,
            Error::Manifest(error) => error.exit_code(),
            Error::Op(error) => error.exit_code(),
            Error::Pack(error) => error.exit_code(),
            Error::Repo(error) => error.exit_code(),
            Error::Serve(_) => 1,
        }
    }
}
