// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::{arg, Arg, ArgAction, ArgMatches, Command};
use thiserror::Error;
use url::Url;

use wikipack::service::Service;
use wikipack::session::{self, Action, Outcome};

/// Return a command for handling `pack` subcommands
pub fn command() -> Command {
    let target = |c: Command| {
        c.arg(arg!(<URI> "repository url").value_parser(clap::value_parser!(Url)))
            .arg(arg!(<REF> "tracked ref"))
            .arg(
                Arg::new("user")
                    .long("user")
                    .help("Session owner")
                    .action(ArgAction::Set)
                    .default_value("cli"),
            )
            .arg(
                Arg::new("state-hash")
                    .long("state-hash")
                    .help("Last state hash this client saw")
                    .action(ArgAction::Set),
            )
    };

    Command::new("pack")
        .about("Stage and apply packs for a tracked ref")
        .subcommand_required(true)
        .subcommand(target(Command::new("init").about("Seed (or re-seed) the session")))
        .subcommand(target(
            Command::new("set-action")
                .about("Stage install, update or remove for a pack")
                .arg(arg!(<PACK> "pack name"))
                .arg(arg!(<ACTION> "unchanged | install | update | remove")),
        ))
        .subcommand(target(
            Command::new("set-prefix")
                .about("Prefix every page title of a staged pack")
                .arg(arg!(<PACK> "pack name"))
                .arg(arg!(<PREFIX> "title prefix")),
        ))
        .subcommand(target(
            Command::new("rename")
                .about("Rename a not-yet-installed page")
                .arg(arg!(<PACK> "pack name"))
                .arg(arg!(<PAGE> "declared page name"))
                .arg(arg!(<TITLE> "new base title")),
        ))
        .subcommand(target(
            Command::new("apply")
                .about("Hand the staged plan to the orchestrator")
                .arg(
                    arg!(--"delete-pages" "also delete wiki pages of removed packs")
                        .action(ArgAction::SetTrue),
                ),
        ))
        .subcommand(target(Command::new("refresh").about("Rebuild the session against the registries")))
        .subcommand(target(Command::new("clear").about("Reset the session to a fresh init")))
}

/// Handle subcommands to `pack`
pub async fn handle(args: &ArgMatches, service: &Service) -> Result<(), super::Error> {
    let Some((verb, args)) = args.subcommand() else {
        unreachable!()
    };

    let command = match verb {
        "init" => session::Command::Init,
        "set-action" => session::Command::SetPackAction {
            pack_name: args.get_one::<String>("PACK").cloned().unwrap(),
            action: parse_action(args.get_one::<String>("ACTION").unwrap()).map_err(super::Error::Pack)?,
        },
        "set-prefix" => session::Command::SetPackPrefix {
            pack_name: args.get_one::<String>("PACK").cloned().unwrap(),
            prefix: args.get_one::<String>("PREFIX").cloned().unwrap(),
        },
        "rename" => session::Command::RenamePage {
            pack_name: args.get_one::<String>("PACK").cloned().unwrap(),
            page_name: args.get_one::<String>("PAGE").cloned().unwrap(),
            new_title: args.get_one::<String>("TITLE").cloned().unwrap(),
        },
        "apply" => session::Command::Apply {
            delete_pages: args.get_flag("delete-pages"),
        },
        "refresh" => session::Command::Refresh,
        "clear" => session::Command::Clear,
        _ => unreachable!(),
    };

    let url = args.get_one::<Url>("URI").cloned().unwrap();
    let source_ref = args.get_one::<String>("REF").cloned().unwrap();
    let user = args.get_one::<String>("user").cloned().unwrap();
    let client_hash = args.get_one::<String>("state-hash").cloned();

    run(service, &user, &url, &source_ref, client_hash.as_deref(), command)
        .await
        .map_err(super::Error::Pack)
}

async fn run(
    service: &Service,
    user: &str,
    url: &Url,
    source_ref: &str,
    client_hash: Option<&str>,
    command: session::Command,
) -> Result<(), Error> {
    let outcome = service
        .engine
        .handle(user, url, source_ref, client_hash, command)
        .await?;

    print_outcome(&outcome)?;

    if outcome.differences.is_some() {
        return Err(Error::StateMismatch);
    }

    Ok(())
}

fn print_outcome(outcome: &Outcome) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(&outcome.diff)?);
    println!("# state {}", outcome.state_hash);

    for warning in &outcome.warnings {
        println!("# warning: {warning}");
    }

    if let Some(operation) = &outcome.operation {
        println!("# operation {operation}");
    }

    if let Some(differences) = &outcome.differences {
        println!("# session has moved on; differences:");
        println!("{}", serde_json::to_string_pretty(differences)?);

        if let Some(reconcile) = &outcome.reconcile {
            println!("# replay to reconcile:");
            println!("{}", serde_json::to_string_pretty(&reconcile)?);
        }
    }

    Ok(())
}

fn parse_action(value: &str) -> Result<Action, Error> {
    match value {
        "unchanged" => Ok(Action::Unchanged),
        "install" => Ok(Action::Install),
        "update" => Ok(Action::Update),
        "remove" => Ok(Action::Remove),
        _ => Err(Error::BadAction(value.to_owned())),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown action {0:?}")]
    BadAction(String),
    #[error("client state is stale; sync or reconcile first")]
    StateMismatch,
    #[error(transparent)]
    Session(#[from] session::Error),
    #[error("render: {0}")]
    Render(#[from] serde_json::Error),
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::StateMismatch => 5,
            Error::BadAction(_) => 2,
            Error::Session(session::Error::Operations(wikipack::operation::Error::QueueFull)) => 6,
            Error::Session(session::Error::Store(wikipack::store::Error::Fetch(_))) => 3,
            Error::Session(
                session::Error::IllegalTransition { .. }
                | session::Error::NotStagedForWrite(_)
                | session::Error::PageAlreadyInstalled { .. }
                | session::Error::NotInManifest(_)
                | session::Error::UnknownPack(_)
                | session::Error::UnknownPage { .. },
            ) => 4,
            _ => 1,
        }
    }
}
