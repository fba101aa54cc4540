// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use clap::{arg, ArgMatches, Command};
use thiserror::Error;

use wikipack::db::operation::Operation;
use wikipack::service::Service;
use wikipack::{db, operation};

/// Return a command for handling `op` subcommands
pub fn command() -> Command {
    Command::new("op")
        .about("Inspect and wait on operations")
        .subcommand_required(true)
        .subcommand(
            Command::new("list").about("Most recently touched operations").arg(
                arg!([LIMIT] "how many to show")
                    .value_parser(clap::value_parser!(i64))
                    .default_value("20"),
            ),
        )
        .subcommand(Command::new("show").about("One operation snapshot").arg(arg!(<ID> "operation id")))
        .subcommand(
            Command::new("wait")
                .about("Poll an operation until it finishes")
                .arg(arg!(<ID> "operation id"))
                .arg(
                    arg!(--timeout <SECONDS> "give up waiting after this long")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("300"),
                ),
        )
}

/// Handle subcommands to `op`
pub async fn handle(args: &ArgMatches, service: &Service) -> Result<(), super::Error> {
    match args.subcommand() {
        Some(("list", args)) => {
            let limit = *args.get_one::<i64>("LIMIT").unwrap();
            list(service, limit).await
        }
        Some(("show", args)) => {
            let id = args.get_one::<String>("ID").cloned().unwrap();
            show(service, &id).await
        }
        Some(("wait", args)) => {
            let id = args.get_one::<String>("ID").cloned().unwrap();
            let timeout = *args.get_one::<u64>("timeout").unwrap();
            wait(service, &id, Duration::from_secs(timeout)).await
        }
        _ => unreachable!(),
    }
    .map_err(super::Error::Op)
}

async fn list(service: &Service, limit: i64) -> Result<(), Error> {
    let operations = service.db.list_operations(limit).await?;

    if operations.is_empty() {
        println!("No operations recorded");
        return Ok(());
    }

    for operation in operations {
        print_line(&operation);
    }

    Ok(())
}

async fn show(service: &Service, id: &str) -> Result<(), Error> {
    let operation = service.db.get_operation(id).await?;

    print_line(&operation);

    if let Some(data) = &operation.result_data {
        println!("{data}");
    }

    Ok(())
}

async fn wait(service: &Service, id: &str, timeout: Duration) -> Result<(), Error> {
    let finished = service
        .operations
        .poll(id, timeout, Duration::from_millis(500), |operation| {
            println!("{:>3}% {} {}", operation.progress, operation.status, operation.message);
        })
        .await?;

    if let Some(data) = &finished.result_data {
        println!("{data}");
    }

    Ok(())
}

fn print_line(operation: &Operation) {
    println!(
        " - {} {} [{}] {:>3}% {}",
        operation.id, operation.kind, operation.status, operation.progress, operation.message
    );
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("registry: {0}")]
    Database(#[from] db::Error),
    #[error(transparent)]
    Operations(#[from] operation::Error),
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Operations(operation::Error::QueueFull) => 6,
            Error::Database(db::Error::RowNotFound) => 4,
            _ => 1,
        }
    }
}
