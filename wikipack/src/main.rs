// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::process::ExitCode;

mod cli;

/// Main entry point
#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    match cli::process().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("wikipack: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}
