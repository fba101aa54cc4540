// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde::Deserialize;

use super::state::Action;

/// The closed command set a session accepts. Tagged so the HTTP
/// envelope's `command` field selects the variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Seed (or re-seed) the session from manifest and registries
    Init,
    SetPackAction {
        pack_name: String,
        action: Action,
    },
    SetPackPrefix {
        pack_name: String,
        prefix: String,
    },
    RenamePage {
        pack_name: String,
        page_name: String,
        new_title: String,
    },
    /// Resolve the staged plan and hand it to the orchestrator
    Apply {
        #[serde(default)]
        delete_pages: bool,
    },
    /// Rebuild against the registries, keeping legal staged choices
    Refresh,
    /// Reset to a fresh init
    Clear,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Init => "init",
            Command::SetPackAction { .. } => "set_pack_action",
            Command::SetPackPrefix { .. } => "set_pack_prefix",
            Command::RenamePage { .. } => "rename_page",
            Command::Apply { .. } => "apply",
            Command::Refresh => "refresh",
            Command::Clear => "clear",
        }
    }

    /// init and clear replace client state wholesale instead of
    /// merging a partial diff
    pub fn replaces_state(&self) -> bool {
        matches!(self, Command::Init | Command::Clear)
    }
}
