// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The client-visible session state: one staged deployment plan per
//! (user, ref).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Staged action for one pack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Unchanged,
    Install,
    Update,
    Remove,
}

impl Action {
    /// Whether the transition is legal for a pack in the given
    /// install state: install requires not-installed, update and
    /// remove require installed
    pub fn allowed(self, installed: bool) -> bool {
        match self {
            Action::Unchanged => true,
            Action::Install => !installed,
            Action::Update | Action::Remove => installed,
        }
    }

    /// Actions that stage page writes and therefore accept prefix
    /// and rename edits
    pub fn writes_pages(self) -> bool {
        matches!(self, Action::Install | Action::Update)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    pub installed: bool,
    pub final_title: String,
    pub original_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackState {
    pub action: Action,
    /// Installed version, null when not installed
    pub current_version: Option<String>,
    /// Manifest version, null for registry rows the manifest no
    /// longer declares
    pub target_version: Option<String>,
    pub installed: bool,
    pub prefix: String,
    pub auto_selected_reason: Option<String>,
    pub pages: BTreeMap<String, PageState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub packs: BTreeMap<String, PackState>,
}

impl State {
    /// Stable hash over the canonical serialization: BTreeMap keys
    /// give sorted-key JSON, so equal states hash equally regardless
    /// of how they were produced
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(self).expect("state serialization");
        hex::encode(Sha256::digest(canonical))
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("state serialization")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> State {
        let mut packs = BTreeMap::new();
        packs.insert(
            "core".to_owned(),
            PackState {
                action: Action::Install,
                current_version: None,
                target_version: Some("1.0.0".to_owned()),
                installed: false,
                prefix: String::new(),
                auto_selected_reason: None,
                pages: BTreeMap::new(),
            },
        );
        State { packs }
    }

    #[test]
    fn hash_is_stable_across_identical_states() {
        assert_eq!(sample().hash(), sample().hash());
    }

    #[test]
    fn hash_changes_with_content() {
        let mut other = sample();
        other.packs.get_mut("core").unwrap().prefix = "Pubs".to_owned();

        assert_ne!(sample().hash(), other.hash());
    }

    #[test]
    fn transition_legality() {
        assert!(Action::Install.allowed(false));
        assert!(!Action::Install.allowed(true));
        assert!(Action::Update.allowed(true));
        assert!(!Action::Update.allowed(false));
        assert!(Action::Remove.allowed(true));
        assert!(!Action::Remove.allowed(false));
        assert!(Action::Unchanged.allowed(true) && Action::Unchanged.allowed(false));
    }
}
