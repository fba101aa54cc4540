// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Typed model of the `manifest.yml` document published by content
//! repositories, plus validation and pure derivations over it.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use self::derive::{hierarchy, graph, stats, Graph, Hierarchy, Node, Stats};

mod derive;
mod validate;

/// The only schema revision we accept
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Documents above this size are refused before parsing
pub const MAX_DOCUMENT_SIZE: usize = 10 * 1024 * 1024;

/// Maximum nesting depth of the YAML document
pub const MAX_DOCUMENT_DEPTH: usize = 32;

/// A fully parsed and validated manifest
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub schema_version: String,
    pub packs: BTreeMap<String, Pack>,
    /// Stable digest over the canonical serialization. Not part of
    /// the canonical form itself.
    #[serde(skip)]
    pub hash: String,
}

/// A declared bundle of pages
#[derive(Debug, Clone, Serialize)]
pub struct Pack {
    pub id: String,
    pub version: semver::Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub depends_on: Vec<String>,
    pub contains: Vec<String>,
    pub pages: BTreeMap<String, Page>,
}

/// A declared wiki page within a pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// Path of the page body, relative to the worktree root
    pub file: String,
}

impl Manifest {
    pub fn get(&self, id: &str) -> Option<&Pack> {
        self.packs.get(id)
    }
}

/// Parse and validate manifest bytes into a [`Manifest`]
pub fn from_slice(bytes: &[u8]) -> Result<Manifest, Error> {
    if bytes.len() > MAX_DOCUMENT_SIZE {
        return Err(Error::TooLarge(bytes.len()));
    }

    let value: serde_yaml::Value = serde_yaml::from_slice(bytes)?;

    if depth(&value) > MAX_DOCUMENT_DEPTH {
        return Err(Error::TooDeep);
    }

    let document: Document = serde_yaml::from_value(value)?;

    validate::validate(document)
}

/// Stable content digest: sha256 over the canonical (sorted-key)
/// JSON rendering, independent of YAML formatting
pub(crate) fn canonical_hash(manifest: &Manifest) -> String {
    let canonical = serde_json::to_vec(manifest).expect("canonical serialization");
    hex::encode(Sha256::digest(canonical))
}

fn depth(value: &serde_yaml::Value) -> usize {
    match value {
        serde_yaml::Value::Sequence(seq) => 1 + seq.iter().map(depth).max().unwrap_or(0),
        serde_yaml::Value::Mapping(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        _ => 1,
    }
}

/// Raw document shape, prior to validation
#[derive(Debug, Deserialize)]
pub(crate) struct Document {
    pub schema_version: String,
    #[serde(deserialize_with = "packs_map_or_list")]
    pub packs: BTreeMap<String, PackDecl>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PackDecl {
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub contains: Vec<String>,
    #[serde(default, deserialize_with = "pages_map_or_list")]
    pub pages: BTreeMap<String, Page>,
}

/// `packs` is accepted either as a map keyed by pack id or as a list
/// of entries carrying their own `id`
fn packs_map_or_list<'de, D>(deserializer: D) -> Result<BTreeMap<String, PackDecl>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Packs {
        Map(BTreeMap<String, PackDecl>),
        List(Vec<ListEntry>),
    }

    #[derive(Deserialize)]
    struct ListEntry {
        id: String,
        #[serde(flatten)]
        decl: PackDecl,
    }

    Ok(match Packs::deserialize(deserializer)? {
        Packs::Map(map) => map,
        Packs::List(list) => list.into_iter().map(|entry| (entry.id, entry.decl)).collect(),
    })
}

/// `pages` is accepted either as a map of page name to body file or
/// as a bare list of page names, in which case the body file is
/// derived from the name
fn pages_map_or_list<'de, D>(deserializer: D) -> Result<BTreeMap<String, Page>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pages {
        Map(BTreeMap<String, Page>),
        List(Vec<String>),
    }

    Ok(match Pages::deserialize(deserializer)? {
        Pages::Map(map) => map,
        Pages::List(list) => list
            .into_iter()
            .map(|name| {
                let file = format!("pages/{}.wiki", name.replace([':', '/'], "_"));
                (name, Page { file })
            })
            .collect(),
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest is {0} bytes, exceeding the {MAX_DOCUMENT_SIZE} byte cap")]
    TooLarge(usize),
    #[error("document nesting exceeds depth {MAX_DOCUMENT_DEPTH}")]
    TooDeep,
    #[error("yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported schema_version {0:?}, expected {SCHEMA_VERSION:?}")]
    SchemaVersion(String),
    #[error("pack {pack}: invalid version {version:?}: {source}")]
    Version {
        pack: String,
        version: String,
        source: semver::Error,
    },
    #[error("pack {0} declares none of pages, contains or depends_on")]
    EmptyPack(String),
    #[error("pack {pack} references unknown pack {reference}")]
    UnknownReference { pack: String, reference: String },
    #[error("cyclic pack references: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

impl Error {
    /// Whether the failure is a schema-version mismatch as opposed to
    /// a structural one
    pub fn is_schema_version(&self) -> bool {
        matches!(self, Error::SchemaVersion(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_map_form() {
        let manifest = from_slice(
            br#"
schema_version: "1.0.0"
packs:
  core:
    version: "1.0.0"
    description: Base templates
    pages:
      Home: { file: core/Home.wiki }
      "Template:Card": { file: core/Card.wiki }
  ui:
    version: "2.1.0"
    depends_on: [core]
    pages:
      - Dashboard
"#,
        )
        .unwrap();

        assert_eq!(manifest.packs.len(), 2);

        let core = manifest.get("core").unwrap();
        assert_eq!(core.version, semver::Version::new(1, 0, 0));
        assert_eq!(core.pages["Template:Card"].file, "core/Card.wiki");

        // list-form pages derive their body file from the name
        let ui = manifest.get("ui").unwrap();
        assert_eq!(ui.pages["Dashboard"].file, "pages/Dashboard.wiki");
        assert_eq!(ui.depends_on, vec!["core".to_owned()]);
    }

    #[test]
    fn parse_list_form() {
        let manifest = from_slice(
            br#"
schema_version: "1.0.0"
packs:
  - id: core
    version: "1.0.0"
    pages: [Home]
"#,
        )
        .unwrap();

        assert!(manifest.get("core").is_some());
    }

    #[test]
    fn hash_ignores_formatting() {
        let a = from_slice(b"schema_version: \"1.0.0\"\npacks:\n  core: { version: \"1.0.0\", pages: [Home] }\n").unwrap();
        let b = from_slice(
            br#"
schema_version: "1.0.0"
packs:
  core:
    version: "1.0.0"
    pages:
      Home: { file: pages/Home.wiki }
"#,
        )
        .unwrap();

        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn depth_cap_enforced() {
        let mut doc = String::from("schema_version: \"1.0.0\"\npacks: ");
        for _ in 0..40 {
            doc.push_str("[");
        }
        for _ in 0..40 {
            doc.push_str("]");
        }

        assert!(matches!(from_slice(doc.as_bytes()), Err(Error::TooDeep)));
    }

    #[test]
    fn size_cap_enforced() {
        let huge = vec![b'#'; MAX_DOCUMENT_SIZE + 1];
        assert!(matches!(from_slice(&huge), Err(Error::TooLarge(_))));
    }
}
