// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

use crate::{canonical_hash, Document, Error, Manifest, Pack, SCHEMA_VERSION};

/// Enforce the schema over a raw [`Document`], producing a validated
/// [`Manifest`]. A manifest either validates entirely or is rejected.
pub(crate) fn validate(document: Document) -> Result<Manifest, Error> {
    if document.schema_version != SCHEMA_VERSION {
        return Err(Error::SchemaVersion(document.schema_version));
    }

    let mut packs = BTreeMap::new();

    for (id, decl) in document.packs {
        let version = decl.version.parse().map_err(|source| Error::Version {
            pack: id.clone(),
            version: decl.version.clone(),
            source,
        })?;

        if decl.pages.is_empty() && decl.contains.is_empty() && decl.depends_on.is_empty() {
            return Err(Error::EmptyPack(id));
        }

        packs.insert(
            id.clone(),
            Pack {
                id,
                version,
                description: decl.description,
                depends_on: decl.depends_on,
                contains: decl.contains,
                pages: decl.pages,
            },
        );
    }

    // contains / depends_on must resolve within this manifest
    for pack in packs.values() {
        for reference in pack.contains.iter().chain(pack.depends_on.iter()) {
            if !packs.contains_key(reference) {
                return Err(Error::UnknownReference {
                    pack: pack.id.clone(),
                    reference: reference.clone(),
                });
            }
        }
    }

    reject_cycles(&packs)?;

    let mut manifest = Manifest {
        schema_version: SCHEMA_VERSION.to_owned(),
        packs,
        hash: String::new(),
    };
    manifest.hash = canonical_hash(&manifest);

    Ok(manifest)
}

/// The union of contains and depends_on edges must form a DAG
fn reject_cycles(packs: &BTreeMap<String, Pack>) -> Result<(), Error> {
    let mut graph = dag::Dag::new();

    for id in packs.keys() {
        graph.add_node_or_get_index(id.clone());
    }

    for pack in packs.values() {
        let from = graph.add_node_or_get_index(pack.id.clone());

        for reference in pack.contains.iter().chain(pack.depends_on.iter()) {
            let to = graph.add_node_or_get_index(reference.clone());
            graph.add_edge(from, to);
        }
    }

    graph.toposort().map(|_| ()).map_err(|dag::Cycle(mut members)| {
        members.sort_unstable();
        Error::Cycle(members)
    })
}

#[cfg(test)]
mod test {
    use crate::{from_slice, Error};

    #[test]
    fn schema_version_mismatch() {
        let err = from_slice(b"schema_version: \"2.0.0\"\npacks: {}\n").unwrap_err();
        assert!(err.is_schema_version());
    }

    #[test]
    fn empty_pack_rejected() {
        let err = from_slice(
            br#"
schema_version: "1.0.0"
packs:
  hollow:
    version: "1.0.0"
"#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::EmptyPack(pack) if pack == "hollow"));
    }

    #[test]
    fn dangling_reference_rejected() {
        let err = from_slice(
            br#"
schema_version: "1.0.0"
packs:
  ui:
    version: "1.0.0"
    depends_on: [ghost]
"#,
        )
        .unwrap_err();

        assert!(
            matches!(err, Error::UnknownReference { pack, reference } if pack == "ui" && reference == "ghost")
        );
    }

    #[test]
    fn bad_semver_rejected() {
        let err = from_slice(
            br#"
schema_version: "1.0.0"
packs:
  core:
    version: "one point oh"
    pages: [Home]
"#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Version { pack, .. } if pack == "core"));
    }

    #[test]
    fn cycle_rejected_with_members() {
        let err = from_slice(
            br#"
schema_version: "1.0.0"
packs:
  a:
    version: "1.0.0"
    depends_on: [b]
  b:
    version: "1.0.0"
    contains: [a]
  standalone:
    version: "1.0.0"
    pages: [Home]
"#,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Cycle(members) if members == vec!["a".to_owned(), "b".to_owned()]));
    }
}
