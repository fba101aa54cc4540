// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Wiki page title handling. A title may carry a namespace segment
//! (`Template:Card`); prefixing applies below the namespace.

/// Split a title into its optional namespace and base name
pub fn split(title: &str) -> (Option<&str>, &str) {
    match title.split_once(':') {
        Some((namespace, base)) if !namespace.is_empty() && !base.is_empty() => (Some(namespace), base),
        _ => (None, title),
    }
}

/// Apply a pack prefix, preserving any namespace:
/// `prefixed("Pubs", "Template:Card")` is `Template:Pubs/Card`.
/// An empty prefix leaves the title untouched.
pub fn prefixed(prefix: &str, title: &str) -> String {
    if prefix.is_empty() {
        return title.to_owned();
    }

    match split(title) {
        (Some(namespace), base) => format!("{namespace}:{prefix}/{base}"),
        (None, base) => format!("{prefix}/{base}"),
    }
}

/// Resolve a page's final title from prefix, optional rename and the
/// declared name. The namespace always comes from the declared name.
pub fn resolve(prefix: &str, rename: Option<&str>, original: &str) -> String {
    let (namespace, base) = split(original);
    let base = rename.unwrap_or(base);

    match (namespace, prefix.is_empty()) {
        (Some(namespace), true) => format!("{namespace}:{base}"),
        (Some(namespace), false) => format!("{namespace}:{prefix}/{base}"),
        (None, true) => base.to_owned(),
        (None, false) => format!("{prefix}/{base}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_handles_namespaces() {
        assert_eq!(split("Template:Card"), (Some("Template"), "Card"));
        assert_eq!(split("Home"), (None, "Home"));
        assert_eq!(split(":odd"), (None, ":odd"));
    }

    #[test]
    fn prefix_preserves_namespace() {
        assert_eq!(prefixed("Pubs", "Home"), "Pubs/Home");
        assert_eq!(prefixed("Pubs", "Template:Card"), "Template:Pubs/Card");
        assert_eq!(prefixed("", "Template:Card"), "Template:Card");
    }

    #[test]
    fn resolve_applies_rename_below_namespace() {
        assert_eq!(resolve("Pubs", None, "Home"), "Pubs/Home");
        assert_eq!(resolve("Pubs", Some("Index"), "Home"), "Pubs/Index");
        assert_eq!(resolve("Pubs", Some("Tile"), "Template:Card"), "Template:Pubs/Tile");
        assert_eq!(resolve("", Some("Tile"), "Template:Card"), "Template:Tile");
    }
}
