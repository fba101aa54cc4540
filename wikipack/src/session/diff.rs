// SPDX-FileCopyrightText: Copyright © 2024-2026 Wikipack Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Partial-state diffs exchanged with clients. A diff is a JSON
//! object: present keys changed, absent keys are untouched, and the
//! deletion sentinel removes a key. Scalars replace; nested objects
//! merge recursively.

use serde_json::{Map, Value};

const DELETED_KEY: &str = "__deleted__";

/// Sentinel marking a removed key
pub fn deleted() -> Value {
    let mut marker = Map::new();
    marker.insert(DELETED_KEY.to_owned(), Value::Bool(true));
    Value::Object(marker)
}

fn is_deleted(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.get(DELETED_KEY) == Some(&Value::Bool(true)))
}

/// Compute the partial diff that turns `old` into `new`
pub fn between(old: &Value, new: &Value) -> Value {
    let (Value::Object(old), Value::Object(new)) = (old, new) else {
        return new.clone();
    };

    let mut out = Map::new();

    for (key, new_value) in new {
        match old.get(key) {
            Some(old_value) if old_value == new_value => {}
            Some(old_value) if old_value.is_object() && new_value.is_object() => {
                out.insert(key.clone(), between(old_value, new_value));
            }
            _ => {
                out.insert(key.clone(), new_value.clone());
            }
        }
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            out.insert(key.clone(), deleted());
        }
    }

    Value::Object(out)
}

/// Apply a diff to a base value in place
pub fn merge(base: &mut Value, diff: &Value) {
    let Value::Object(diff) = diff else {
        *base = diff.clone();
        return;
    };

    if !base.is_object() {
        *base = Value::Object(Map::new());
    }

    let target = base.as_object_mut().expect("object base");

    for (key, value) in diff {
        if is_deleted(value) {
            target.remove(key);
        } else if value.is_object() && target.get(key).is_some_and(Value::is_object) {
            merge(target.get_mut(key).expect("present key"), value);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Combine two diffs so that `merge(s, compose(d1, d2))` equals
/// `merge(merge(s, d1), d2)` for non-conflicting diffs. Sentinels are
/// carried as values, not applied.
pub fn compose(first: Value, second: Value) -> Value {
    if !matches!(&first, Value::Object(_)) || !matches!(&second, Value::Object(_)) {
        return second;
    }
    let (Value::Object(mut first), Value::Object(second)) = (first, second) else {
        unreachable!()
    };

    for (key, value) in second {
        let composed = match first.remove(&key) {
            Some(existing)
                if existing.is_object()
                    && value.is_object()
                    && !is_deleted(&existing)
                    && !is_deleted(&value) =>
            {
                compose(existing, value)
            }
            _ => value,
        };

        first.insert(key, composed);
    }

    Value::Object(first)
}
