//! Key-path navigation over nested JSON mappings.
//!
//! A key path is an ordered list of non-empty string segments addressing a
//! node inside a document (`serde_json::Map<String, Value>`). The empty path
//! denotes the root mapping and is never addressable through these helpers.
//!
//! `serde_json::Value` owns its whole tree, so `Value::clone()` is a deep
//! copy; callers that need isolation clone at the boundary.

use serde_json::{Map, Value};

use crate::error::{MapDbError, Result};

fn joined(keys: &[String]) -> String {
    keys.join(".")
}

/// Returns a reference to the value at `keys`.
///
/// Fails with `KeyNotFound` when any segment is missing and with
/// `PathNotMap` when an intermediate node is not a mapping; the leftmost
/// failing segment wins.
pub fn get_value_at_path<'a>(data: &'a Map<String, Value>, keys: &[String]) -> Result<&'a Value> {
    if keys.is_empty() {
        return Err(MapDbError::RootNotAddressable);
    }
    let mut current = data;
    for (i, key) in keys[..keys.len() - 1].iter().enumerate() {
        match current.get(key) {
            Some(Value::Object(map)) => current = map,
            Some(_) => {
                return Err(MapDbError::PathNotMap {
                    path: joined(&keys[..=i]),
                });
            }
            None => {
                return Err(MapDbError::KeyNotFound {
                    key: key.clone(),
                    path: joined(&keys[..i]),
                });
            }
        }
    }
    let last = &keys[keys.len() - 1];
    current.get(last).ok_or_else(|| MapDbError::KeyNotFound {
        key: last.clone(),
        path: joined(&keys[..keys.len() - 1]),
    })
}

/// Writes `value` at `keys`, creating missing intermediate mappings.
///
/// Fails with `EmptySegment` when navigation stalls on an empty segment and
/// with `PathNotMap` when an existing intermediate node is not a mapping;
/// the failures compete on position, so the leftmost one wins.
pub fn set_value_at_path(
    data: &mut Map<String, Value>,
    keys: &[String],
    value: Value,
) -> Result<()> {
    if keys.is_empty() {
        return Err(MapDbError::RootNotAddressable);
    }
    let parent = match parent_map_mut(data, keys, true)? {
        Some(parent) => parent,
        // Unreachable with create_missing, but keep the contract explicit.
        None => {
            return Err(MapDbError::KeyNotFound {
                key: keys[keys.len() - 1].clone(),
                path: joined(&keys[..keys.len() - 1]),
            });
        }
    };
    let last = &keys[keys.len() - 1];
    if last.is_empty() {
        return Err(MapDbError::EmptySegment {
            path: joined(keys),
        });
    }
    parent.insert(last.clone(), value);
    Ok(())
}

/// Removes the terminal key of `keys`, returning the removed value.
///
/// A missing path is a no-op and returns `Ok(None)`; this includes paths
/// with empty segments, which can never exist. Fails with `PathNotMap` when
/// an intermediate node is not a mapping.
pub fn delete_value_at_path(
    data: &mut Map<String, Value>,
    keys: &[String],
) -> Result<Option<Value>> {
    if keys.is_empty() {
        return Err(MapDbError::RootNotAddressable);
    }
    match parent_map_mut(data, keys, false)? {
        None => Ok(None),
        Some(parent) => Ok(parent.remove(&keys[keys.len() - 1])),
    }
}

/// Descends to the mapping that owns the terminal key of `keys`.
///
/// With `create_missing`, absent intermediate mappings are created on the
/// way down, except that an absent *empty* segment is `EmptySegment`
/// (nothing can ever exist under it); without `create_missing`, an absent
/// segment yields `Ok(None)`.
fn parent_map_mut<'a>(
    data: &'a mut Map<String, Value>,
    keys: &[String],
    create_missing: bool,
) -> Result<Option<&'a mut Map<String, Value>>> {
    let mut current = data;
    for (i, key) in keys[..keys.len() - 1].iter().enumerate() {
        current = if create_missing {
            if key.is_empty() && !current.contains_key(key) {
                return Err(MapDbError::EmptySegment {
                    path: joined(&keys[..=i]),
                });
            }
            match current
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()))
            {
                Value::Object(map) => map,
                _ => {
                    return Err(MapDbError::PathNotMap {
                        path: joined(&keys[..=i]),
                    });
                }
            }
        } else {
            match current.get_mut(key) {
                None => return Ok(None),
                Some(Value::Object(map)) => map,
                Some(_) => {
                    return Err(MapDbError::PathNotMap {
                        path: joined(&keys[..=i]),
                    });
                }
            }
        };
    }
    Ok(Some(current))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn keys(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    fn doc() -> Map<String, Value> {
        let Value::Object(map) = json!({
            "a": {"b": {"c": 1}},
            "scalar": "leaf",
            "list": [1, 2, 3],
        }) else {
            panic!("doc literal must be an object");
        };
        map
    }

    #[test]
    fn get_nested_value() {
        let data = doc();
        let val = get_value_at_path(&data, &keys(&["a", "b", "c"])).expect("get");
        assert_eq!(val, &json!(1));
    }

    #[test]
    fn get_missing_key_reports_leftmost() {
        let data = doc();
        let err = get_value_at_path(&data, &keys(&["a", "x", "c"])).expect_err("missing");
        match err {
            MapDbError::KeyNotFound { key, path } => {
                assert_eq!(key, "x");
                assert_eq!(path, "a");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn get_through_scalar_is_path_not_map() {
        let data = doc();
        let err = get_value_at_path(&data, &keys(&["scalar", "x"])).expect_err("not a map");
        match err {
            MapDbError::PathNotMap { path } => assert_eq!(path, "scalar"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_path_is_root_error() {
        let mut data = doc();
        assert!(matches!(
            get_value_at_path(&data, &[]),
            Err(MapDbError::RootNotAddressable)
        ));
        assert!(matches!(
            set_value_at_path(&mut data, &[], json!(1)),
            Err(MapDbError::RootNotAddressable)
        ));
        assert!(matches!(
            delete_value_at_path(&mut data, &[]),
            Err(MapDbError::RootNotAddressable)
        ));
    }

    #[test]
    fn set_creates_intermediates() {
        let mut data = Map::new();
        set_value_at_path(&mut data, &keys(&["x", "y", "z"]), json!(true)).expect("set");
        assert_eq!(
            get_value_at_path(&data, &keys(&["x", "y", "z"])).expect("get"),
            &json!(true)
        );
    }

    #[test]
    fn set_rejects_empty_segment() {
        let mut data = doc();
        let err = set_value_at_path(&mut data, &keys(&["a", "", "c"]), json!(1))
            .expect_err("empty segment");
        match err {
            MapDbError::EmptySegment { path } => assert_eq!(path, "a."),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn set_through_scalar_is_path_not_map() {
        let mut data = doc();
        let err =
            set_value_at_path(&mut data, &keys(&["scalar", "x"]), json!(1)).expect_err("scalar");
        assert!(matches!(err, MapDbError::PathNotMap { .. }));
    }

    #[test]
    fn set_reports_leftmost_failure_over_later_empty_segment() {
        // The non-map node at "scalar" stalls navigation before the empty
        // segment behind it is ever reached.
        let mut data = doc();
        let err = set_value_at_path(&mut data, &keys(&["scalar", "", "c"]), json!(1))
            .expect_err("scalar first");
        match err {
            MapDbError::PathNotMap { path } => assert_eq!(path, "scalar"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn set_rejects_empty_terminal_segment() {
        let mut data = doc();
        let err =
            set_value_at_path(&mut data, &keys(&["a", ""]), json!(1)).expect_err("empty last");
        match err {
            MapDbError::EmptySegment { path } => assert_eq!(path, "a."),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn delete_is_idempotent() {
        let mut data = doc();
        let removed = delete_value_at_path(&mut data, &keys(&["a", "b", "c"])).expect("first");
        assert_eq!(removed, Some(json!(1)));
        let removed = delete_value_at_path(&mut data, &keys(&["a", "b", "c"])).expect("second");
        assert_eq!(removed, None);
    }

    #[test]
    fn delete_missing_path_is_noop() {
        let mut data = doc();
        let before = data.clone();
        assert_eq!(
            delete_value_at_path(&mut data, &keys(&["no", "such", "path"])).expect("noop"),
            None
        );
        assert_eq!(data, before);
    }

    #[test]
    fn delete_tolerates_empty_segment() {
        let mut data = doc();
        assert_eq!(
            delete_value_at_path(&mut data, &keys(&["a", "", "c"])).expect("noop"),
            None
        );
    }

    #[test]
    fn delete_through_scalar_is_path_not_map() {
        let mut data = doc();
        let err = delete_value_at_path(&mut data, &keys(&["scalar", "x"])).expect_err("scalar");
        assert!(matches!(err, MapDbError::PathNotMap { .. }));
    }
}
