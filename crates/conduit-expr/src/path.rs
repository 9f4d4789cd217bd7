//! Dotted-path lookup over decoded JSON payloads.
//!
//! Paths only walk through JSON objects. Arrays and scalars are valid
//! results, but a path can never step *into* them, so `a.0` does not select
//! the first element of `a`.

use serde_json::{Map, Value};

use crate::error::PathError;

/// Resolve a dotted path such as `"pull_request.head.ref"` against a payload.
pub fn resolve_dotted<'a>(tree: &'a Map<String, Value>, path: &str) -> Result<&'a Value, PathError> {
  let keys: Vec<&str> = path.split('.').collect();
  resolve(tree, &keys)
}

/// Resolve an ordered list of keys against a JSON object.
///
/// Fails with [`PathError::KeyNotFound`] when a key is absent and with
/// [`PathError::NotAMap`] when a non-terminal key holds anything other than
/// an object.
pub fn resolve<'a>(tree: &'a Map<String, Value>, path: &[&str]) -> Result<&'a Value, PathError> {
  let Some((last, parents)) = path.split_last() else {
    return Err(PathError::EmptyPath);
  };

  let mut current = tree;
  for key in parents {
    match current.get(*key) {
      Some(Value::Object(next)) => current = next,
      Some(_) => return Err(PathError::NotAMap(key.to_string())),
      None => return Err(PathError::KeyNotFound(key.to_string())),
    }
  }

  current
    .get(*last)
    .ok_or_else(|| PathError::KeyNotFound(last.to_string()))
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn payload(value: Value) -> Map<String, Value> {
    match value {
      Value::Object(map) => map,
      other => panic!("fixture is not an object: {other}"),
    }
  }

  #[test]
  fn test_single_key() {
    let tree = payload(json!({ "a": 1, "b": "two" }));
    assert_eq!(resolve_dotted(&tree, "a").unwrap(), &json!(1));
    assert_eq!(resolve_dotted(&tree, "b").unwrap(), &json!("two"));
  }

  #[test]
  fn test_nested_key() {
    let tree = payload(json!({ "a": { "b": { "c": [1, 2] } } }));
    assert_eq!(resolve_dotted(&tree, "a.b.c").unwrap(), &json!([1, 2]));
    assert_eq!(resolve_dotted(&tree, "a.b").unwrap(), &json!({ "c": [1, 2] }));
  }

  #[test]
  fn test_missing_top_level_key() {
    let tree = payload(json!({ "a": 1 }));
    let err = resolve_dotted(&tree, "z").unwrap_err();
    assert_eq!(err, PathError::KeyNotFound("z".to_string()));
    assert_eq!(err.to_string(), "key 'z' not found");
  }

  #[test]
  fn test_missing_nested_key() {
    let tree = payload(json!({ "a": { "b": 1 } }));
    let err = resolve_dotted(&tree, "a.x").unwrap_err();
    assert_eq!(err, PathError::KeyNotFound("x".to_string()));
  }

  #[test]
  fn test_scalar_in_the_middle() {
    let tree = payload(json!({ "a": 1, "b": 2 }));
    let err = resolve_dotted(&tree, "a.b").unwrap_err();
    assert_eq!(err, PathError::NotAMap("a".to_string()));
    assert_eq!(err.to_string(), "key 'a' is not a map");
  }

  #[test]
  fn test_array_in_the_middle() {
    let tree = payload(json!({ "items": [{ "id": 1 }] }));
    let err = resolve_dotted(&tree, "items.0.id").unwrap_err();
    assert_eq!(err, PathError::NotAMap("items".to_string()));
  }

  #[test]
  fn test_deep_non_map_segment() {
    let tree = payload(json!({ "a": { "b": { "c": "leaf" } } }));
    let err = resolve_dotted(&tree, "a.b.c.d.e").unwrap_err();
    assert_eq!(err, PathError::NotAMap("c".to_string()));
  }

  #[test]
  fn test_empty_path() {
    let tree = payload(json!({}));
    assert_eq!(resolve(&tree, &[]).unwrap_err(), PathError::EmptyPath);
  }
}
