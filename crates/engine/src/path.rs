//! Restricted JSONPath engine.
//!
//! A path is `$` followed by zero or more `.<key>` segments naming mapping
//! keys (`$.a.b.c`).  This is the only path dialect the flow language
//! supports: no filters, no wildcards, no array indexing.

use serde_json::{Map, Value};

use crate::error::EngineError;

/// Suffix marking a parameters key whose value is a path reference.
pub const REFERENCE_SUFFIX: &str = ".$";

/// Whether a string has the JSONPath reference shape required of `*_path`
/// fields, `variable`, and `.$`-keyed parameter values.
pub fn is_reference(raw: &str) -> bool {
    raw.starts_with("$.")
}

/// A parsed dotted-path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<String>,
}

impl JsonPath {
    /// Parse a path expression.  Accepts `$` and `$.` as the document root.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let malformed = || EngineError::MalformedPath(raw.to_string());

        let rest = raw.strip_prefix('$').ok_or_else(malformed)?;
        if rest.is_empty() || rest == "." {
            return Ok(Self {
                raw: raw.to_string(),
                segments: Vec::new(),
            });
        }

        let rest = rest.strip_prefix('.').ok_or_else(malformed)?;
        let segments: Vec<String> = rest.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(malformed());
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The expression this path was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Read the value at this path.
    ///
    /// Returns `None` if any intermediate segment is absent or the value
    /// there is not a mapping; a leaf clash never silently drops the rest
    /// of the path.
    pub fn get<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut current = doc;
        for segment in &self.segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Read the value at this path, failing with `PATH_NOT_FOUND` when it
    /// resolves nothing.
    pub fn get_required<'a>(&self, doc: &'a Value) -> Result<&'a Value, EngineError> {
        self.get(doc).ok_or_else(|| EngineError::PathNotFound {
            path: self.raw.clone(),
        })
    }

    /// Write `value` at this path.
    ///
    /// With `create_missing`, absent intermediate mappings are created;
    /// otherwise the write fails with `PATH_NOT_FOUND`.  An intermediate
    /// that exists but is not a mapping fails with `TYPE_ERROR` either way.
    pub fn set(
        &self,
        doc: &mut Value,
        value: Value,
        create_missing: bool,
    ) -> Result<(), EngineError> {
        let Some((leaf, parents)) = self.segments.split_last() else {
            *doc = value;
            return Ok(());
        };

        let mut current = doc;
        for segment in parents {
            let map = match current {
                Value::Object(map) => map,
                _ => {
                    return Err(EngineError::TypeError {
                        message: format!(
                            "cannot write below non-mapping value at segment '{segment}' of '{}'",
                            self.raw
                        ),
                    })
                }
            };
            if !create_missing && !map.contains_key(segment) {
                return Err(EngineError::PathNotFound {
                    path: self.raw.clone(),
                });
            }
            current = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        match current.as_object_mut() {
            Some(map) => {
                map.insert(leaf.clone(), value);
                Ok(())
            }
            None => Err(EngineError::TypeError {
                message: format!(
                    "cannot write '{leaf}' below non-mapping value in '{}'",
                    self.raw
                ),
            }),
        }
    }
}

impl std::fmt::Display for JsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Parameter projection
// ---------------------------------------------------------------------------

/// Build a new object from a `parameters` template against `doc`.
///
/// Keys ending in `.$` are stripped of the suffix and replaced by the value
/// resolved from the document (an unresolved read projects `null`).  Other
/// keys are kept literally; mapping values recurse.
pub fn project(params: &Map<String, Value>, doc: &Value) -> Result<Map<String, Value>, EngineError> {
    let mut out = Map::with_capacity(params.len());
    for (key, value) in params {
        if let Some(stripped) = key.strip_suffix(REFERENCE_SUFFIX) {
            let expr = value.as_str().ok_or_else(|| EngineError::TypeError {
                message: format!("reference key '{key}' requires a string path value"),
            })?;
            let resolved = JsonPath::parse(expr)?
                .get(doc)
                .cloned()
                .unwrap_or(Value::Null);
            out.insert(stripped.to_string(), resolved);
        } else if let Value::Object(nested) = value {
            out.insert(key.clone(), Value::Object(project(nested, doc)?));
        } else {
            out.insert(key.clone(), value.clone());
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Structural recursion over embedded references
// ---------------------------------------------------------------------------

/// Walk a JSON value and report every `.$`-suffixed mapping key whose value
/// is not a JSONPath-shaped string.  Recurses through mappings and
/// sequences; `location` is the JSONPath-like prefix used in reports.
pub fn find_invalid_references(value: &Value, location: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let here = format!("{location}.{key}");
                if key.ends_with(REFERENCE_SUFFIX) {
                    match nested.as_str() {
                        Some(s) if is_reference(s) => {}
                        _ => out.push((
                            here.clone(),
                            format!("value of reference key '{key}' must be a string beginning with '$.'"),
                        )),
                    }
                } else {
                    find_invalid_references(nested, &here, out);
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                find_invalid_references(item, &format!("{location}[{i}]"), out);
            }
        }
        _ => {}
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_root_and_nested_paths() {
        assert!(JsonPath::parse("$").expect("root").is_root());
        assert!(JsonPath::parse("$.").expect("dotted root").is_root());
        let path = JsonPath::parse("$.a.b.c").expect("nested");
        assert!(!path.is_root());
        assert_eq!(path.as_str(), "$.a.b.c");
    }

    #[test]
    fn malformed_paths_are_rejected() {
        for raw in ["", "a.b", "$a", "$..a", "$.a..b", "$.a."] {
            assert!(
                matches!(JsonPath::parse(raw), Err(EngineError::MalformedPath(_))),
                "'{raw}' should be malformed"
            );
        }
    }

    #[test]
    fn get_resolves_nested_value() {
        let doc = json!({ "a": { "b": { "c": 7 } } });
        let path = JsonPath::parse("$.a.b.c").unwrap();
        assert_eq!(path.get(&doc), Some(&json!(7)));
    }

    #[test]
    fn get_missing_returns_none_without_mutating() {
        let doc = json!({ "a": 1 });
        let before = doc.clone();
        assert_eq!(JsonPath::parse("$.a.b").unwrap().get(&doc), None);
        assert_eq!(JsonPath::parse("$.missing").unwrap().get(&doc), None);
        assert_eq!(doc, before);
    }

    #[test]
    fn leaf_clash_fails_the_read() {
        // `$.a` is a number, so `$.a.b` must not resolve.
        let doc = json!({ "a": 1, "b": { "a": 2 } });
        assert_eq!(JsonPath::parse("$.a.b").unwrap().get(&doc), None);
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut doc = json!({});
        let path = JsonPath::parse("$.x.y").unwrap();
        path.set(&mut doc, json!([1, 2]), true).expect("set");
        assert_eq!(path.get(&doc), Some(&json!([1, 2])));
    }

    #[test]
    fn set_without_create_missing_fails() {
        let mut doc = json!({});
        let err = JsonPath::parse("$.x.y")
            .unwrap()
            .set(&mut doc, json!(1), false)
            .expect_err("should fail");
        assert!(matches!(err, EngineError::PathNotFound { .. }));
        assert_eq!(doc, json!({}));
    }

    #[test]
    fn set_below_leaf_is_a_type_error() {
        let mut doc = json!({ "a": 3 });
        let err = JsonPath::parse("$.a.b")
            .unwrap()
            .set(&mut doc, json!(1), true)
            .expect_err("should fail");
        assert!(matches!(err, EngineError::TypeError { .. }));
    }

    #[test]
    fn root_set_replaces_document() {
        let mut doc = json!({ "a": 1 });
        JsonPath::parse("$.").unwrap().set(&mut doc, json!({ "b": 2 }), true).unwrap();
        assert_eq!(doc, json!({ "b": 2 }));
    }

    #[test]
    fn projection_resolves_reference_keys_and_keeps_literals() {
        let doc = json!({ "x": 42, "nested": { "y": "z" } });
        let params = json!({
            "copied.$": "$.x",
            "deep.$": "$.nested.y",
            "literal": "kept",
            "inner": { "also.$": "$.x", "plain": [1, 2] }
        });
        let projected = project(params.as_object().unwrap(), &doc).expect("project");
        assert_eq!(
            Value::Object(projected),
            json!({
                "copied": 42,
                "deep": "z",
                "literal": "kept",
                "inner": { "also": 42, "plain": [1, 2] }
            })
        );
    }

    #[test]
    fn projection_of_unresolved_reference_is_null() {
        let projected = project(
            json!({ "gone.$": "$.missing" }).as_object().unwrap(),
            &json!({}),
        )
        .expect("project");
        assert_eq!(Value::Object(projected), json!({ "gone": null }));
    }

    #[test]
    fn reference_scan_recurses_into_sequences() {
        let value = json!({
            "ok.$": "$.fine",
            "list": [ { "bad.$": "not-a-path" } ],
            "nested": { "worse.$": 5 }
        });
        let mut found = Vec::new();
        find_invalid_references(&value, "$.parameters", &mut found);
        let paths: Vec<&str> = found.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(found.len(), 2);
        assert!(paths.contains(&"$.parameters.list[0].bad.$"));
        assert!(paths.contains(&"$.parameters.nested.worse.$"));
    }
}
