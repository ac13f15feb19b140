//! Choice-rule evaluation.
//!
//! A rule is either a data-test (a `variable` path plus exactly one
//! comparator) or a boolean combination (`and`/`or`/`not`) of nested rules.
//! Evaluation returns `Ok(bool)`; a type mismatch or a missing variable
//! (outside `IsPresent`) is an error the Choice dispatcher turns into
//! "rule did not match".

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::error::EngineError;
use crate::models::{ChoiceRule, Comparator, ComparatorCategory};
use crate::path::JsonPath;

/// Nesting bound for boolean expressions; guards against pathological
/// definitions.  The validator enforces the same limit.
pub const MAX_RULE_DEPTH: usize = 32;

/// Evaluate a choice rule against the current document.
pub fn evaluate(rule: &ChoiceRule, doc: &Value) -> Result<bool, EngineError> {
    evaluate_at(rule, doc, 0)
}

fn evaluate_at(rule: &ChoiceRule, doc: &Value, depth: usize) -> Result<bool, EngineError> {
    if depth >= MAX_RULE_DEPTH {
        return Err(EngineError::TypeError {
            message: format!("choice rule nesting exceeds {MAX_RULE_DEPTH} levels"),
        });
    }

    if let Some(sub_rules) = &rule.and {
        for sub in sub_rules {
            if !evaluate_at(sub, doc, depth + 1)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    if let Some(sub_rules) = &rule.or {
        for sub in sub_rules {
            if evaluate_at(sub, doc, depth + 1)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(sub) = &rule.not {
        return Ok(!evaluate_at(sub, doc, depth + 1)?);
    }

    evaluate_data_test(rule, doc)
}

fn evaluate_data_test(rule: &ChoiceRule, doc: &Value) -> Result<bool, EngineError> {
    let variable = rule.variable.as_deref().ok_or_else(|| EngineError::TypeError {
        message: "data-test rule is missing 'variable'".to_string(),
    })?;
    let (comparator, operand) = rule.comparison().ok_or_else(|| EngineError::TypeError {
        message: "data-test rule must carry exactly one comparator".to_string(),
    })?;

    let resolved = JsonPath::parse(variable)?.get(doc);

    // IsPresent is the only comparator that tolerates an unresolved variable.
    if comparator == Comparator::IsPresent {
        let expected = expect_bool(operand, "IsPresent")?;
        return Ok(resolved.is_some() == expected);
    }
    let value = resolved.ok_or_else(|| EngineError::PathNotFound {
        path: variable.to_string(),
    })?;

    // The remaining predicates test the resolved value's type.
    if comparator.is_predicate() {
        let expected = expect_bool(operand, "type predicate")?;
        let holds = match comparator {
            Comparator::IsNull => value.is_null(),
            Comparator::IsNumeric => value.is_number(),
            Comparator::IsString => value.is_string(),
            Comparator::IsBoolean => value.is_boolean(),
            Comparator::IsTimestamp => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            _ => unreachable!("IsPresent handled above"),
        };
        return Ok(holds == expected);
    }

    // `*Path` variants resolve the operand from the document first.
    let operand_owned;
    let operand = if comparator.takes_path_operand() {
        let expr = operand.as_str().ok_or_else(|| EngineError::TypeError {
            message: format!("path comparator operand must be a string, got {operand}"),
        })?;
        operand_owned = JsonPath::parse(expr)?.get_required(doc)?.clone();
        &operand_owned
    } else {
        operand
    };

    if comparator == Comparator::StringMatches {
        let text = expect_str(value, "StringMatches variable")?;
        let pattern = expect_str(operand, "StringMatches operand")?;
        return Ok(glob_match(pattern, text));
    }

    let relation = relation_of(comparator);
    match comparator.category() {
        ComparatorCategory::String => {
            let a = expect_str(value, "string comparison variable")?;
            let b = expect_str(operand, "string comparison operand")?;
            Ok(relation.holds(a.cmp(b)))
        }
        ComparatorCategory::Numeric => {
            let a = expect_number(value, "numeric comparison variable")?;
            let b = expect_number(operand, "numeric comparison operand")?;
            let ord = a.partial_cmp(&b).ok_or_else(|| EngineError::TypeError {
                message: format!("numbers {a} and {b} are not comparable"),
            })?;
            Ok(relation.holds(ord))
        }
        ComparatorCategory::Timestamp => {
            let a = parse_timestamp(expect_str(value, "timestamp variable")?)?;
            let b = parse_timestamp(expect_str(operand, "timestamp operand")?)?;
            Ok(relation.holds(a.cmp(&b)))
        }
        ComparatorCategory::Boolean => {
            let a = expect_bool(value, "boolean comparison variable")?;
            let b = expect_bool(operand, "boolean comparison operand")?;
            Ok(a == b)
        }
        ComparatorCategory::Predicate => unreachable!("predicates handled above"),
    }
}

// ---------------------------------------------------------------------------
// Ordering relations
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Relation {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Relation {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Relation::Eq => ord == Ordering::Equal,
            Relation::Lt => ord == Ordering::Less,
            Relation::Gt => ord == Ordering::Greater,
            Relation::Le => ord != Ordering::Greater,
            Relation::Ge => ord != Ordering::Less,
        }
    }
}

fn relation_of(comparator: Comparator) -> Relation {
    use Comparator::*;
    match comparator {
        StringEquals | StringEqualsPath | NumericEquals | NumericEqualsPath | TimestampEquals
        | TimestampEqualsPath | BooleanEquals | BooleanEqualsPath | StringMatches => Relation::Eq,
        StringLessThan | StringLessThanPath | NumericLessThan | NumericLessThanPath
        | TimestampLessThan | TimestampLessThanPath => Relation::Lt,
        StringGreaterThan | StringGreaterThanPath | NumericGreaterThan | NumericGreaterThanPath
        | TimestampGreaterThan | TimestampGreaterThanPath => Relation::Gt,
        StringLessThanEquals | StringLessThanEqualsPath | NumericLessThanEquals
        | NumericLessThanEqualsPath | TimestampLessThanEquals | TimestampLessThanEqualsPath => {
            Relation::Le
        }
        StringGreaterThanEquals | StringGreaterThanEqualsPath | NumericGreaterThanEquals
        | NumericGreaterThanEqualsPath | TimestampGreaterThanEquals
        | TimestampGreaterThanEqualsPath => Relation::Ge,
        IsNull | IsPresent | IsNumeric | IsString | IsBoolean | IsTimestamp => {
            unreachable!("predicates have no ordering relation")
        }
    }
}

// ---------------------------------------------------------------------------
// Operand coercion
// ---------------------------------------------------------------------------

fn expect_str<'a>(value: &'a Value, context: &str) -> Result<&'a str, EngineError> {
    value.as_str().ok_or_else(|| EngineError::TypeError {
        message: format!("{context} must be a string, got {value}"),
    })
}

fn expect_bool(value: &Value, context: &str) -> Result<bool, EngineError> {
    value.as_bool().ok_or_else(|| EngineError::TypeError {
        message: format!("{context} must be a boolean, got {value}"),
    })
}

fn expect_number(value: &Value, context: &str) -> Result<f64, EngineError> {
    value.as_f64().ok_or_else(|| EngineError::TypeError {
        message: format!("{context} must be a number, got {value}"),
    })
}

/// Parse an ISO-8601 instant; shared with the executor's Wait handling.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, EngineError> {
    DateTime::parse_from_rfc3339(raw).map_err(|e| EngineError::TypeError {
        message: format!("'{raw}' is not an ISO-8601 instant: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Glob matching for StringMatches
// ---------------------------------------------------------------------------

enum Tok {
    Star,
    Char(char),
}

fn glob_tokens(pattern: &str) -> Vec<Tok> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => tokens.push(Tok::Char(chars.next().unwrap_or('\\'))),
            '*' => tokens.push(Tok::Star),
            other => tokens.push(Tok::Char(other)),
        }
    }
    tokens
}

/// Glob-style match with `*` wildcard and `\*` escape.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = glob_tokens(pattern);
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(Tok::Char(c)) if *c == text[t] => {
                p += 1;
                t += 1;
            }
            Some(Tok::Star) => {
                backtrack = Some((p, t));
                p += 1;
            }
            _ => match backtrack {
                // Widen the most recent star by one character and retry.
                Some((star_p, star_t)) => {
                    backtrack = Some((star_p, star_t + 1));
                    p = star_p + 1;
                    t = star_t + 1;
                }
                None => return false,
            },
        }
    }
    while matches!(pattern.get(p), Some(Tok::Star)) {
        p += 1;
    }
    p == pattern.len()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_test(variable: &str, comparator: &str, operand: Value) -> ChoiceRule {
        let mut comparisons = serde_json::Map::new();
        comparisons.insert(comparator.to_string(), operand);
        ChoiceRule {
            variable: Some(variable.to_string()),
            comparisons,
            ..ChoiceRule::default()
        }
    }

    #[test]
    fn numeric_comparators() {
        let doc = json!({ "x": 3 });
        assert!(evaluate(&data_test("$.x", "NumericEquals", json!(3)), &doc).unwrap());
        assert!(evaluate(&data_test("$.x", "NumericLessThan", json!(4)), &doc).unwrap());
        assert!(!evaluate(&data_test("$.x", "NumericGreaterThan", json!(3)), &doc).unwrap());
        assert!(evaluate(&data_test("$.x", "NumericGreaterThanEquals", json!(3)), &doc).unwrap());
    }

    #[test]
    fn string_comparators_and_path_variant() {
        let doc = json!({ "a": "apple", "b": "banana" });
        assert!(evaluate(&data_test("$.a", "StringEquals", json!("apple")), &doc).unwrap());
        assert!(evaluate(&data_test("$.a", "StringLessThan", json!("b")), &doc).unwrap());
        assert!(evaluate(&data_test("$.a", "StringLessThanPath", json!("$.b")), &doc).unwrap());
    }

    #[test]
    fn string_matches_globs() {
        let doc = json!({ "name": "transfer_result.txt", "star": "a*b" });
        assert!(evaluate(&data_test("$.name", "StringMatches", json!("transfer_*.txt")), &doc).unwrap());
        assert!(!evaluate(&data_test("$.name", "StringMatches", json!("upload_*.txt")), &doc).unwrap());
        // Escaped star only matches a literal star.
        assert!(evaluate(&data_test("$.star", "StringMatches", json!("a\\*b")), &doc).unwrap());
        assert!(!evaluate(&data_test("$.name", "StringMatches", json!("transfer\\*.txt")), &doc).unwrap());
        // Multiple wildcards.
        assert!(evaluate(&data_test("$.name", "StringMatches", json!("*result*")), &doc).unwrap());
    }

    #[test]
    fn timestamp_comparators_are_chronological() {
        let doc = json!({
            "earlier": "2024-05-01T00:00:00+00:00",
            "later": "2024-05-01T01:00:00+01:30"
        });
        // "later" is chronologically *before* "earlier" once offsets apply.
        assert!(evaluate(
            &data_test("$.later", "TimestampLessThanPath", json!("$.earlier")),
            &doc
        )
        .unwrap());
        assert!(evaluate(
            &data_test("$.earlier", "TimestampEquals", json!("2024-05-01T02:00:00+02:00")),
            &doc
        )
        .unwrap());
    }

    #[test]
    fn boolean_equals() {
        let doc = json!({ "flag": true, "other": false });
        assert!(evaluate(&data_test("$.flag", "BooleanEquals", json!(true)), &doc).unwrap());
        assert!(!evaluate(&data_test("$.flag", "BooleanEqualsPath", json!("$.other")), &doc).unwrap());
    }

    #[test]
    fn type_predicates() {
        let doc = json!({ "n": 1, "s": "x", "b": false, "nul": null, "ts": "2024-01-01T00:00:00Z" });
        assert!(evaluate(&data_test("$.n", "IsNumeric", json!(true)), &doc).unwrap());
        assert!(evaluate(&data_test("$.s", "IsString", json!(true)), &doc).unwrap());
        assert!(evaluate(&data_test("$.b", "IsBoolean", json!(true)), &doc).unwrap());
        assert!(evaluate(&data_test("$.nul", "IsNull", json!(true)), &doc).unwrap());
        assert!(evaluate(&data_test("$.ts", "IsTimestamp", json!(true)), &doc).unwrap());
        assert!(evaluate(&data_test("$.s", "IsTimestamp", json!(false)), &doc).unwrap());
    }

    #[test]
    fn is_present_tolerates_missing_variable() {
        let doc = json!({ "here": 1 });
        assert!(evaluate(&data_test("$.here", "IsPresent", json!(true)), &doc).unwrap());
        assert!(evaluate(&data_test("$.gone", "IsPresent", json!(false)), &doc).unwrap());
    }

    #[test]
    fn missing_variable_errors_for_other_comparators() {
        let doc = json!({});
        let err = evaluate(&data_test("$.gone", "NumericEquals", json!(1)), &doc).unwrap_err();
        assert!(matches!(err, EngineError::PathNotFound { .. }));
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let doc = json!({ "s": "nan" });
        let err = evaluate(&data_test("$.s", "NumericEquals", json!(1)), &doc).unwrap_err();
        assert!(matches!(err, EngineError::TypeError { .. }));
    }

    #[test]
    fn boolean_combinators_short_circuit() {
        let doc = json!({ "x": 1 });
        let truthy = data_test("$.x", "NumericEquals", json!(1));
        let falsy = data_test("$.x", "NumericEquals", json!(2));
        // The erroring rule sits behind a short-circuit and is never reached.
        let erroring = data_test("$.gone", "NumericEquals", json!(1));

        let and = ChoiceRule {
            and: Some(vec![truthy.clone(), falsy.clone()]),
            ..ChoiceRule::default()
        };
        assert!(!evaluate(&and, &doc).unwrap());

        let or = ChoiceRule {
            or: Some(vec![truthy.clone(), erroring.clone()]),
            ..ChoiceRule::default()
        };
        assert!(evaluate(&or, &doc).unwrap());

        let and_short = ChoiceRule {
            and: Some(vec![falsy.clone(), erroring]),
            ..ChoiceRule::default()
        };
        assert!(!evaluate(&and_short, &doc).unwrap());
    }

    #[test]
    fn double_negation_is_identity() {
        let doc = json!({ "x": 1 });
        for rule in [
            data_test("$.x", "NumericEquals", json!(1)),
            data_test("$.x", "NumericEquals", json!(2)),
        ] {
            let plain = evaluate(&rule, &doc).unwrap();
            let doubled = ChoiceRule {
                not: Some(Box::new(ChoiceRule {
                    not: Some(Box::new(rule)),
                    ..ChoiceRule::default()
                })),
                ..ChoiceRule::default()
            };
            assert_eq!(evaluate(&doubled, &doc).unwrap(), plain);
        }
    }

    #[test]
    fn depth_bound_is_enforced() {
        let mut rule = data_test("$.x", "NumericEquals", json!(1));
        for _ in 0..MAX_RULE_DEPTH {
            rule = ChoiceRule {
                not: Some(Box::new(rule)),
                ..ChoiceRule::default()
            };
        }
        let err = evaluate(&rule, &json!({ "x": 1 })).unwrap_err();
        assert!(matches!(err, EngineError::TypeError { .. }));
    }
}
