//! Flow-definition parsing and validation.
//!
//! Validation runs in passes over the raw document and accumulates every
//! defect it finds; a linting CLI reports the whole list at once.
//!
//! Passes:
//! 1. Top-level shape (`start_at`, `comment`, `states`; nothing else).
//! 2. Per-state: attribute tables, serde parse into the tagged model,
//!    structural rules for each variant.
//! 3. Cross-state: every transition target defined, every defined state
//!    reachable from `start_at`.
//!
//! On success the definition is frozen into an immutable [`Flow`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::DateTime;
use serde_json::{Map, Value};

use crate::choice::MAX_RULE_DEPTH;
use crate::error::ValidationError;
use crate::models::{
    ActionState, ChoiceRule, ChoiceState, Comparator, ComparatorCategory, ExpressionEvalState,
    FlowDefinition, PassState, State, WaitState,
};
use crate::path::{self, JsonPath};

/// State names are 1..=128 characters.
pub const MAX_STATE_NAME_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Flow — the validated definition
// ---------------------------------------------------------------------------

/// A flow definition that has passed validation.  Immutable from here on;
/// runs share it by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    definition: FlowDefinition,
}

impl Flow {
    /// Parse and validate a JSON definition.
    pub fn from_json_str(source: &str) -> Result<Self, Vec<ValidationError>> {
        let raw: Value = serde_json::from_str(source)
            .map_err(|e| vec![ValidationError::schema("$", format!("invalid JSON: {e}"))])?;
        Self::from_value(&raw)
    }

    /// Parse and validate a YAML definition.
    pub fn from_yaml_str(source: &str) -> Result<Self, Vec<ValidationError>> {
        let raw: Value = serde_yaml::from_str(source)
            .map_err(|e| vec![ValidationError::schema("$", format!("invalid YAML: {e}"))])?;
        Self::from_value(&raw)
    }

    /// Validate an already-parsed definition document.
    pub fn from_value(raw: &Value) -> Result<Self, Vec<ValidationError>> {
        validate(raw)
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn start_at(&self) -> &str {
        &self.definition.start_at
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.definition.states.get(name)
    }

    /// Serialize back to a definition document.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(&self.definition)
    }
}

// ---------------------------------------------------------------------------
// Pass 1: top-level shape
// ---------------------------------------------------------------------------

fn validate(raw: &Value) -> Result<Flow, Vec<ValidationError>> {
    let mut errors = Vec::new();

    let Some(top) = raw.as_object() else {
        return Err(vec![ValidationError::schema(
            "$",
            "flow definition must be a mapping",
        )]);
    };

    for key in top.keys() {
        if !matches!(key.as_str(), "start_at" | "comment" | "states") {
            errors.push(ValidationError::schema(
                format!("$.{key}"),
                format!("unknown attribute '{key}'"),
            ));
        }
    }

    let start_at = match top.get("start_at") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(ValidationError::schema("$.start_at", "must be a string"));
            None
        }
        None => {
            errors.push(ValidationError::schema("$", "missing 'start_at'"));
            None
        }
    };

    let comment = match top.get("comment") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            errors.push(ValidationError::schema("$.comment", "must be a string"));
            None
        }
        None => None,
    };

    let states_raw = match top.get("states") {
        Some(Value::Object(map)) if map.is_empty() => {
            errors.push(ValidationError::schema("$.states", "must not be empty"));
            None
        }
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            errors.push(ValidationError::schema("$.states", "must be a mapping"));
            None
        }
        None => {
            errors.push(ValidationError::schema("$", "missing 'states'"));
            None
        }
    };

    // ------------------------------------------------------------------
    // Pass 2: each state in isolation.
    // ------------------------------------------------------------------
    let mut states: BTreeMap<String, State> = BTreeMap::new();
    let mut all_parsed = true;

    if let Some(map) = states_raw {
        for (name, value) in map {
            let state_path = format!("$.states.{name}");
            let name_len = name.chars().count();
            if name_len == 0 || name_len > MAX_STATE_NAME_LEN {
                errors.push(ValidationError::schema(
                    &state_path,
                    format!("state names must be 1-{MAX_STATE_NAME_LEN} characters"),
                ));
            }

            match parse_state(value, &state_path, &mut errors) {
                Some(state) => {
                    check_state(&state, &state_path, &mut errors);
                    states.insert(name.clone(), state);
                }
                None => all_parsed = false,
            }
        }
    }

    // ------------------------------------------------------------------
    // Pass 3: cross-state referential integrity.
    // ------------------------------------------------------------------
    if let Some(map) = states_raw {
        let defined: BTreeSet<&str> = map.keys().map(String::as_str).collect();
        check_references(start_at.as_deref(), &defined, &states, all_parsed, &mut errors);
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    // Both unwraps guarded by the error accumulation above.
    let (Some(start_at), false) = (start_at, states.is_empty()) else {
        return Err(vec![ValidationError::schema("$", "definition is incomplete")]);
    };

    Ok(Flow {
        definition: FlowDefinition {
            start_at,
            comment,
            states,
        },
    })
}

// ---------------------------------------------------------------------------
// Per-state parsing
// ---------------------------------------------------------------------------

/// Attribute table per state type; `None` for unknown tags.
fn allowed_keys(tag: &str) -> Option<&'static [&'static str]> {
    Some(match tag {
        "Pass" => &[
            "type", "comment", "parameters", "input_path", "result", "result_path", "next", "end",
        ],
        "Wait" => &[
            "type",
            "comment",
            "seconds",
            "timestamp",
            "seconds_path",
            "timestamp_path",
            "input_path",
            "output_path",
            "next",
            "end",
        ],
        "Action" => &[
            "type",
            "comment",
            "action_url",
            "action_scope",
            "parameters",
            "input_path",
            "result_path",
            "run_as",
            "exception_on_action_failure",
            "catch",
            "wait_time",
            "next",
            "end",
        ],
        "Choice" => &["type", "comment", "choices", "default"],
        "ExpressionEval" => &["type", "comment", "parameters", "result_path", "next", "end"],
        "Fail" => &["type", "comment", "cause", "error"],
        _ => return None,
    })
}

fn parse_state(value: &Value, state_path: &str, errors: &mut Vec<ValidationError>) -> Option<State> {
    let Some(map) = value.as_object() else {
        errors.push(ValidationError::schema(state_path, "state must be a mapping"));
        return None;
    };

    let tag = match map.get("type") {
        Some(Value::String(tag)) => tag.as_str(),
        Some(_) => {
            errors.push(ValidationError::schema(
                format!("{state_path}.type"),
                "must be a string",
            ));
            return None;
        }
        None => {
            errors.push(ValidationError::schema(state_path, "missing 'type'"));
            return None;
        }
    };

    let Some(allowed) = allowed_keys(tag) else {
        errors.push(ValidationError::schema(
            format!("{state_path}.type"),
            format!("unknown state type '{tag}'"),
        ));
        return None;
    };

    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            errors.push(ValidationError::schema(
                format!("{state_path}.{key}"),
                format!("unknown attribute '{key}' for {tag} states"),
            ));
        }
    }

    // Catchers are the one nested mapping serde would silently accept extra
    // keys on; choice rules funnel extras into the flattened comparator map.
    if let Some(Value::Array(entries)) = map.get("catch") {
        for (i, entry) in entries.iter().enumerate() {
            let Some(catch_map) = entry.as_object() else {
                continue;
            };
            for key in catch_map.keys() {
                if !matches!(key.as_str(), "error_equals" | "next" | "result_path") {
                    errors.push(ValidationError::schema(
                        format!("{state_path}.catch[{i}].{key}"),
                        format!("unknown attribute '{key}' for catchers"),
                    ));
                }
            }
        }
    }

    // Unknown attributes were reported above; serde ignores them, so a
    // state that parses is still usable for the later passes.
    match serde_json::from_value::<State>(value.clone()) {
        Ok(state) => Some(state),
        Err(e) => {
            errors.push(ValidationError::schema(state_path, e.to_string()));
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Per-state structural checks
// ---------------------------------------------------------------------------

fn check_state(state: &State, state_path: &str, errors: &mut Vec<ValidationError>) {
    check_terminal_attrs(state, state_path, errors);
    match state {
        State::Pass(s) => check_pass(s, state_path, errors),
        State::Wait(s) => check_wait(s, state_path, errors),
        State::Action(s) => check_action(s, state_path, errors),
        State::Choice(s) => check_choice(s, state_path, errors),
        State::ExpressionEval(s) => check_expression_eval(s, state_path, errors),
        // Fail carries only `cause`/`error`; the attribute table already
        // rejects `next`/`end` and everything else.
        State::Fail(_) => {}
    }
}

fn check_terminal_attrs(state: &State, state_path: &str, errors: &mut Vec<ValidationError>) {
    let Some((next, end)) = state.terminal_attrs() else {
        return;
    };
    let has_next = next.is_some();
    let has_end = end == Some(true);
    if has_next == has_end {
        errors.push(ValidationError::schema(
            state_path,
            "exactly one of 'next' or 'end: true' must be set",
        ));
    }
}

fn check_pass(s: &PassState, state_path: &str, errors: &mut Vec<ValidationError>) {
    check_path_field(&s.input_path, "input_path", state_path, errors);
    check_path_field(&s.result_path, "result_path", state_path, errors);
    check_parameters(&s.parameters, state_path, errors);
}

fn check_wait(s: &WaitState, state_path: &str, errors: &mut Vec<ValidationError>) {
    let variants = [
        s.seconds.is_some(),
        s.timestamp.is_some(),
        s.seconds_path.is_some(),
        s.timestamp_path.is_some(),
    ];
    if variants.iter().filter(|set| **set).count() != 1 {
        errors.push(ValidationError::schema(
            state_path,
            "exactly one of 'seconds', 'timestamp', 'seconds_path', 'timestamp_path' must be set",
        ));
    }
    if let Some(ts) = &s.timestamp {
        if DateTime::parse_from_rfc3339(ts).is_err() {
            errors.push(ValidationError::schema(
                format!("{state_path}.timestamp"),
                format!("'{ts}' is not an ISO-8601 instant"),
            ));
        }
    }
    check_path_field(&s.seconds_path, "seconds_path", state_path, errors);
    check_path_field(&s.timestamp_path, "timestamp_path", state_path, errors);
    check_path_field(&s.input_path, "input_path", state_path, errors);
    check_path_field(&s.output_path, "output_path", state_path, errors);
}

fn check_action(s: &ActionState, state_path: &str, errors: &mut Vec<ValidationError>) {
    let scheme_ok = s
        .action_url
        .strip_prefix("https://")
        .or_else(|| s.action_url.strip_prefix("http://"))
        .is_some_and(|rest| !rest.is_empty());
    if !scheme_ok {
        errors.push(ValidationError::schema(
            format!("{state_path}.action_url"),
            format!("'{}' is not an http/https URL", s.action_url),
        ));
    }

    if s.parameters.is_some() == s.input_path.is_some() {
        errors.push(ValidationError::schema(
            state_path,
            "exactly one of 'parameters' or 'input_path' must be set",
        ));
    }

    if s.wait_time == Some(0) {
        errors.push(ValidationError::schema(
            format!("{state_path}.wait_time"),
            "must be at least 1 second",
        ));
    }

    for (i, catcher) in s.catch.iter().flatten().enumerate() {
        if catcher.error_equals.is_empty() {
            errors.push(ValidationError::schema(
                format!("{state_path}.catch[{i}].error_equals"),
                "must not be empty",
            ));
        }
        check_path_field(
            &catcher.result_path,
            &format!("catch[{i}].result_path"),
            state_path,
            errors,
        );
    }

    check_path_field(&s.input_path, "input_path", state_path, errors);
    check_path_field(&s.result_path, "result_path", state_path, errors);
    check_parameters(&s.parameters, state_path, errors);
}

fn check_choice(s: &ChoiceState, state_path: &str, errors: &mut Vec<ValidationError>) {
    if s.choices.is_empty() {
        errors.push(ValidationError::schema(
            format!("{state_path}.choices"),
            "must not be empty",
        ));
    }
    for (i, rule) in s.choices.iter().enumerate() {
        check_rule(rule, &format!("{state_path}.choices[{i}]"), true, 1, errors);
    }
}

fn check_expression_eval(
    s: &ExpressionEvalState,
    state_path: &str,
    errors: &mut Vec<ValidationError>,
) {
    check_path_field(&s.result_path, "result_path", state_path, errors);
    check_parameters(&s.parameters, state_path, errors);
}

/// Path-valued fields must be JSONPath-shaped: `$.` prefix, well-formed
/// dotted segments.
fn check_path_field(
    field: &Option<String>,
    field_name: &str,
    state_path: &str,
    errors: &mut Vec<ValidationError>,
) {
    let Some(raw) = field else {
        return;
    };
    if !path::is_reference(raw) || JsonPath::parse(raw).is_err() {
        errors.push(ValidationError::schema(
            format!("{state_path}.{field_name}"),
            format!("'{raw}' is not a JSONPath expression beginning with '$.'"),
        ));
    }
}

/// Every `.$`-suffixed key inside `parameters` (recursively, through
/// nested mappings and sequences) must reference a JSONPath string.
fn check_parameters(
    parameters: &Option<Map<String, Value>>,
    state_path: &str,
    errors: &mut Vec<ValidationError>,
) {
    let Some(map) = parameters else {
        return;
    };
    let mut invalid = Vec::new();
    path::find_invalid_references(
        &Value::Object(map.clone()),
        &format!("{state_path}.parameters"),
        &mut invalid,
    );
    for (at, message) in invalid {
        errors.push(ValidationError::schema(at, message));
    }
}

// ---------------------------------------------------------------------------
// Choice rules (recursive)
// ---------------------------------------------------------------------------

fn check_rule(
    rule: &ChoiceRule,
    rule_path: &str,
    top_level: bool,
    depth: usize,
    errors: &mut Vec<ValidationError>,
) {
    if depth > MAX_RULE_DEPTH {
        errors.push(ValidationError::schema(
            rule_path,
            format!("choice rule nesting exceeds {MAX_RULE_DEPTH} levels"),
        ));
        return;
    }

    let mut comparators = Vec::new();
    for (key, operand) in &rule.comparisons {
        match Comparator::from_key(key) {
            Some(comparator) => comparators.push((key.as_str(), comparator, operand)),
            None => errors.push(ValidationError::schema(
                format!("{rule_path}.{key}"),
                format!("unknown attribute '{key}'"),
            )),
        }
    }

    let boolean_count = [rule.and.is_some(), rule.or.is_some(), rule.not.is_some()]
        .iter()
        .filter(|set| **set)
        .count();

    if boolean_count > 0 {
        if boolean_count > 1 {
            errors.push(ValidationError::schema(
                rule_path,
                "only one of 'and', 'or', 'not' may be set",
            ));
        }
        if rule.variable.is_some() {
            errors.push(ValidationError::schema(
                format!("{rule_path}.variable"),
                "boolean expressions do not take 'variable'",
            ));
        }
        if !comparators.is_empty() {
            errors.push(ValidationError::schema(
                rule_path,
                "boolean expressions do not take comparators",
            ));
        }
        if let Some(sub_rules) = &rule.and {
            if sub_rules.is_empty() {
                errors.push(ValidationError::schema(
                    format!("{rule_path}.and"),
                    "must not be empty",
                ));
            }
            for (i, sub) in sub_rules.iter().enumerate() {
                check_rule(sub, &format!("{rule_path}.and[{i}]"), false, depth + 1, errors);
            }
        }
        if let Some(sub_rules) = &rule.or {
            if sub_rules.is_empty() {
                errors.push(ValidationError::schema(
                    format!("{rule_path}.or"),
                    "must not be empty",
                ));
            }
            for (i, sub) in sub_rules.iter().enumerate() {
                check_rule(sub, &format!("{rule_path}.or[{i}]"), false, depth + 1, errors);
            }
        }
        if let Some(sub) = &rule.not {
            check_rule(sub, &format!("{rule_path}.not"), false, depth + 1, errors);
        }
    } else {
        // Data-test expression.
        match &rule.variable {
            Some(variable) if path::is_reference(variable) && JsonPath::parse(variable).is_ok() => {}
            Some(variable) => errors.push(ValidationError::schema(
                format!("{rule_path}.variable"),
                format!("'{variable}' is not a JSONPath expression beginning with '$.'"),
            )),
            None => errors.push(ValidationError::schema(
                rule_path,
                "data-test expression requires 'variable'",
            )),
        }
        match comparators.as_slice() {
            [] => errors.push(ValidationError::schema(
                rule_path,
                "data-test expression requires exactly one comparator",
            )),
            [(key, comparator, operand)] => {
                check_operand(*comparator, operand, &format!("{rule_path}.{key}"), errors);
            }
            _ => errors.push(ValidationError::schema(
                rule_path,
                format!(
                    "data-test expression carries {} comparators; exactly one is allowed",
                    comparators.len()
                ),
            )),
        }
    }

    if top_level {
        if rule.next.is_none() {
            errors.push(ValidationError::schema(
                rule_path,
                "top-level choice rules require 'next'",
            ));
        }
    } else if rule.next.is_some() {
        errors.push(ValidationError::schema(
            format!("{rule_path}.next"),
            "nested choice rules must not carry 'next'",
        ));
    }
}

fn check_operand(
    comparator: Comparator,
    operand: &Value,
    operand_path: &str,
    errors: &mut Vec<ValidationError>,
) {
    let mut reject = |expected: &str| {
        errors.push(ValidationError::schema(
            operand_path,
            format!("operand must be {expected}, got {operand}"),
        ));
    };

    if comparator.takes_path_operand() {
        match operand.as_str() {
            Some(s) if path::is_reference(s) && JsonPath::parse(s).is_ok() => {}
            _ => reject("a JSONPath string beginning with '$.'"),
        }
        return;
    }
    match comparator.category() {
        ComparatorCategory::String => {
            if !operand.is_string() {
                reject("a string");
            }
        }
        ComparatorCategory::Numeric => {
            if !operand.is_number() {
                reject("a number");
            }
        }
        ComparatorCategory::Timestamp => match operand.as_str() {
            Some(ts) if DateTime::parse_from_rfc3339(ts).is_ok() => {}
            _ => reject("an ISO-8601 instant"),
        },
        ComparatorCategory::Boolean | ComparatorCategory::Predicate => {
            if !operand.is_boolean() {
                reject("a boolean");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cross-state referential checks
// ---------------------------------------------------------------------------

fn check_references(
    start_at: Option<&str>,
    defined: &BTreeSet<&str>,
    states: &BTreeMap<String, State>,
    all_parsed: bool,
    errors: &mut Vec<ValidationError>,
) {
    let start_defined = match start_at {
        Some(start) if !defined.contains(start) => {
            errors.push(ValidationError::referential(
                "$.start_at",
                format!("start state '{start}' is not defined"),
            ));
            false
        }
        Some(_) => true,
        None => false,
    };

    for (name, state) in states {
        for (target, attr_path) in state.successors() {
            if !defined.contains(target.as_str()) {
                errors.push(ValidationError::referential(
                    format!("$.states.{name}.{attr_path}"),
                    format!("transition target '{target}' is not defined"),
                ));
            }
        }
    }

    // Reachability needs the full transition graph, so it only runs when
    // every state parsed.
    if !(all_parsed && start_defined) {
        return;
    }
    let start = start_at.unwrap_or_default();

    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([start]);
    while let Some(name) = queue.pop_front() {
        if !visited.insert(name) {
            continue;
        }
        let Some(state) = states.get(name) else {
            continue;
        };
        for (target, _) in state.successors() {
            if let Some(&defined_target) = defined.get(target.as_str()) {
                if !visited.contains(defined_target) {
                    queue.push_back(defined_target);
                }
            }
        }
    }

    for name in defined {
        if !visited.contains(name) {
            errors.push(ValidationError::referential(
                format!("$.states.{name}"),
                format!("state '{name}' is defined but not reachable from '{start}'"),
            ));
        }
    }
}
