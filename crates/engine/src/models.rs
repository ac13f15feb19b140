//! Core domain model for flow definitions.
//!
//! These types are the source of truth for what a flow looks like in
//! memory.  They deserialize from the JSON/YAML wire format; the validator
//! works on top of them and performs the checks serde alone cannot express
//! (terminal-attribute exclusivity, path shapes, referential integrity).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// FlowDefinition
// ---------------------------------------------------------------------------

/// A complete flow definition: a finite state machine over typed data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Name of the initial state; must be a key in `states`.
    pub start_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Non-empty mapping from state name to state.
    pub states: BTreeMap<String, State>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// A node in the state machine; a tagged variant over a closed set.
///
/// Dispatch is by the `type` discriminator.  Unknown tags are rejected at
/// parse time; unknown attributes are rejected by the validator, which
/// checks the raw document against a per-variant attribute table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum State {
    Pass(PassState),
    Wait(WaitState),
    Action(ActionState),
    Choice(ChoiceState),
    ExpressionEval(ExpressionEvalState),
    Fail(FailState),
}

impl State {
    /// Human-readable tag for logs and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            State::Pass(_) => "Pass",
            State::Wait(_) => "Wait",
            State::Action(_) => "Action",
            State::Choice(_) => "Choice",
            State::ExpressionEval(_) => "ExpressionEval",
            State::Fail(_) => "Fail",
        }
    }

    /// The `next`/`end` pair for variants that carry terminal attributes.
    pub fn terminal_attrs(&self) -> Option<(Option<&str>, Option<bool>)> {
        match self {
            State::Pass(s) => Some((s.next.as_deref(), s.end)),
            State::Wait(s) => Some((s.next.as_deref(), s.end)),
            State::Action(s) => Some((s.next.as_deref(), s.end)),
            State::ExpressionEval(s) => Some((s.next.as_deref(), s.end)),
            State::Choice(_) | State::Fail(_) => None,
        }
    }

    /// Every state name this state can transition to, with the attribute
    /// path (relative to the state) where the reference appears.
    pub fn successors(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some((Some(next), _)) = self.terminal_attrs() {
            out.push((next.to_string(), "next".to_string()));
        }
        match self {
            State::Action(s) => {
                for (i, catcher) in s.catch.iter().flatten().enumerate() {
                    out.push((catcher.next.clone(), format!("catch[{i}].next")));
                }
            }
            State::Choice(s) => {
                for (i, rule) in s.choices.iter().enumerate() {
                    if let Some(next) = &rule.next {
                        out.push((next.clone(), format!("choices[{i}].next")));
                    }
                }
                if let Some(default) = &s.default {
                    out.push((default.clone(), "default".to_string()));
                }
            }
            _ => {}
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Per-variant states
// ---------------------------------------------------------------------------

/// Projects its input (or a literal `result`) to `result_path` and moves on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PassState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
}

/// Suspends the run for a literal or path-resolved duration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WaitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
}

/// Default `wait_time` for an action state, in seconds.
pub const DEFAULT_ACTION_WAIT_TIME: u64 = 300;

/// Starts a remote action instance and polls it to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// http/https URL of the action provider.
    pub action_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_on_action_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<Vec<Catcher>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
}

impl ActionState {
    /// Whether a FAILED action raises `ACTION_FAILED` (default) instead of
    /// writing the failed result and continuing.
    pub fn raises_on_failure(&self) -> bool {
        self.exception_on_action_failure.unwrap_or(true)
    }

    /// Seconds to wait for a terminal status before timing out.
    pub fn wait_time_secs(&self) -> u64 {
        self.wait_time.unwrap_or(DEFAULT_ACTION_WAIT_TIME)
    }
}

/// Routes to the first choice rule that evaluates true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub choices: Vec<ChoiceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Evaluates its `parameters` projection into a fresh object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExpressionEvalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
}

/// Terminates the run as FAILED, exposing `cause` and `error`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FailState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Catcher
// ---------------------------------------------------------------------------

/// Wildcard token matching any error kind in a catcher.
pub const CATCH_ALL: &str = "States.ALL";

/// A conditional transition attached to an `Action` state, matched by
/// error-kind tokens.  First match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catcher {
    /// Non-empty list of error tokens (or `States.ALL`).
    pub error_equals: Vec<String>,
    pub next: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

impl Catcher {
    /// Whether this catcher handles the given error token.
    pub fn matches(&self, token: &str) -> bool {
        self.error_equals
            .iter()
            .any(|t| t == token || t == CATCH_ALL)
    }
}

// ---------------------------------------------------------------------------
// Choice rules
// ---------------------------------------------------------------------------

/// A choice rule: either a data-test expression (`variable` plus exactly one
/// comparator) or a boolean expression (`and`/`or`/`not` over nested rules).
///
/// Comparator attributes land in the flattened `comparisons` map; the
/// validator rejects unknown keys there and enforces the exactly-one rule,
/// so the evaluator can assume a single well-formed entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChoiceRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    /// Required on top-level rules, forbidden on nested ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(flatten)]
    pub comparisons: Map<String, Value>,
}

impl ChoiceRule {
    /// The single (comparator, operand) pair of a data-test rule, if the
    /// rule carries exactly one recognized comparator.
    pub fn comparison(&self) -> Option<(Comparator, &Value)> {
        let mut found = None;
        for (key, value) in &self.comparisons {
            let Some(comparator) = Comparator::from_key(key) else {
                continue;
            };
            if found.is_some() {
                return None;
            }
            found = Some((comparator, value));
        }
        found
    }

    /// Whether any of `and`/`or`/`not` is present.
    pub fn is_boolean(&self) -> bool {
        self.and.is_some() || self.or.is_some() || self.not.is_some()
    }
}

/// The closed comparator set for data-test rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    StringEquals,
    StringEqualsPath,
    StringLessThan,
    StringLessThanPath,
    StringGreaterThan,
    StringGreaterThanPath,
    StringLessThanEquals,
    StringLessThanEqualsPath,
    StringGreaterThanEquals,
    StringGreaterThanEqualsPath,
    StringMatches,
    NumericEquals,
    NumericEqualsPath,
    NumericLessThan,
    NumericLessThanPath,
    NumericGreaterThan,
    NumericGreaterThanPath,
    NumericLessThanEquals,
    NumericLessThanEqualsPath,
    NumericGreaterThanEquals,
    NumericGreaterThanEqualsPath,
    TimestampEquals,
    TimestampEqualsPath,
    TimestampLessThan,
    TimestampLessThanPath,
    TimestampGreaterThan,
    TimestampGreaterThanPath,
    TimestampLessThanEquals,
    TimestampLessThanEqualsPath,
    TimestampGreaterThanEquals,
    TimestampGreaterThanEqualsPath,
    BooleanEquals,
    BooleanEqualsPath,
    IsNull,
    IsPresent,
    IsNumeric,
    IsString,
    IsBoolean,
    IsTimestamp,
}

impl Comparator {
    pub fn from_key(key: &str) -> Option<Self> {
        use Comparator::*;
        Some(match key {
            "StringEquals" => StringEquals,
            "StringEqualsPath" => StringEqualsPath,
            "StringLessThan" => StringLessThan,
            "StringLessThanPath" => StringLessThanPath,
            "StringGreaterThan" => StringGreaterThan,
            "StringGreaterThanPath" => StringGreaterThanPath,
            "StringLessThanEquals" => StringLessThanEquals,
            "StringLessThanEqualsPath" => StringLessThanEqualsPath,
            "StringGreaterThanEquals" => StringGreaterThanEquals,
            "StringGreaterThanEqualsPath" => StringGreaterThanEqualsPath,
            "StringMatches" => StringMatches,
            "NumericEquals" => NumericEquals,
            "NumericEqualsPath" => NumericEqualsPath,
            "NumericLessThan" => NumericLessThan,
            "NumericLessThanPath" => NumericLessThanPath,
            "NumericGreaterThan" => NumericGreaterThan,
            "NumericGreaterThanPath" => NumericGreaterThanPath,
            "NumericLessThanEquals" => NumericLessThanEquals,
            "NumericLessThanEqualsPath" => NumericLessThanEqualsPath,
            "NumericGreaterThanEquals" => NumericGreaterThanEquals,
            "NumericGreaterThanEqualsPath" => NumericGreaterThanEqualsPath,
            "TimestampEquals" => TimestampEquals,
            "TimestampEqualsPath" => TimestampEqualsPath,
            "TimestampLessThan" => TimestampLessThan,
            "TimestampLessThanPath" => TimestampLessThanPath,
            "TimestampGreaterThan" => TimestampGreaterThan,
            "TimestampGreaterThanPath" => TimestampGreaterThanPath,
            "TimestampLessThanEquals" => TimestampLessThanEquals,
            "TimestampLessThanEqualsPath" => TimestampLessThanEqualsPath,
            "TimestampGreaterThanEquals" => TimestampGreaterThanEquals,
            "TimestampGreaterThanEqualsPath" => TimestampGreaterThanEqualsPath,
            "BooleanEquals" => BooleanEquals,
            "BooleanEqualsPath" => BooleanEqualsPath,
            "IsNull" => IsNull,
            "IsPresent" => IsPresent,
            "IsNumeric" => IsNumeric,
            "IsString" => IsString,
            "IsBoolean" => IsBoolean,
            "IsTimestamp" => IsTimestamp,
            _ => return None,
        })
    }

    /// `*Path` variants resolve their operand from the document first.
    pub fn takes_path_operand(self) -> bool {
        use Comparator::*;
        matches!(
            self,
            StringEqualsPath
                | StringLessThanPath
                | StringGreaterThanPath
                | StringLessThanEqualsPath
                | StringGreaterThanEqualsPath
                | NumericEqualsPath
                | NumericLessThanPath
                | NumericGreaterThanPath
                | NumericLessThanEqualsPath
                | NumericGreaterThanEqualsPath
                | TimestampEqualsPath
                | TimestampLessThanPath
                | TimestampGreaterThanPath
                | TimestampLessThanEqualsPath
                | TimestampGreaterThanEqualsPath
                | BooleanEqualsPath
        )
    }

    /// Type predicates take a boolean operand and test the resolved value.
    pub fn is_predicate(self) -> bool {
        self.category() == ComparatorCategory::Predicate
    }

    /// The value category this comparator operates on.
    pub fn category(self) -> ComparatorCategory {
        use Comparator::*;
        match self {
            StringEquals | StringEqualsPath | StringLessThan | StringLessThanPath
            | StringGreaterThan | StringGreaterThanPath | StringLessThanEquals
            | StringLessThanEqualsPath | StringGreaterThanEquals | StringGreaterThanEqualsPath
            | StringMatches => ComparatorCategory::String,
            NumericEquals | NumericEqualsPath | NumericLessThan | NumericLessThanPath
            | NumericGreaterThan | NumericGreaterThanPath | NumericLessThanEquals
            | NumericLessThanEqualsPath | NumericGreaterThanEquals
            | NumericGreaterThanEqualsPath => ComparatorCategory::Numeric,
            TimestampEquals | TimestampEqualsPath | TimestampLessThan | TimestampLessThanPath
            | TimestampGreaterThan | TimestampGreaterThanPath | TimestampLessThanEquals
            | TimestampLessThanEqualsPath | TimestampGreaterThanEquals
            | TimestampGreaterThanEqualsPath => ComparatorCategory::Timestamp,
            BooleanEquals | BooleanEqualsPath => ComparatorCategory::Boolean,
            IsNull | IsPresent | IsNumeric | IsString | IsBoolean | IsTimestamp => {
                ComparatorCategory::Predicate
            }
        }
    }
}

/// Value categories of the comparator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparatorCategory {
    String,
    Numeric,
    Timestamp,
    Boolean,
    Predicate,
}
