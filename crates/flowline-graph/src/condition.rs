//! Rule-set predicates over a node's structured output.
//!
//! Evaluation is total: an unknown operator, an invalid pattern or a type
//! mismatch yields `false` and, where the cause is a malformed condition,
//! a diagnostic.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use flowline_core::spec::{Rule, RuleLogic};
use flowline_core::types::Payload;

/// Problems found while evaluating conditions. Every entry is also logged.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    messages: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(diagnostic = %message, "Condition evaluation degraded to false");
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }
}

/// Comparison operators available to rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    RegexNot,
    Between,
    IsTrue,
    IsFalse,
    Exists,
    NotExists,
}

impl Operator {
    /// Resolve an operator name, accepting the short aliases (`eq`, `gte`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name.trim().to_ascii_lowercase().as_str() {
            "==" | "eq" => Self::Eq,
            "!=" | "neq" => Self::Ne,
            ">" | "gt" => Self::Gt,
            ">=" | "gte" => Self::Gte,
            "<" | "lt" => Self::Lt,
            "<=" | "lte" => Self::Lte,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "startswith" => Self::StartsWith,
            "endswith" => Self::EndsWith,
            "regex" => Self::Regex,
            "regex_not" => Self::RegexNot,
            "between" => Self::Between,
            "is_true" => Self::IsTrue,
            "is_false" => Self::IsFalse,
            "exists" => Self::Exists,
            "not_exists" => Self::NotExists,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone)]
enum Check {
    Op(Operator),
    Pattern { regex: Regex, negate: bool },
    /// Carries the diagnostic reported on every evaluation.
    Unsupported(String),
}

/// A rule with its operator resolved and any pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub field: String,
    pub value: Value,
    check: Check,
}

impl CompiledRule {
    pub fn compile(rule: &Rule) -> Self {
        let check = match Operator::parse(&rule.operator) {
            Some(op @ (Operator::Regex | Operator::RegexNot)) => {
                let negate = op == Operator::RegexNot;
                match rule.value.as_str().map(Regex::new) {
                    Some(Ok(regex)) => Check::Pattern { regex, negate },
                    Some(Err(e)) => Check::Unsupported(format!(
                        "invalid pattern for field '{}': {}",
                        rule.field, e
                    )),
                    None => Check::Unsupported(format!(
                        "pattern for field '{}' must be a string",
                        rule.field
                    )),
                }
            }
            Some(op) => Check::Op(op),
            None => Check::Unsupported(format!("unsupported operator '{}'", rule.operator)),
        };
        Self {
            field: rule.field.clone(),
            value: rule.value.clone(),
            check,
        }
    }

    pub fn operator(&self) -> Option<Operator> {
        match &self.check {
            Check::Op(op) => Some(*op),
            Check::Pattern { negate: false, .. } => Some(Operator::Regex),
            Check::Pattern { negate: true, .. } => Some(Operator::RegexNot),
            Check::Unsupported(_) => None,
        }
    }

    pub fn evaluate(&self, output: &Payload, diags: &mut Diagnostics) -> bool {
        let left = lookup_field(output, &self.field);
        match (&self.check, left) {
            (Check::Unsupported(message), _) => {
                diags.push(message.clone());
                false
            }
            (Check::Op(Operator::Exists), left) => left.is_some(),
            (Check::Op(Operator::NotExists), left) => left.is_none(),
            (_, None) => false,
            (Check::Pattern { regex, negate }, Some(left)) => left
                .as_str()
                .map(|s| regex.is_match(s) != *negate)
                .unwrap_or(false),
            (Check::Op(op), Some(left)) => apply(*op, left, &self.value),
        }
    }
}

fn apply(op: Operator, left: &Value, right: &Value) -> bool {
    match op {
        Operator::Eq => values_equal(left, right),
        Operator::Ne => !values_equal(left, right),
        Operator::Gt => compare(left, right) == Some(Ordering::Greater),
        Operator::Gte => matches!(compare(left, right), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Lt => compare(left, right) == Some(Ordering::Less),
        Operator::Lte => matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal)),
        Operator::In => contains(right, left),
        Operator::NotIn => !contains(right, left),
        Operator::Contains => contains(left, right),
        Operator::NotContains => !contains(left, right),
        Operator::StartsWith => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.starts_with(r),
            _ => false,
        },
        Operator::EndsWith => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.ends_with(r),
            _ => false,
        },
        Operator::Between => match right.as_array().map(Vec::as_slice) {
            Some([low, high]) => {
                matches!(compare(low, left), Some(Ordering::Less | Ordering::Equal))
                    && matches!(compare(left, high), Some(Ordering::Less | Ordering::Equal))
            }
            _ => false,
        },
        Operator::IsTrue => truthy(left),
        Operator::IsFalse => !truthy(left),
        Operator::Exists => true,
        Operator::NotExists => false,
        // Patterns are compiled into `Check::Pattern`.
        Operator::Regex | Operator::RegexNot => false,
    }
}

/// A rule-set with its combinator.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub logic: RuleLogic,
    pub rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(logic: RuleLogic, rules: &[Rule]) -> Self {
        Self {
            logic,
            rules: rules.iter().map(CompiledRule::compile).collect(),
        }
    }

    /// An empty rule list always fires, whatever the combinator.
    pub fn evaluate(&self, output: &Payload, diags: &mut Diagnostics) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let results: Vec<bool> = self.rules.iter().map(|r| r.evaluate(output, diags)).collect();
        match self.logic {
            RuleLogic::And => results.iter().all(|r| *r),
            RuleLogic::Or => results.iter().any(|r| *r),
        }
    }
}

/// Find a field by exact key, then by dot-path. JSON `null` counts as absent.
pub fn lookup_field<'a>(output: &'a Payload, field: &str) -> Option<&'a Value> {
    if let Some(v) = output.get(field) {
        return (!v.is_null()).then_some(v);
    }
    let mut parts = field.split('.');
    let mut cur = output.get(parts.next()?)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    (!cur.is_null()).then_some(cur)
}

/// Equality with numbers compared by value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two values of the same scalar type. `None` when incomparable.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Membership: element of an array, substring of a string, or key of an object.
pub fn contains(container: &Value, item: &Value) -> bool {
    match container {
        Value::Array(items) => items.iter().any(|v| values_equal(v, item)),
        Value::String(s) => item.as_str().is_some_and(|i| s.contains(i)),
        Value::Object(map) => item.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

/// Truthiness: null, false, zero and empty containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
