//! Minimal JSONLogic-style expression interpreter.
//!
//! An expression is a single-key object `{"op": [args...]}`; anything else is
//! a literal. Supported operators: `var`, `==`/`eq`, `!=`/`neq`, `>`/`gt`,
//! `>=`/`gte`, `<`/`lt`, `<=`/`lte`, `!`/`not`, `and`, `or`, `in`, `if`,
//! `regex`.

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use flowline_core::types::Payload;

use crate::condition::{compare, contains, truthy, values_equal, Diagnostics};

/// Evaluate `expr` against `data` and reduce the result to a boolean.
///
/// A malformed expression (missing arguments, incomparable operands) makes
/// the whole expression false. An unknown operator is false in place.
pub fn evaluate_condition(expr: &Value, data: &Payload, diags: &mut Diagnostics) -> bool {
    let outcome = Interpreter { data, diags: &mut *diags }.eval(expr);
    match outcome {
        Ok(v) => truthy(&v),
        Err(e) => {
            diags.push(format!("expression {} is malformed: {}", expr, e));
            false
        }
    }
}

/// Evaluate `expr` and return its value. Malformed expressions yield `null`.
pub fn evaluate(expr: &Value, data: &Payload, diags: &mut Diagnostics) -> Value {
    let outcome = Interpreter { data, diags: &mut *diags }.eval(expr);
    match outcome {
        Ok(v) => v,
        Err(e) => {
            diags.push(format!("expression {} is malformed: {}", expr, e));
            Value::Null
        }
    }
}

struct Interpreter<'a> {
    data: &'a Payload,
    diags: &'a mut Diagnostics,
}

type Eval = std::result::Result<Value, String>;

impl Interpreter<'_> {
    fn eval(&mut self, expr: &Value) -> Eval {
        let (op, raw_args) = match expr {
            Value::Object(map) if map.len() == 1 => match map.iter().next() {
                Some(entry) => entry,
                None => return Ok(expr.clone()),
            },
            _ => return Ok(expr.clone()),
        };
        let args: Vec<&Value> = match raw_args {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        match op.as_str() {
            "var" => Ok(self.var(&args)),
            "==" | "eq" => {
                let (a, b) = self.pair(op, &args)?;
                Ok(Value::Bool(values_equal(&a, &b)))
            }
            "!=" | "neq" => {
                let (a, b) = self.pair(op, &args)?;
                Ok(Value::Bool(!values_equal(&a, &b)))
            }
            ">" | "gt" => self.relation(op, &args, |o| o == Ordering::Greater),
            ">=" | "gte" => self.relation(op, &args, |o| o != Ordering::Less),
            "<" | "lt" => self.relation(op, &args, |o| o == Ordering::Less),
            "<=" | "lte" => self.relation(op, &args, |o| o != Ordering::Greater),
            "!" | "not" => {
                let arg = args.first().ok_or_else(|| arity(op, 1))?;
                Ok(Value::Bool(!truthy(&self.resolve(arg)?)))
            }
            "and" => {
                for arg in &args {
                    if !truthy(&self.resolve(arg)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            "or" => {
                for arg in &args {
                    if truthy(&self.resolve(arg)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            "in" => {
                let (item, container) = self.pair(op, &args)?;
                match container {
                    Value::Array(_) | Value::String(_) | Value::Object(_) => {
                        Ok(Value::Bool(contains(&container, &item)))
                    }
                    other => {
                        self.diags.push(format!("'in' needs a container, got {}", other));
                        Ok(Value::Bool(false))
                    }
                }
            }
            "if" => self.branch(&args),
            "regex" => {
                let (pattern, target) = self.pair(op, &args)?;
                let (Some(pattern), Some(target)) = (pattern.as_str(), target.as_str()) else {
                    return Ok(Value::Bool(false));
                };
                match Regex::new(pattern) {
                    Ok(re) => Ok(Value::Bool(re.is_match(target))),
                    Err(e) => {
                        self.diags.push(format!("invalid pattern '{}': {}", pattern, e));
                        Ok(Value::Bool(false))
                    }
                }
            }
            unknown => {
                self.diags.push(format!("unsupported expression operator '{}'", unknown));
                Ok(Value::Bool(false))
            }
        }
    }

    fn resolve(&mut self, value: &Value) -> Eval {
        match value {
            Value::Object(_) => self.eval(value),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve(v))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn pair(&mut self, op: &str, args: &[&Value]) -> std::result::Result<(Value, Value), String> {
        match args {
            [a, b, ..] => Ok((self.resolve(a)?, self.resolve(b)?)),
            _ => Err(arity(op, 2)),
        }
    }

    fn relation(&mut self, op: &str, args: &[&Value], accept: fn(Ordering) -> bool) -> Eval {
        let (a, b) = self.pair(op, args)?;
        match compare(&a, &b) {
            Some(ordering) => Ok(Value::Bool(accept(ordering))),
            None => Err(format!("cannot compare {} {} {}", a, op, b)),
        }
    }

    /// `var` with a dot-path and optional default. No path means the whole input.
    fn var(&self, args: &[&Value]) -> Value {
        let default = args.get(1).map(|v| (*v).clone()).unwrap_or(Value::Null);
        let path = match args.first() {
            None | Some(Value::Null) => return Value::Object(self.data.clone()),
            Some(Value::String(path)) => path,
            Some(_) => return default,
        };
        let mut parts = path.split('.');
        let Some(mut cur) = parts.next().and_then(|first| self.data.get(first)) else {
            return default;
        };
        for part in parts {
            match cur.as_object().and_then(|m| m.get(part)) {
                Some(next) => cur = next,
                None => return default,
            }
        }
        if cur.is_null() {
            default
        } else {
            cur.clone()
        }
    }

    /// `if` takes (condition, value) pairs and an optional trailing default.
    fn branch(&mut self, args: &[&Value]) -> Eval {
        if args.is_empty() {
            return Err(arity("if", 2));
        }
        for pair in args.chunks_exact(2) {
            if truthy(&self.resolve(pair[0])?) {
                return self.resolve(pair[1]);
            }
        }
        if args.len() % 2 == 1 {
            self.resolve(args[args.len() - 1])
        } else {
            Ok(Value::Null)
        }
    }
}

fn arity(op: &str, n: usize) -> String {
    format!("'{}' expects at least {} argument(s)", op, n)
}
