//! Rule predicates and `${args...}` substitution.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static PREDICATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(sizeof\s+)?\$\{args(?:\.([A-Za-z0-9_.\-]+))?\}\s*(==|!=|=~)\s*(.*?)\s*$")
        .expect("predicate regex must compile")
});

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{args(?:\.([A-Za-z0-9_.\-]+))?\}").expect("placeholder regex must compile")
});

#[derive(Debug, Clone)]
enum Operand {
    Literal(Value),
    Pattern(Regex),
}

/// A parsed rule condition such as `${args.ready} == true`.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    sizeof: bool,
    key: Option<String>,
    negate: bool,
    operand: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateError(pub String);

impl fmt::Display for PredicateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PredicateError {}

impl FromStr for Predicate {
    type Err = PredicateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = PREDICATE
            .captures(s)
            .ok_or_else(|| PredicateError(format!("unparsable predicate: {s}")))?;
        let op = &caps[3];
        let rhs = &caps[4];
        if rhs.is_empty() {
            return Err(PredicateError(format!("predicate has no right-hand side: {s}")));
        }
        let operand = if op == "=~" {
            let body = rhs
                .strip_prefix('/')
                .and_then(|r| r.strip_suffix('/'))
                .filter(|_| rhs.len() >= 2)
                .ok_or_else(|| PredicateError(format!("expected /regex/ after =~ in: {s}")))?;
            let re = Regex::new(body).map_err(|e| PredicateError(format!("invalid regex in {s}: {e}")))?;
            Operand::Pattern(re)
        } else {
            Operand::Literal(parse_literal(rhs))
        };
        Ok(Self {
            source: s.trim().to_string(),
            sizeof: caps.get(1).is_some(),
            key: caps.get(2).map(|m| m.as_str().to_string()),
            negate: op == "!=",
            operand,
        })
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Predicate {
    pub fn eval(&self, args: &Map<String, Value>) -> bool {
        let value = lookup(args, self.key.as_deref());
        let lhs = if self.sizeof { Value::from(size_of(&value)) } else { value };
        match &self.operand {
            Operand::Pattern(re) => re.is_match(&render(&lhs)),
            Operand::Literal(lit) => {
                let equal = values_equal(&lhs, lit);
                equal != self.negate
            }
        }
    }
}

/// Bare words are strings; anything that parses as JSON is taken as JSON.
fn parse_literal(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| {
        let unquoted = raw
            .strip_prefix('\'')
            .and_then(|r| r.strip_suffix('\''))
            .unwrap_or(raw);
        Value::String(unquoted.to_string())
    })
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    if lhs == rhs {
        return true;
    }
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => render(lhs) == render(rhs),
    }
}

fn size_of(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        Value::String(s) => s.chars().count(),
        other => other.to_string().len(),
    }
}

/// Value at a dotted path; the whole map when `key` is `None`.
fn lookup(args: &Map<String, Value>, key: Option<&str>) -> Value {
    let Some(key) = key else {
        return Value::Object(args.clone());
    };
    let mut parts = key.split('.');
    let Some(first) = parts.next() else {
        return Value::Null;
    };
    let mut current = args.get(first);
    for part in parts {
        current = match current {
            Some(Value::Object(map)) => map.get(part),
            Some(Value::Array(items)) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
    }
    current.cloned().unwrap_or(Value::Null)
}

/// Strings render bare; everything else as compact JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `${args.key}` with the value and `${args}` with the whole map as
/// pretty JSON. Missing keys become empty.
pub fn substitute(template: &str, args: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| match caps.get(1) {
            Some(key) => render(&lookup(args, Some(key.as_str()))),
            None => serde_json::to_string_pretty(args).unwrap_or_default(),
        })
        .into_owned()
}
