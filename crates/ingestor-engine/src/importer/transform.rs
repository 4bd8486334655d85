//! Named value transforms
//!
//! Field mappings reference transforms by name so configurations stay plain
//! data. A transform receives the raw value, its configured arguments and the
//! whole source row.

use chrono::NaiveDate;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::definition::TransformRef;
use crate::types::{is_blank, RowData};

/// Transform function: `(value, args, row) -> value`
pub type TransformFn =
    Arc<dyn Fn(&Value, &[Value], &RowData) -> Result<Value, String> + Send + Sync>;

/// Registry of transforms available to field mappings
#[derive(Clone)]
pub struct TransformRegistry {
    transforms: HashMap<String, TransformFn>,
}

impl TransformRegistry {
    /// Registry without any transforms
    pub fn empty() -> Self {
        Self {
            transforms: HashMap::new(),
        }
    }

    /// Register (or replace) a transform
    pub fn register<F>(&mut self, name: impl Into<String>, transform: F)
    where
        F: Fn(&Value, &[Value], &RowData) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn apply(&self, transform: &TransformRef, value: &Value, row: &RowData) -> Result<Value, String> {
        let f = self
            .transforms
            .get(&transform.name)
            .ok_or_else(|| format!("unknown transform '{}'", transform.name))?;
        f(value, &transform.args, row)
    }
}

impl Default for TransformRegistry {
    /// Registry with the built-in transforms
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("trim", |v, _, _| Ok(map_str(v, |s| s.trim().to_string())));
        registry.register("lowercase", |v, _, _| Ok(map_str(v, str::to_lowercase)));
        registry.register("uppercase", |v, _, _| Ok(map_str(v, str::to_uppercase)));
        registry.register("null_if_empty", |v, _, _| {
            Ok(if is_blank(v) { Value::Null } else { v.clone() })
        });
        registry.register("integer", |v, _, _| to_integer(v));
        registry.register("decimal", |v, _, _| to_decimal(v));
        registry.register("boolean", |v, _, _| to_boolean(v));
        registry.register("date", |v, args, _| to_date(v, args));
        registry.register("default", |v, args, _| {
            Ok(if is_blank(v) {
                args.first().cloned().unwrap_or(Value::Null)
            } else {
                v.clone()
            })
        });
        registry.register("split", |v, args, _| split(v, args));
        registry
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("transforms", &self.names())
            .finish()
    }
}

fn map_str(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    }
}

fn to_integer(value: &Value) -> Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Value::from(f as i64)),
            _ => Err(format!("'{n}' is not an integer")),
        },
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("'{s}' is not an integer")),
        Value::Bool(b) => Ok(Value::from(i64::from(*b))),
        other => Err(format!("{other} is not an integer")),
    }
}

fn to_decimal(value: &Value) -> Result<Value, String> {
    match value {
        Value::Null | Value::Number(_) => Ok(value.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("'{s}' is not a number")),
        other => Err(format!("{other} is not a number")),
    }
}

pub(crate) fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn to_boolean(value: &Value) -> Result<Value, String> {
    match value {
        Value::Null | Value::Bool(_) => Ok(value.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Ok(Value::Bool(true)),
            Some(0) => Ok(Value::Bool(false)),
            _ => Err(format!("'{n}' is not a boolean")),
        },
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => parse_bool(s)
            .map(Value::Bool)
            .ok_or_else(|| format!("'{s}' is not a boolean")),
        other => Err(format!("{other} is not a boolean")),
    }
}

fn to_date(value: &Value, args: &[Value]) -> Result<Value, String> {
    let format = args.first().and_then(Value::as_str).unwrap_or("%Y-%m-%d");
    match value {
        Value::Null => Ok(Value::Null),
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => NaiveDate::parse_from_str(s.trim(), format)
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .map_err(|_| format!("'{s}' does not match the date format '{format}'")),
        other => Err(format!("{other} is not a date")),
    }
}

fn split(value: &Value, args: &[Value]) -> Result<Value, String> {
    let delimiter = args.first().and_then(Value::as_str).unwrap_or(",");
    if delimiter.is_empty() {
        return Err("split delimiter cannot be empty".to_string());
    }
    match value {
        Value::Null | Value::Array(_) => Ok(value.clone()),
        Value::String(s) => Ok(Value::Array(
            s.split(delimiter)
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        )),
        other => Ok(Value::Array(vec![other.clone()])),
    }
}
