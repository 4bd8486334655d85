//! Row validation rules
//!
//! Rules are checked against the raw source row before any transform runs.
//! Every rule except `required` passes on a blank value.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::definition::{resolve_header, IngestConfig};
use super::transform::parse_bool;
use crate::error::ConfigError;
use crate::types::{is_blank, scalar_text, RowData};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap()
});

/// One validation rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum ValidationRule {
    Required,
    Nullable,
    MinLength(usize),
    MaxLength(usize),
    Integer,
    Numeric,
    Boolean,
    Email,
    In(Vec<String>),
    Regex(String),
    Date(String),
}

/// Rules attached to one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRules {
    pub field: String,
    pub rules: Vec<ValidationRule>,
}

impl FieldRules {
    pub fn new(field: impl Into<String>, rules: Vec<ValidationRule>) -> Self {
        Self {
            field: field.into(),
            rules,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRule {
            field: self.field.clone(),
            reason,
        };
        if self.field.trim().is_empty() {
            return Err(invalid("field name is empty".to_string()));
        }
        for rule in &self.rules {
            match rule {
                ValidationRule::Regex(pattern) => {
                    Regex::new(pattern).map_err(|e| invalid(e.to_string()))?;
                },
                ValidationRule::In(options) if options.is_empty() => {
                    return Err(invalid("'in' needs at least one option".to_string()));
                },
                _ => {},
            }
        }
        Ok(())
    }
}

enum Check {
    Required,
    MinLength(usize),
    MaxLength(usize),
    Integer,
    Numeric,
    Boolean,
    Email,
    In(Vec<String>),
    Regex(Regex),
    Date(String),
}

struct CompiledField {
    field: String,
    headers: Vec<String>,
    checks: Vec<Check>,
}

/// Validation rules of one importer, compiled once per chunk
pub struct Validator {
    fields: Vec<CompiledField>,
}

impl Validator {
    pub fn compile(config: &IngestConfig) -> Result<Self, ConfigError> {
        let mut fields = Vec::new();
        for field_rules in config.effective_rules() {
            field_rules.validate()?;
            let checks = field_rules
                .rules
                .iter()
                .filter_map(|rule| {
                    Some(match rule {
                        ValidationRule::Nullable => return None,
                        ValidationRule::Required => Ok(Check::Required),
                        ValidationRule::MinLength(n) => Ok(Check::MinLength(*n)),
                        ValidationRule::MaxLength(n) => Ok(Check::MaxLength(*n)),
                        ValidationRule::Integer => Ok(Check::Integer),
                        ValidationRule::Numeric => Ok(Check::Numeric),
                        ValidationRule::Boolean => Ok(Check::Boolean),
                        ValidationRule::Email => Ok(Check::Email),
                        ValidationRule::In(options) => Ok(Check::In(options.clone())),
                        ValidationRule::Regex(pattern) => {
                            Regex::new(pattern).map(Check::Regex).map_err(|e| {
                                ConfigError::InvalidRule {
                                    field: field_rules.field.clone(),
                                    reason: e.to_string(),
                                }
                            })
                        },
                        ValidationRule::Date(format) => Ok(Check::Date(format.clone())),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            fields.push(CompiledField {
                field: field_rules.field.clone(),
                headers: config
                    .header_names_for(&field_rules.field)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                checks,
            });
        }
        Ok(Self { fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field -> messages; empty when the row passes
    pub fn validate(&self, row: &RowData) -> BTreeMap<String, Vec<String>> {
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for compiled in &self.fields {
            let headers: Vec<&str> = compiled.headers.iter().map(String::as_str).collect();
            let value = resolve_header(row, &headers).map(|(_, v)| v);
            let blank = value.map_or(true, is_blank);
            let label = compiled.field.replace('_', " ");

            for check in &compiled.checks {
                let message = match (check, value) {
                    (Check::Required, _) if blank => Some(format!("The {label} field is required.")),
                    (_, _) if blank => None,
                    (check, Some(value)) => check_value(check, value, &label),
                    (_, None) => None,
                };
                if let Some(message) = message {
                    let messages = errors.entry(compiled.field.clone()).or_default();
                    if !messages.contains(&message) {
                        messages.push(message);
                    }
                }
            }
        }

        errors
    }
}

fn check_value(check: &Check, value: &Value, label: &str) -> Option<String> {
    let text = scalar_text(value);
    let passes = match check {
        Check::Required => true,
        Check::MinLength(n) => length(value) >= *n,
        Check::MaxLength(n) => length(value) <= *n,
        Check::Integer => match value {
            Value::Number(n) => n.is_i64() || n.is_u64(),
            _ => text.is_some_and(|t| t.trim().parse::<i64>().is_ok()),
        },
        Check::Numeric => match value {
            Value::Number(_) => true,
            _ => text.is_some_and(|t| t.trim().parse::<f64>().is_ok_and(f64::is_finite)),
        },
        Check::Boolean => match value {
            Value::Bool(_) => true,
            _ => text.is_some_and(|t| parse_bool(&t).is_some()),
        },
        Check::Email => text.is_some_and(|t| EMAIL.is_match(t.trim())),
        Check::In(options) => text.is_some_and(|t| options.iter().any(|o| *o == t)),
        Check::Regex(re) => text.is_some_and(|t| re.is_match(&t)),
        Check::Date(format) => {
            text.is_some_and(|t| NaiveDate::parse_from_str(t.trim(), format).is_ok())
        },
    };
    if passes {
        return None;
    }

    Some(match check {
        Check::Required => format!("The {label} field is required."),
        Check::MinLength(n) => format!("The {label} field must be at least {n} characters."),
        Check::MaxLength(n) => {
            format!("The {label} field must not be greater than {n} characters.")
        },
        Check::Integer => format!("The {label} field must be an integer."),
        Check::Numeric => format!("The {label} field must be a number."),
        Check::Boolean => format!("The {label} field must be true or false."),
        Check::Email => format!("The {label} field must be a valid email address."),
        Check::In(_) => format!("The selected {label} is invalid."),
        Check::Regex(_) => format!("The {label} field format is invalid."),
        Check::Date(format) => format!("The {label} field must match the format {format}."),
    })
}

fn length(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        other => scalar_text(other).map_or(0, |t| t.chars().count()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::importer::definition::{FieldMapping, TargetEntity};
    use serde_json::json;

    fn row(value: Value) -> RowData {
        value.as_object().cloned().unwrap()
    }

    fn people() -> IngestConfig {
        let target = TargetEntity::new("people").rule("name", vec![ValidationRule::MinLength(2)]);
        IngestConfig::builder("people", "memory", target)
            .field(FieldMapping::new("E-Mail", "email"))
            .field(FieldMapping::new("full_name", "name"))
            .validate_field("email", vec![ValidationRule::Required, ValidationRule::Email])
            .validate_field("name", vec![ValidationRule::Required])
            .use_entity_rules(true)
            .build()
    }

    #[test]
    fn test_valid_row_has_no_errors() {
        let validator = Validator::compile(&people()).unwrap();
        let errors = validator.validate(&row(json!({
            "e-mail ": "ada@example.com",
            "full_name": "Ada"
        })));
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_declared_and_entity_rules_are_additive() {
        let validator = Validator::compile(&people()).unwrap();
        let errors = validator.validate(&row(json!({
            "E-Mail": "not-an-email",
            "full_name": "A"
        })));

        assert_eq!(
            errors["email"],
            vec!["The email field must be a valid email address."]
        );
        assert_eq!(
            errors["name"],
            vec!["The name field must be at least 2 characters."]
        );
    }

    #[test]
    fn test_missing_required_field() {
        let validator = Validator::compile(&people()).unwrap();
        let errors = validator.validate(&row(json!({ "full_name": "" })));
        assert_eq!(errors["email"], vec!["The email field is required."]);
        assert_eq!(errors["name"], vec!["The name field is required."]);
    }

    #[test]
    fn test_optional_rules_skip_blank_values() {
        let config = IngestConfig::builder("t", "memory", TargetEntity::new("t"))
            .validate_field(
                "age",
                vec![ValidationRule::Nullable, ValidationRule::Integer],
            )
            .validate_field("status", vec![ValidationRule::In(vec!["a".into(), "b".into()])])
            .build();
        let validator = Validator::compile(&config).unwrap();

        assert!(validator.validate(&row(json!({ "age": null }))).is_empty());
        let errors = validator.validate(&row(json!({ "age": "4.5", "status": "c" })));
        assert_eq!(errors["age"], vec!["The age field must be an integer."]);
        assert_eq!(errors["status"], vec!["The selected status is invalid."]);
    }

    #[test]
    fn test_numeric_rejects_non_finite_text() {
        let config = IngestConfig::builder("t", "memory", TargetEntity::new("t"))
            .validate_field("price", vec![ValidationRule::Numeric])
            .build();
        let validator = Validator::compile(&config).unwrap();

        for text in ["NaN", "inf", "-infinity", " Infinity "] {
            let errors = validator.validate(&row(json!({ "price": text })));
            assert_eq!(
                errors["price"],
                vec!["The price field must be a number."],
                "{text}"
            );
        }
        assert!(validator.validate(&row(json!({ "price": "1e3" }))).is_empty());
        assert!(validator.validate(&row(json!({ "price": 2.5 }))).is_empty());
    }

    #[test]
    fn test_invalid_regex_is_a_config_error() {
        let config = IngestConfig::builder("t", "memory", TargetEntity::new("t"))
            .validate_field("code", vec![ValidationRule::Regex("([a-z".into())])
            .build();
        assert!(matches!(
            Validator::compile(&config),
            Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_rule_serde_shape() {
        let rules: Vec<ValidationRule> = serde_json::from_value(json!([
            { "rule": "required" },
            { "rule": "max_length", "value": 10 },
            { "rule": "date", "value": "%Y-%m-%d" }
        ]))
        .unwrap();
        assert_eq!(
            rules,
            vec![
                ValidationRule::Required,
                ValidationRule::MaxLength(10),
                ValidationRule::Date("%Y-%m-%d".into())
            ]
        );
    }
}
