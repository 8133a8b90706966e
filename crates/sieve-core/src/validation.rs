//! Declarative value and match-count rules.
//!
//! [`FieldValidation`] constrains a field's final value, [`SelectorValidation`]
//! constrains what a selector matched. Both compile at schema load; a broken
//! rule (bad regex, inverted bounds) is a schema error, a violated rule is an
//! item error handled by the schema's error policy.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValidation {
    /// Same effect as `Field::required`.
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Shape a matched value must parse as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    String,
    Number,
    Integer,
    Boolean,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::String => "string",
            MatchType::Number => "number",
            MatchType::Integer => "integer",
            MatchType::Boolean => "boolean",
        }
    }

    fn accepts(self, raw: &str) -> bool {
        let raw = raw.trim();
        match self {
            MatchType::String => true,
            MatchType::Number => raw.replace(',', "").parse::<f64>().is_ok_and(f64::is_finite),
            MatchType::Integer => raw.replace(',', "").parse::<i64>().is_ok(),
            MatchType::Boolean => matches!(
                raw.to_ascii_lowercase().as_str(),
                "true" | "false" | "yes" | "no" | "1" | "0"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorValidation {
    /// At least one match. Shorthand for `minMatches: 1`.
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_matches: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_matches: Option<usize>,
    /// Every kept match must match this regex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<MatchType>,
}

fn compile_pattern(pattern: Option<&str>, what: &str) -> Result<Option<Regex>, AppError> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| {
                AppError::SchemaValidation(format!("invalid {what} pattern '{p}': {e}"))
            })
        })
        .transpose()
}

fn check_bounds(min: Option<usize>, max: Option<usize>, what: &str) -> Result<(), AppError> {
    match (min, max) {
        (Some(min), Some(max)) if min > max => Err(AppError::SchemaValidation(format!(
            "{what}: minimum ({min}) exceeds maximum ({max})"
        ))),
        _ => Ok(()),
    }
}

/// Compiled [`FieldValidation`].
#[derive(Debug, Clone)]
pub struct FieldRules {
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<Regex>,
}

impl FieldRules {
    pub fn compile(validation: &FieldValidation) -> Result<Self, AppError> {
        check_bounds(validation.min_length, validation.max_length, "length")?;
        Ok(Self {
            min_length: validation.min_length,
            max_length: validation.max_length,
            pattern: compile_pattern(validation.pattern.as_deref(), "field")?,
        })
    }

    /// Check a final field value. Arrays are checked element by element,
    /// nulls and nested records pass.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match value {
            Value::Null | Value::Object(_) => Ok(()),
            Value::Array(items) => items.iter().try_for_each(|item| self.check(item)),
            Value::String(s) => self.check_text(s),
            other => self.check_text(&other.to_string()),
        }
    }

    fn check_text(&self, text: &str) -> Result<(), String> {
        let len = text.chars().count();
        if let Some(min) = self.min_length
            && len < min
        {
            return Err(format!("length {len} is below {min}"));
        }
        if let Some(max) = self.max_length
            && len > max
        {
            return Err(format!("length {len} is above {max}"));
        }
        if let Some(re) = &self.pattern
            && !re.is_match(text)
        {
            return Err(format!("'{text}' does not match /{}/", re.as_str()));
        }
        Ok(())
    }
}

/// Compiled [`SelectorValidation`].
#[derive(Debug, Clone)]
pub struct MatchRules {
    min_matches: usize,
    max_matches: Option<usize>,
    pattern: Option<Regex>,
    data_type: Option<MatchType>,
}

impl MatchRules {
    pub fn compile(validation: &SelectorValidation) -> Result<Self, AppError> {
        check_bounds(validation.min_matches, validation.max_matches, "matches")?;
        let floor = usize::from(validation.required);
        Ok(Self {
            min_matches: validation.min_matches.unwrap_or(0).max(floor),
            max_matches: validation.max_matches,
            pattern: compile_pattern(validation.pattern.as_deref(), "selector")?,
            data_type: validation.data_type,
        })
    }

    /// Check the number of matches before any truncation.
    pub fn check_count(&self, count: usize) -> Result<(), String> {
        if count < self.min_matches {
            return Err(format!(
                "matched {count} node(s), expected at least {}",
                self.min_matches
            ));
        }
        if let Some(max) = self.max_matches
            && count > max
        {
            return Err(format!("matched {count} node(s), expected at most {max}"));
        }
        Ok(())
    }

    pub fn check_value(&self, raw: &str) -> Result<(), String> {
        if let Some(re) = &self.pattern
            && !re.is_match(raw)
        {
            return Err(format!("match '{raw}' does not match /{}/", re.as_str()));
        }
        if let Some(kind) = self.data_type
            && !kind.accepts(raw)
        {
            return Err(format!("match '{raw}' is not a valid {}", kind.as_str()));
        }
        Ok(())
    }
}
