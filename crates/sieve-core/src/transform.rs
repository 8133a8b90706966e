//! Ordered, pure value transformations applied after selector resolution.
//!
//! A [`Transform`] is the declarative, serde-facing form stored in a schema.
//! [`Transform::compile`] validates its parameters (regexes, date formats,
//! custom function names) once at schema-load time and produces a
//! [`CompiledTransform`], which never fails on shape at execution time.
//! Execution failures (type-incompatible input) degrade: the step's input
//! passes through unchanged and the error is reported as a warning.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use chrono::format::{Item, StrftimeItems};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

/// Date formats tried by `parse_date` when no input format is configured.
const COMMON_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%m-%d-%Y",
    "%d-%m-%Y",
];

static NUMBER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d[\d,]*(?:\.\d+)?").expect("static regex"));

/// A single declarative transform step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    Trim,
    Lowercase,
    Uppercase,
    RemoveHtml,
    ExtractNumber,
    RegexReplace {
        pattern: String,
        replace: String,
    },
    Replace {
        search: String,
        replacement: String,
    },
    Extract {
        pattern: String,
        #[serde(default = "default_group")]
        group: usize,
    },
    ParseDate {
        #[serde(default, rename = "inputFormat")]
        input_format: Option<String>,
        #[serde(default = "default_output_format", rename = "outputFormat")]
        output_format: String,
    },
    Split {
        delimiter: String,
        #[serde(default = "default_true")]
        trim: bool,
    },
    Join {
        delimiter: String,
    },
    Format {
        template: String,
    },
    Custom {
        name: String,
    },
}

fn default_group() -> usize {
    1
}

fn default_output_format() -> String {
    "%Y-%m-%d".to_string()
}

fn default_true() -> bool {
    true
}

impl Transform {
    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Transform::Trim => "trim",
            Transform::Lowercase => "lowercase",
            Transform::Uppercase => "uppercase",
            Transform::RemoveHtml => "remove_html",
            Transform::ExtractNumber => "extract_number",
            Transform::RegexReplace { .. } => "regex_replace",
            Transform::Replace { .. } => "replace",
            Transform::Extract { .. } => "extract",
            Transform::ParseDate { .. } => "parse_date",
            Transform::Split { .. } => "split",
            Transform::Join { .. } => "join",
            Transform::Format { .. } => "format",
            Transform::Custom { .. } => "custom",
        }
    }

    /// Validate parameters and build the executable form.
    pub fn compile(&self, registry: &TransformRegistry) -> Result<CompiledTransform, AppError> {
        let invalid = |msg: String| {
            AppError::SchemaValidation(format!("transform '{}': {msg}", self.kind()))
        };

        let compiled = match self {
            Transform::Trim => CompiledTransform::Trim,
            Transform::Lowercase => CompiledTransform::Lowercase,
            Transform::Uppercase => CompiledTransform::Uppercase,
            Transform::RemoveHtml => CompiledTransform::RemoveHtml,
            Transform::ExtractNumber => CompiledTransform::ExtractNumber,
            Transform::RegexReplace { pattern, replace } => {
                let regex =
                    Regex::new(pattern).map_err(|e| invalid(format!("invalid pattern: {e}")))?;
                CompiledTransform::RegexReplace {
                    regex,
                    replace: replace.clone(),
                }
            }
            Transform::Replace {
                search,
                replacement,
            } => {
                if search.is_empty() {
                    return Err(invalid("'search' must not be empty".into()));
                }
                CompiledTransform::Replace {
                    search: search.clone(),
                    replacement: replacement.clone(),
                }
            }
            Transform::Extract { pattern, group } => {
                let regex =
                    Regex::new(pattern).map_err(|e| invalid(format!("invalid pattern: {e}")))?;
                // captures_len counts the implicit whole-match group 0
                if *group >= regex.captures_len() {
                    return Err(invalid(format!(
                        "group {group} out of range, pattern has {} groups",
                        regex.captures_len() - 1
                    )));
                }
                CompiledTransform::Extract {
                    regex,
                    group: *group,
                }
            }
            Transform::ParseDate {
                input_format,
                output_format,
            } => {
                if let Some(fmt) = input_format {
                    validate_strftime(fmt).map_err(invalid)?;
                }
                validate_strftime(output_format).map_err(invalid)?;
                CompiledTransform::ParseDate {
                    input_format: input_format.clone(),
                    output_format: output_format.clone(),
                }
            }
            Transform::Split { delimiter, trim } => {
                if delimiter.is_empty() {
                    return Err(invalid("'delimiter' must not be empty".into()));
                }
                CompiledTransform::Split {
                    delimiter: delimiter.clone(),
                    trim: *trim,
                }
            }
            Transform::Join { delimiter } => CompiledTransform::Join {
                delimiter: delimiter.clone(),
            },
            Transform::Format { template } => {
                if !template.contains("{value}") {
                    return Err(invalid("template must contain '{value}'".into()));
                }
                CompiledTransform::Format {
                    template: template.clone(),
                }
            }
            Transform::Custom { name } => {
                let func = registry
                    .get(name)
                    .ok_or_else(|| invalid(format!("no custom transform registered as '{name}'")))?;
                CompiledTransform::Custom {
                    name: name.clone(),
                    func,
                }
            }
        };

        Ok(compiled)
    }
}

fn validate_strftime(fmt: &str) -> Result<(), String> {
    if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid date format '{fmt}'"));
    }
    Ok(())
}

/// Signature of a user-registered transform over string values.
pub type CustomTransformFn = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;

/// Named custom transforms available to `custom` steps.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    functions: HashMap<String, CustomTransformFn>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
        self
    }

    pub fn get(&self, name: &str) -> Option<CustomTransformFn> {
        self.functions.get(name).cloned()
    }
}

impl fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry")
            .field("functions", &names)
            .finish()
    }
}

/// Executable transform step with validated parameters.
#[derive(Clone)]
pub enum CompiledTransform {
    Trim,
    Lowercase,
    Uppercase,
    RemoveHtml,
    ExtractNumber,
    RegexReplace {
        regex: Regex,
        replace: String,
    },
    Replace {
        search: String,
        replacement: String,
    },
    Extract {
        regex: Regex,
        group: usize,
    },
    ParseDate {
        input_format: Option<String>,
        output_format: String,
    },
    Split {
        delimiter: String,
        trim: bool,
    },
    Join {
        delimiter: String,
    },
    Format {
        template: String,
    },
    Custom {
        name: String,
        func: CustomTransformFn,
    },
}

impl fmt::Debug for CompiledTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompiledTransform::Custom { name, .. } => write!(f, "Custom({name})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

impl CompiledTransform {
    pub fn kind(&self) -> &'static str {
        match self {
            CompiledTransform::Trim => "trim",
            CompiledTransform::Lowercase => "lowercase",
            CompiledTransform::Uppercase => "uppercase",
            CompiledTransform::RemoveHtml => "remove_html",
            CompiledTransform::ExtractNumber => "extract_number",
            CompiledTransform::RegexReplace { .. } => "regex_replace",
            CompiledTransform::Replace { .. } => "replace",
            CompiledTransform::Extract { .. } => "extract",
            CompiledTransform::ParseDate { .. } => "parse_date",
            CompiledTransform::Split { .. } => "split",
            CompiledTransform::Join { .. } => "join",
            CompiledTransform::Format { .. } => "format",
            CompiledTransform::Custom { .. } => "custom",
        }
    }

    /// Apply this step. String-only steps leave non-string values untouched.
    pub fn apply(&self, value: &Value) -> Result<Value, AppError> {
        let fail = |message: String| AppError::Transform {
            transform: self.kind().to_string(),
            message,
        };

        // `join` is the only step that reads arrays.
        if let (CompiledTransform::Join { delimiter }, Some(items)) = (self, value.as_array()) {
            let parts: Vec<String> = items.iter().map(value_to_text).collect();
            return Ok(Value::String(parts.join(delimiter)));
        }

        let Some(s) = value.as_str() else {
            return Ok(value.clone());
        };

        let out = match self {
            CompiledTransform::Trim => Value::String(s.trim().to_string()),
            CompiledTransform::Lowercase => Value::String(s.to_lowercase()),
            CompiledTransform::Uppercase => Value::String(s.to_uppercase()),
            CompiledTransform::RemoveHtml => Value::String(strip_html(s)),
            CompiledTransform::ExtractNumber => {
                parse_number(s).ok_or_else(|| fail(format!("no number found in {s:?}")))?
            }
            CompiledTransform::RegexReplace { regex, replace } => {
                Value::String(regex.replace_all(s, replace.as_str()).into_owned())
            }
            CompiledTransform::Replace {
                search,
                replacement,
            } => Value::String(s.replace(search.as_str(), replacement)),
            CompiledTransform::Extract { regex, group } => {
                let caps = regex
                    .captures(s)
                    .ok_or_else(|| fail(format!("pattern did not match {s:?}")))?;
                let m = caps
                    .get(*group)
                    .ok_or_else(|| fail(format!("group {group} did not participate")))?;
                Value::String(m.as_str().to_string())
            }
            CompiledTransform::ParseDate {
                input_format,
                output_format,
            } => {
                let trimmed = s.trim();
                let formats: Vec<&str> = match input_format {
                    Some(fmt) => vec![fmt.as_str()],
                    None => COMMON_DATE_FORMATS.to_vec(),
                };
                let date = formats
                    .iter()
                    .find_map(|fmt| chrono::NaiveDate::parse_from_str(trimmed, fmt).ok())
                    .ok_or_else(|| fail(format!("unrecognised date {trimmed:?}")))?;
                Value::String(date.format(output_format).to_string())
            }
            CompiledTransform::Split { delimiter, trim } => Value::Array(
                s.split(delimiter.as_str())
                    .map(|part| {
                        let part = if *trim { part.trim() } else { part };
                        Value::String(part.to_string())
                    })
                    .collect(),
            ),
            CompiledTransform::Custom { name, func } => {
                Value::String(func(s).map_err(|e| fail(format!("{name}: {e}")))?)
            }
            CompiledTransform::Format { template } => Value::String(template.replace("{value}", s)),
            // Already a single string.
            CompiledTransform::Join { .. } => Value::String(s.to_string()),
        };

        Ok(out)
    }
}

/// Result of running a transform chain.
#[derive(Debug)]
pub struct ChainOutcome {
    pub value: Value,
    /// One entry per degraded step.
    pub warnings: Vec<AppError>,
}

/// Apply `steps` strictly in order, each receiving the previous output.
///
/// A failing step is skipped: its input flows on to the next step and the
/// error is collected as a warning.
pub fn apply_chain(value: Value, steps: &[CompiledTransform]) -> ChainOutcome {
    let mut current = value;
    let mut warnings = Vec::new();

    for step in steps {
        match step.apply(&current) {
            Ok(next) => current = next,
            Err(e) => warnings.push(e),
        }
    }

    ChainOutcome {
        value: current,
        warnings,
    }
}

/// Parse the first numeric token of `s` into a JSON number.
///
/// Thousands separators (`,`) are dropped; tokens with a decimal point
/// become floats, others integers.
pub(crate) fn parse_number(s: &str) -> Option<Value> {
    let token = NUMBER_TOKEN.find(s)?.as_str().replace(',', "");
    if token.contains('.') {
        let f: f64 = token.parse().ok()?;
        serde_json::Number::from_f64(f).map(Value::Number)
    } else {
        token.parse::<i64>().ok().map(Value::from)
    }
}

/// Plain-text rendering of a value (strings unquoted, null empty).
pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn strip_html(s: &str) -> String {
    let fragment = scraper::Html::parse_fragment(s);
    let text: String = fragment.root_element().text().collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(t: Transform) -> CompiledTransform {
        t.compile(&TransformRegistry::new()).unwrap()
    }

    #[test]
    fn test_chain_applies_in_declared_order() {
        let steps = vec![
            compile(Transform::Trim),
            compile(Transform::Replace {
                search: "USD".into(),
                replacement: "$".into(),
            }),
            compile(Transform::Lowercase),
        ];
        let out = apply_chain(json!("  Price USD 10  "), &steps);
        assert_eq!(out.value, json!("price $ 10"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_order_matters() {
        let upper_then_replace = vec![
            compile(Transform::Uppercase),
            compile(Transform::Replace {
                search: "a".into(),
                replacement: "x".into(),
            }),
        ];
        let replace_then_upper = vec![
            compile(Transform::Replace {
                search: "a".into(),
                replacement: "x".into(),
            }),
            compile(Transform::Uppercase),
        ];
        assert_eq!(apply_chain(json!("abc"), &upper_then_replace).value, json!("ABC"));
        assert_eq!(apply_chain(json!("abc"), &replace_then_upper).value, json!("XBC"));
    }

    #[test]
    fn test_non_string_inputs_pass_through() {
        let steps = vec![
            compile(Transform::Trim),
            compile(Transform::Uppercase),
            compile(Transform::ExtractNumber),
        ];
        let out = apply_chain(json!(42.5), &steps);
        assert_eq!(out.value, json!(42.5));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_extract_number_parses_prices() {
        let t = compile(Transform::ExtractNumber);
        assert_eq!(t.apply(&json!("$1,299.99")).unwrap(), json!(1299.99));
        assert_eq!(t.apply(&json!("Qty: 12 units")).unwrap(), json!(12));
        assert_eq!(t.apply(&json!("-3 degrees")).unwrap(), json!(-3));
    }

    #[test]
    fn test_failing_step_degrades_to_its_input() {
        let steps = vec![
            compile(Transform::Trim),
            compile(Transform::ExtractNumber),
            compile(Transform::Uppercase),
        ];
        let out = apply_chain(json!("  sold out "), &steps);
        assert_eq!(out.value, json!("SOLD OUT"));
        assert_eq!(out.warnings.len(), 1);
        assert!(matches!(
            &out.warnings[0],
            AppError::Transform { transform, .. } if transform == "extract_number"
        ));
    }

    #[test]
    fn test_regex_replace_uses_capture_groups() {
        let t = compile(Transform::RegexReplace {
            pattern: r"(\d+)-(\d+)".into(),
            replace: "$2/$1".into(),
        });
        assert_eq!(t.apply(&json!("10-20")).unwrap(), json!("20/10"));
    }

    #[test]
    fn test_remove_html_strips_tags() {
        let t = compile(Transform::RemoveHtml);
        assert_eq!(
            t.apply(&json!("<p>Hello <b>big</b>\n world</p>")).unwrap(),
            json!("Hello big world")
        );
    }

    #[test]
    fn test_extract_picks_group() {
        let t = compile(Transform::Extract {
            pattern: r"SKU-(\w+)".into(),
            group: 1,
        });
        assert_eq!(t.apply(&json!("item SKU-A12 new")).unwrap(), json!("A12"));
        assert!(t.apply(&json!("no sku here")).is_err());
    }

    #[test]
    fn test_parse_date_tries_common_formats() {
        let t = compile(Transform::ParseDate {
            input_format: None,
            output_format: "%Y-%m-%d".into(),
        });
        assert_eq!(t.apply(&json!("March 5, 2024")).unwrap(), json!("2024-03-05"));
        assert_eq!(t.apply(&json!("2024/03/05")).unwrap(), json!("2024-03-05"));
        assert!(t.apply(&json!("yesterday")).is_err());
    }

    #[test]
    fn test_split_then_join_round_trips_shape() {
        let steps = vec![
            compile(Transform::Split {
                delimiter: ",".into(),
                trim: true,
            }),
            compile(Transform::Join {
                delimiter: " | ".into(),
            }),
        ];
        assert_eq!(apply_chain(json!("a, b ,c"), &steps).value, json!("a | b | c"));
    }

    #[test]
    fn test_format_wraps_value() {
        let t = compile(Transform::Format {
            template: "https://ex.com{value}".into(),
        });
        assert_eq!(t.apply(&json!("/p/1")).unwrap(), json!("https://ex.com/p/1"));
        assert_eq!(t.apply(&json!(7)).unwrap(), json!(7));
        assert_eq!(t.apply(&Value::Null).unwrap(), Value::Null);
        assert_eq!(t.apply(&json!(["/a"])).unwrap(), json!(["/a"]));
    }

    #[test]
    fn test_custom_transform_from_registry() {
        let registry = TransformRegistry::new().register("reverse", |s: &str| {
            Ok(s.chars().rev().collect())
        });
        let t = Transform::Custom {
            name: "reverse".into(),
        }
        .compile(&registry)
        .unwrap();
        assert_eq!(t.apply(&json!("abc")).unwrap(), json!("cba"));
    }

    #[test]
    fn test_malformed_params_rejected_at_compile_time() {
        let registry = TransformRegistry::new();
        assert!(
            Transform::RegexReplace {
                pattern: "(unclosed".into(),
                replace: String::new(),
            }
            .compile(&registry)
            .is_err()
        );
        assert!(
            Transform::Extract {
                pattern: r"\d+".into(),
                group: 1,
            }
            .compile(&registry)
            .is_err()
        );
        assert!(
            Transform::Format {
                template: "no placeholder".into(),
            }
            .compile(&registry)
            .is_err()
        );
        assert!(
            Transform::Custom {
                name: "missing".into(),
            }
            .compile(&registry)
            .is_err()
        );
        assert!(
            Transform::ParseDate {
                input_format: Some("%Q".into()),
                output_format: "%Y".into(),
            }
            .compile(&registry)
            .is_err()
        );
    }

    #[test]
    fn test_deserializes_tagged_variants() {
        let t: Transform =
            serde_json::from_value(json!({"type": "regex_replace", "pattern": "a", "replace": "b"}))
                .unwrap();
        assert_eq!(
            t,
            Transform::RegexReplace {
                pattern: "a".into(),
                replace: "b".into()
            }
        );
        let missing: Result<Transform, _> =
            serde_json::from_value(json!({"type": "replace", "search": "a"}));
        assert!(missing.is_err());
    }
}
