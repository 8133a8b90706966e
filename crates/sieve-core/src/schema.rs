//! Declarative extraction schema and its load-time validation.
//!
//! [`Schema`] is the serde-facing definition persisted by storage and read
//! from schema files. [`Schema::compile`] validates every selector, transform
//! and pagination rule up-front and produces a [`CompiledSchema`], so that a
//! malformed schema is rejected before any page is fetched.

use std::collections::{BTreeMap, HashSet};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::error::AppError;
use crate::selector::{CompiledSelector, Selector, optional_selector_or_css, selector_or_css};
use crate::transform::{CompiledTransform, Transform, TransformRegistry};
use crate::validation::{FieldRules, FieldValidation};

/// Placeholder substituted with the page number in URL patterns.
pub const PAGE_PLACEHOLDER: &str = "{page}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(default = "generate_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: Source,
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfig>,
    #[serde(default)]
    pub anti_detection: AntiDetectionConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<DataTransform>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// Item field used as identity when diffing two runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
}

/// Credentials attached to every request for a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer { token: String },
    Header { name: String, value: String },
}

impl Auth {
    /// The `(name, value)` header pair carrying these credentials.
    pub fn header(&self) -> (String, String) {
        match self {
            Auth::Basic { username, password } => (
                "Authorization".into(),
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))),
            ),
            Auth::Bearer { token } => ("Authorization".into(), format!("Bearer {token}")),
            Auth::Header { name, value } => (name.clone(), value.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Price,
    Date,
    Url,
    Image,
    Html,
    Attribute,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(deserialize_with = "selector_or_css")]
    pub selector: Selector,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transform: Vec<Transform>,
    /// Per-row cells. A field with children acts as a row container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<FieldValidation>,
}

impl Field {
    pub fn new(name: impl Into<String>, selector: Selector) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            field_type: FieldType::Text,
            selector,
            required: false,
            default_value: None,
            transform: Vec::new(),
            children: Vec::new(),
            validation: None,
        }
    }

    pub fn with_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform.push(transform);
        self
    }

    pub fn with_children(mut self, children: Vec<Field>) -> Self {
        self.children = children;
        self
    }

    pub fn with_validation(mut self, validation: FieldValidation) -> Self {
        self.validation = Some(validation);
        self
    }

    fn is_required(&self) -> bool {
        self.required || self.validation.as_ref().is_some_and(|v| v.required)
    }
}

/// A schema-level transform, applied after every field's own chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransform {
    /// Target field; all fields when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub transform: Transform,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationType {
    #[default]
    None,
    NextButton,
    LoadMore,
    InfiniteScroll,
    PageNumbers,
    UrlPattern,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationConfig {
    #[serde(rename = "type", default)]
    pub kind: PaginationType,
    /// Absolute ceiling on pages fetched per source URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(
        default,
        deserialize_with = "optional_selector_or_css",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_selector: Option<Selector>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub stop_condition: Vec<StopCondition>,
}

impl PaginationConfig {
    /// The `max_items` limit, if one is configured.
    pub fn max_items(&self) -> Option<u64> {
        self.stop_condition.iter().find_map(|c| match c {
            StopCondition::MaxItems { value } => Some(*value),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopCondition {
    MaxItems {
        value: u64,
    },
    NoResults,
    DuplicateData,
    SelectorMissing {
        #[serde(deserialize_with = "selector_or_css")]
        selector: Selector,
    },
}

impl StopCondition {
    /// Evaluation rank; lower wins.
    pub fn priority(&self) -> u8 {
        match self {
            StopCondition::MaxItems { .. } => 0,
            StopCondition::NoResults => 1,
            StopCondition::DuplicateData => 2,
            StopCondition::SelectorMissing { .. } => 3,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<StopCondition>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(StopCondition),
        Many(Vec<StopCondition>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(c)) => vec![c],
        Some(OneOrMany::Many(cs)) => cs,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionLevel {
    None,
    #[default]
    Low,
    Medium,
    High,
}

/// Inclusive delay range in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self {
            min: 1000,
            max: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiDetectionConfig {
    #[serde(default)]
    pub level: DetectionLevel,
    #[serde(default)]
    pub user_agent_rotation: bool,
    /// Rotation pool; the built-in pool is used when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_agents: Vec<String>,
    #[serde(default)]
    pub proxy_rotation: bool,
    #[serde(default)]
    pub delay: DelayRange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingRequiredPolicy {
    /// Drop the item, count an error and keep going.
    #[default]
    SkipItem,
    FailJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPolicy {
    #[serde(default)]
    pub on_missing_required: MissingRequiredPolicy,
    /// Back-to-back fetch failures that fail the job. `0` disables the limit.
    #[serde(default = "default_max_consecutive_fetch_errors")]
    pub max_consecutive_fetch_errors: u32,
}

fn default_max_consecutive_fetch_errors() -> u32 {
    3
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            on_missing_required: MissingRequiredPolicy::default(),
            max_consecutive_fetch_errors: default_max_consecutive_fetch_errors(),
        }
    }
}

impl Schema {
    pub fn new(name: impl Into<String>, urls: Vec<String>, fields: Vec<Field>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            name: name.into(),
            description: None,
            source: Source {
                urls,
                headers: BTreeMap::new(),
                auth: None,
            },
            fields,
            pagination: None,
            anti_detection: AntiDetectionConfig::default(),
            transforms: Vec::new(),
            error_policy: ErrorPolicy::default(),
            key_field: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn with_anti_detection(mut self, config: AntiDetectionConfig) -> Self {
        self.anti_detection = config;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, AppError> {
        serde_json::from_str(json)
            .map_err(|e| AppError::SchemaValidation(format!("Invalid schema JSON: {e}")))
    }

    /// Keys of an assembled item: page-level fields plus the cells of the
    /// row container, in schema order.
    pub fn item_field_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .flat_map(|f| {
                if f.children.is_empty() {
                    vec![f.name.as_str()]
                } else {
                    f.children.iter().map(|c| c.name.as_str()).collect()
                }
            })
            .collect()
    }

    /// Record an edit: bump `version` and `updatedAt`.
    pub fn revise(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Static headers plus the auth header, in a stable order.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .source
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(auth) = &self.source.auth {
            let (name, value) = auth.header();
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
            headers.push((name, value));
        }
        headers
    }

    /// Validate the whole schema and compile selectors and transforms.
    pub fn compile(&self, registry: &TransformRegistry) -> Result<CompiledSchema, AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::SchemaValidation("schema name is empty".into()));
        }
        if self.source.urls.is_empty() {
            return Err(AppError::SchemaValidation(
                "source.urls must list at least one URL".into(),
            ));
        }
        for url in &self.source.urls {
            validate_url(url)?;
        }
        if self.fields.is_empty() {
            return Err(AppError::SchemaValidation("schema has no fields".into()));
        }

        let delay = self.anti_detection.delay;
        if delay.min > delay.max {
            return Err(AppError::SchemaValidation(format!(
                "antiDetection.delay.min ({}) exceeds max ({})",
                delay.min, delay.max
            )));
        }

        let fields = compile_fields(&self.fields, registry, "")?;
        let item_keys = item_keys(&fields)?;

        if let Some(key) = &self.key_field
            && !item_keys.contains(key.as_str())
        {
            return Err(AppError::SchemaValidation(format!(
                "keyField '{key}' does not name an extracted field"
            )));
        }

        let transforms = self
            .transforms
            .iter()
            .map(|dt| {
                if let Some(field) = &dt.field
                    && !item_keys.contains(field.as_str())
                {
                    return Err(AppError::SchemaValidation(format!(
                        "transform targets unknown field '{field}'"
                    )));
                }
                Ok((dt.field.clone(), dt.transform.compile(registry)?))
            })
            .collect::<Result<Vec<_>, AppError>>()?;

        let (next_selector, stop_selectors) = match &self.pagination {
            Some(p) => self.compile_pagination(p)?,
            None => (None, Vec::new()),
        };

        Ok(CompiledSchema {
            schema: self.clone(),
            fields,
            transforms,
            next_selector,
            stop_selectors,
        })
    }

    fn compile_pagination(
        &self,
        p: &PaginationConfig,
    ) -> Result<(Option<CompiledSelector>, Vec<CompiledSelector>), AppError> {
        if p.max_pages == Some(0) {
            return Err(AppError::SchemaValidation(
                "pagination.maxPages must be at least 1".into(),
            ));
        }
        if let Some(pattern) = &p.url_pattern {
            if !pattern.contains(PAGE_PLACEHOLDER) {
                return Err(AppError::SchemaValidation(format!(
                    "pagination.urlPattern '{pattern}' has no {PAGE_PLACEHOLDER} placeholder"
                )));
            }
            validate_url(pattern)?;
        }

        match p.kind {
            PaginationType::UrlPattern => {
                let every_source_is_pattern = self
                    .source
                    .urls
                    .iter()
                    .all(|u| u.contains(PAGE_PLACEHOLDER));
                if p.url_pattern.is_none() && !every_source_is_pattern {
                    return Err(AppError::SchemaValidation(format!(
                        "url_pattern pagination needs pagination.urlPattern or {PAGE_PLACEHOLDER} in every source URL"
                    )));
                }
            }
            PaginationType::NextButton | PaginationType::LoadMore => {
                if p.next_selector.is_none() {
                    return Err(AppError::SchemaValidation(format!(
                        "{:?} pagination requires nextSelector",
                        p.kind
                    )));
                }
            }
            PaginationType::PageNumbers | PaginationType::InfiniteScroll => {
                if p.next_selector.is_none() && p.url_pattern.is_none() {
                    return Err(AppError::SchemaValidation(format!(
                        "{:?} pagination requires nextSelector or urlPattern",
                        p.kind
                    )));
                }
            }
            PaginationType::None => {}
        }

        let next = p
            .next_selector
            .as_ref()
            .map(CompiledSelector::compile)
            .transpose()?;
        let stops = p
            .stop_condition
            .iter()
            .filter_map(|c| match c {
                StopCondition::SelectorMissing { selector } => Some(selector),
                _ => None,
            })
            .map(CompiledSelector::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((next, stops))
    }
}

fn validate_url(raw: &str) -> Result<(), AppError> {
    let candidate = raw.replace(PAGE_PLACEHOLDER, "1");
    let url = Url::parse(&candidate)
        .map_err(|e| AppError::SchemaValidation(format!("invalid URL '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::SchemaValidation(format!(
            "URL '{raw}' must use http or https"
        )));
    }
    Ok(())
}

fn compile_fields(
    fields: &[Field],
    registry: &TransformRegistry,
    parent: &str,
) -> Result<Vec<CompiledField>, AppError> {
    let mut seen = HashSet::new();
    let mut containers = 0;
    let mut compiled = Vec::with_capacity(fields.len());

    for field in fields {
        let path = if parent.is_empty() {
            field.name.clone()
        } else {
            format!("{parent}.{}", field.name)
        };
        if field.name.trim().is_empty() {
            return Err(AppError::SchemaValidation(format!(
                "field under '{parent}' has an empty name"
            )));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(AppError::SchemaValidation(format!(
                "duplicate field name '{path}'"
            )));
        }
        if !field.children.is_empty() {
            containers += 1;
            if containers > 1 {
                return Err(AppError::SchemaValidation(format!(
                    "more than one row container field next to '{path}'"
                )));
            }
        }

        let selector = CompiledSelector::compile(&field.selector).map_err(|e| match e {
            AppError::SchemaValidation(msg) => {
                AppError::SchemaValidation(format!("field '{path}': {msg}"))
            }
            other => other,
        })?;
        let transforms = field
            .transform
            .iter()
            .map(|t| t.compile(registry))
            .collect::<Result<Vec<_>, _>>()?;
        let validation = field
            .validation
            .as_ref()
            .map(FieldRules::compile)
            .transpose()
            .map_err(|e| match e {
                AppError::SchemaValidation(msg) => {
                    AppError::SchemaValidation(format!("field '{path}': {msg}"))
                }
                other => other,
            })?;

        compiled.push(CompiledField {
            name: field.name.clone(),
            field_type: field.field_type,
            selector,
            required: field.is_required(),
            default_value: field.default_value.clone(),
            transforms,
            validation,
            children: compile_fields(&field.children, registry, &path)?,
        });
    }

    Ok(compiled)
}

/// Keys of an assembled top-level item: page-level fields plus the cells of
/// the row container, all of which must be distinct.
fn item_keys(fields: &[CompiledField]) -> Result<HashSet<&str>, AppError> {
    let mut keys = HashSet::new();
    for field in fields {
        let names: Vec<&str> = if field.is_row_container() {
            field.children.iter().map(|c| c.name.as_str()).collect()
        } else {
            vec![field.name.as_str()]
        };
        for name in names {
            if !keys.insert(name) {
                return Err(AppError::SchemaValidation(format!(
                    "row cell '{name}' collides with a page-level field"
                )));
            }
        }
    }
    Ok(keys)
}

/// A validated field ready for extraction.
#[derive(Debug, Clone)]
pub struct CompiledField {
    pub name: String,
    pub field_type: FieldType,
    pub selector: CompiledSelector,
    pub required: bool,
    pub default_value: Option<Value>,
    pub transforms: Vec<CompiledTransform>,
    /// Checked against the final value, after transforms.
    pub validation: Option<FieldRules>,
    pub children: Vec<CompiledField>,
}

impl CompiledField {
    pub fn is_row_container(&self) -> bool {
        !self.children.is_empty()
    }
}

/// A schema that passed validation.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    schema: Schema,
    pub fields: Vec<CompiledField>,
    /// Schema-level transforms with their optional target field.
    pub transforms: Vec<(Option<String>, CompiledTransform)>,
    pub next_selector: Option<CompiledSelector>,
    pub stop_selectors: Vec<CompiledSelector>,
}

impl CompiledSchema {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn pagination(&self) -> PaginationConfig {
        self.schema.pagination.clone().unwrap_or_default()
    }

    /// The top-level row container, if any.
    pub fn row_container(&self) -> Option<&CompiledField> {
        self.fields.iter().find(|f| f.is_row_container())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::SelectorKind;
    use serde_json::json;

    fn schema_json() -> Value {
        json!({
            "id": "books",
            "name": "Books",
            "source": {
                "urls": ["https://ex.com/list?page={page}"],
                "headers": {"X-Token": "abc"},
                "auth": {"type": "basic", "username": "user", "password": "pass"}
            },
            "fields": [
                {"name": "title", "selector": {"value": ".item .title", "multiple": true}, "required": true},
                {"name": "price", "type": "price", "selector": ".item .price",
                 "transform": [{"type": "trim"}]}
            ],
            "pagination": {
                "type": "url_pattern",
                "maxPages": 2,
                "stopCondition": {"type": "max_items", "value": 50}
            },
            "antiDetection": {"level": "medium", "userAgentRotation": true, "delay": {"min": 0, "max": 0}},
            "keyField": "title"
        })
    }

    fn parse(v: Value) -> Schema {
        serde_json::from_value(v).unwrap()
    }

    fn compile_err(v: Value) -> String {
        match parse(v).compile(&TransformRegistry::new()) {
            Err(AppError::SchemaValidation(msg)) => msg,
            Err(other) => panic!("unexpected error kind: {other}"),
            Ok(_) => panic!("schema should have been rejected"),
        }
    }

    #[test]
    fn test_parse_full_schema() {
        let schema = parse(schema_json());
        assert_eq!(schema.version, 1);
        assert_eq!(schema.fields[0].selector.kind, SelectorKind::Css);
        assert!(schema.fields[0].selector.multiple);
        assert_eq!(schema.fields[1].field_type, FieldType::Price);
        assert_eq!(schema.fields[1].selector, Selector::css(".item .price"));
        let pagination = schema.pagination.as_ref().unwrap();
        assert_eq!(pagination.kind, PaginationType::UrlPattern);
        assert_eq!(pagination.max_items(), Some(50));
        assert_eq!(schema.anti_detection.level, DetectionLevel::Medium);
        assert_eq!(schema.error_policy, ErrorPolicy::default());

        let compiled = schema.compile(&TransformRegistry::new()).unwrap();
        assert_eq!(compiled.fields.len(), 2);
        assert!(compiled.row_container().is_none());
    }

    #[test]
    fn test_stop_condition_accepts_list() {
        let mut v = schema_json();
        v["pagination"]["stopCondition"] = json!([
            {"type": "no_results"},
            {"type": "selector_missing", "selector": ".results"}
        ]);
        let schema = parse(v);
        let conditions = &schema.pagination.as_ref().unwrap().stop_condition;
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[1].priority(), 3);

        let compiled = schema.compile(&TransformRegistry::new()).unwrap();
        assert_eq!(compiled.stop_selectors.len(), 1);
    }

    #[test]
    fn test_serialization_roundtrip_keeps_camel_case() {
        let schema = parse(schema_json());
        let v = serde_json::to_value(&schema).unwrap();
        assert!(v.get("antiDetection").is_some());
        assert!(v.get("errorPolicy").is_some());
        assert_eq!(v["pagination"]["maxPages"], 2);
        let back: Schema = serde_json::from_value(v).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn test_request_headers_include_auth() {
        let schema = parse(schema_json());
        let headers = schema.request_headers();
        assert!(headers.contains(&("X-Token".into(), "abc".into())));
        assert!(headers.contains(&("Authorization".into(), "Basic dXNlcjpwYXNz".into())));

        let bearer = Auth::Bearer { token: "t0k".into() };
        assert_eq!(bearer.header().1, "Bearer t0k");
    }

    #[test]
    fn test_revise_bumps_version() {
        let mut schema = parse(schema_json());
        let before = schema.updated_at;
        schema.revise();
        assert_eq!(schema.version, 2);
        assert!(schema.updated_at >= before);
    }

    #[test]
    fn test_rejects_bad_selector_before_fetching() {
        let mut v = schema_json();
        v["fields"][0]["selector"]["value"] = json!("div[");
        assert!(compile_err(v).contains("title"));
    }

    #[test]
    fn test_rejects_bad_transform_params() {
        let mut v = schema_json();
        v["fields"][1]["transform"] = json!([{"type": "regex_replace", "pattern": "(", "replace": ""}]);
        let err = parse(v).compile(&TransformRegistry::new()).unwrap_err();
        assert!(matches!(err, AppError::Transform { .. } | AppError::SchemaValidation(_)));
    }

    #[test]
    fn test_rejects_unknown_custom_transform() {
        let mut v = schema_json();
        v["transforms"] = json!([{"transform": {"type": "custom", "name": "slugify"}}]);
        assert!(parse(v.clone()).compile(&TransformRegistry::new()).is_err());

        let registry = TransformRegistry::new().register("slugify", |s| Ok(s.replace(' ', "-")));
        assert!(parse(v).compile(&registry).is_ok());
    }

    #[test]
    fn test_rejects_inverted_delay() {
        let mut v = schema_json();
        v["antiDetection"]["delay"] = json!({"min": 500, "max": 100});
        assert!(compile_err(v).contains("delay"));
    }

    #[test]
    fn test_rejects_url_pattern_without_placeholder() {
        let mut v = schema_json();
        v["source"]["urls"] = json!(["https://ex.com/list"]);
        assert!(compile_err(v.clone()).contains("{page}"));

        v["pagination"]["urlPattern"] = json!("https://ex.com/list?p=2");
        assert!(compile_err(v).contains("placeholder"));
    }

    #[test]
    fn test_next_button_requires_selector() {
        let mut v = schema_json();
        v["pagination"] = json!({"type": "next_button"});
        assert!(compile_err(v.clone()).contains("nextSelector"));

        v["pagination"]["nextSelector"] = json!("a.next");
        assert!(parse(v).compile(&TransformRegistry::new()).is_ok());
    }

    #[test]
    fn test_rejects_duplicate_and_colliding_fields() {
        let mut v = schema_json();
        v["fields"][1]["name"] = json!("title");
        assert!(compile_err(v).contains("duplicate"));

        let mut v = schema_json();
        v["fields"] = json!([
            {"name": "shop", "selector": "h1"},
            {"name": "rows", "selector": {"value": ".row", "multiple": true}, "children": [
                {"name": "shop", "selector": ".shop"}
            ]}
        ]);
        v["keyField"] = Value::Null;
        assert!(compile_err(v).contains("collides"));
    }

    #[test]
    fn test_rejects_two_row_containers() {
        let mut v = schema_json();
        v["keyField"] = Value::Null;
        v["fields"] = json!([
            {"name": "a", "selector": ".a", "children": [{"name": "x", "selector": ".x"}]},
            {"name": "b", "selector": ".b", "children": [{"name": "y", "selector": ".y"}]}
        ]);
        assert!(compile_err(v).contains("row container"));
    }

    #[test]
    fn test_key_field_must_exist() {
        let mut v = schema_json();
        v["keyField"] = json!("isbn");
        assert!(compile_err(v).contains("isbn"));
    }

    #[test]
    fn test_rejects_non_http_source() {
        let mut v = schema_json();
        v["source"]["urls"] = json!(["ftp://ex.com/{page}"]);
        assert!(compile_err(v).contains("http"));
    }

    #[test]
    fn test_validation_blocks_parse_and_compile() {
        let mut v = schema_json();
        v["fields"][1]["validation"] = json!({"required": true, "minLength": 1, "pattern": "^\\d"});
        v["fields"][0]["selector"]["validation"] = json!({"minMatches": 1, "dataType": "string"});
        let schema = parse(v);
        assert_eq!(schema.fields[1].validation.as_ref().unwrap().min_length, Some(1));
        assert!(schema.fields[0].selector.validation.is_some());

        let compiled = schema.compile(&TransformRegistry::new()).unwrap();
        assert!(compiled.fields[1].required);
        assert!(compiled.fields[1].validation.is_some());

        let mut v = schema_json();
        v["fields"][1]["validation"] = json!({"minLength": 5, "maxLength": 2});
        assert!(compile_err(v).contains("field 'price'"));
    }

    #[test]
    fn test_item_field_names_flatten_row_container() {
        let mut v = schema_json();
        v["keyField"] = Value::Null;
        v["fields"] = json!([
            {"name": "shop", "selector": "h1"},
            {"name": "rows", "selector": {"value": ".row", "multiple": true}, "children": [
                {"name": "title", "selector": ".t"},
                {"name": "price", "selector": ".p"}
            ]}
        ]);
        assert_eq!(parse(v).item_field_names(), vec!["shop", "title", "price"]);
    }
}
