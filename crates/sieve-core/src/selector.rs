//! Selector resolution over parsed documents.
//!
//! A [`Selector`] is compiled once at schema load into a [`CompiledSelector`]
//! (CSS parsed, XPath translated, regex compiled, JSONPath parsed). Resolution
//! walks the fallback chain: the first selector in the chain with at least one
//! match wins, later selectors are never merged in.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::AppError;
use crate::jsonpath::JsonPath;
use crate::validation::{MatchRules, SelectorValidation};
use crate::xpath;

static LD_JSON: LazyLock<scraper::Selector> = LazyLock::new(|| {
    scraper::Selector::parse(r#"script[type="application/ld+json"]"#).expect("static selector")
});

/// Selector language.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    #[default]
    Css,
    Xpath,
    Regex,
    Jsonpath,
    /// A CSS selector produced ahead of time by a [`SelectorSuggester`](crate::traits::SelectorSuggester).
    Ai,
}

impl SelectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorKind::Css => "css",
            SelectorKind::Xpath => "xpath",
            SelectorKind::Regex => "regex",
            SelectorKind::Jsonpath => "jsonpath",
            SelectorKind::Ai => "ai",
        }
    }
}

/// Declarative selector with an optional fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default)]
    pub kind: SelectorKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<Selector>>,
    /// Checked against whichever link of the chain matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<SelectorValidation>,
}

impl Selector {
    pub fn new(kind: SelectorKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            attribute: None,
            multiple: false,
            fallback: None,
            validation: None,
        }
    }

    pub fn css(value: impl Into<String>) -> Self {
        Self::new(SelectorKind::Css, value)
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn with_fallback(mut self, fallback: Selector) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn with_validation(mut self, validation: SelectorValidation) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// Accepts either a full selector object or a bare CSS string.
pub(crate) fn selector_or_css<'de, D>(deserializer: D) -> Result<Selector, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Css(String),
        Full(Selector),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Css(css) => Selector::css(css),
        Repr::Full(selector) => selector,
    })
}

pub(crate) fn optional_selector_or_css<'de, D>(deserializer: D) -> Result<Option<Selector>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "selector_or_css")] Selector);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(s)| s))
}

#[derive(Debug, Clone)]
enum Matcher {
    Css(scraper::Selector),
    Regex(Regex),
    JsonPath(JsonPath),
}

/// A validated, ready-to-run selector chain.
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    source: String,
    kind: SelectorKind,
    matcher: Matcher,
    attribute: Option<String>,
    multiple: bool,
    fallback: Option<Box<CompiledSelector>>,
    rules: Option<MatchRules>,
}

impl CompiledSelector {
    /// Compile `selector` and its whole fallback chain.
    pub fn compile(selector: &Selector) -> Result<Self, AppError> {
        let value = selector.value.trim();
        if value.is_empty() {
            return Err(AppError::SchemaValidation(format!(
                "empty {} selector",
                selector.kind.as_str()
            )));
        }

        let invalid = |msg: String| {
            AppError::SchemaValidation(format!(
                "invalid {} selector '{value}': {msg}",
                selector.kind.as_str()
            ))
        };

        let mut attribute = selector.attribute.clone();
        let matcher = match selector.kind {
            SelectorKind::Css | SelectorKind::Ai => Matcher::Css(parse_css(value).map_err(invalid)?),
            SelectorKind::Xpath => {
                let query = xpath::translate(value).map_err(invalid)?;
                if attribute.is_none() {
                    attribute = query.attribute;
                }
                Matcher::Css(parse_css(&query.css).map_err(invalid)?)
            }
            SelectorKind::Regex => {
                Matcher::Regex(Regex::new(value).map_err(|e| invalid(e.to_string()))?)
            }
            SelectorKind::Jsonpath => Matcher::JsonPath(JsonPath::parse(value).map_err(invalid)?),
        };

        let fallback = selector
            .fallback
            .as_deref()
            .map(CompiledSelector::compile)
            .transpose()?
            .map(Box::new);
        let rules = selector
            .validation
            .as_ref()
            .map(MatchRules::compile)
            .transpose()?;

        Ok(Self {
            source: value.to_string(),
            kind: selector.kind,
            matcher,
            attribute,
            multiple: selector.multiple,
            fallback,
            rules,
        })
    }

    /// The selector expression as written in the schema.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> SelectorKind {
        self.kind
    }

    pub fn attribute(&self) -> Option<&str> {
        self.attribute.as_deref()
    }

    pub fn is_multiple(&self) -> bool {
        self.multiple
    }

    pub fn fallback(&self) -> Option<&CompiledSelector> {
        self.fallback.as_deref()
    }

    fn matches<'a>(&self, container: &Node<'a>) -> Vec<Node<'a>> {
        match (&self.matcher, container) {
            (Matcher::Css(css), Node::Element(el)) => el.select(css).map(Node::Element).collect(),
            (Matcher::Css(_), _) => Vec::new(),
            (Matcher::Regex(re), node) => {
                let text = match node {
                    Node::Element(el) => el.text().collect::<String>(),
                    Node::Text(s) => s.clone(),
                    Node::Json(Value::String(s)) => s.clone(),
                    Node::Json(other) => other.to_string(),
                };
                re.captures_iter(&text)
                    .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                    .map(|m| Node::Text(m.as_str().to_string()))
                    .collect()
            }
            (Matcher::JsonPath(path), Node::Json(value)) => {
                path.evaluate(value).into_iter().map(Node::Json).collect()
            }
            (Matcher::JsonPath(path), Node::Text(s)) => serde_json::from_str::<Value>(s)
                .map(|value| path.evaluate(&value).into_iter().map(Node::Json).collect())
                .unwrap_or_default(),
            (Matcher::JsonPath(path), Node::Element(el)) => el
                .select(&LD_JSON)
                .filter_map(|script| {
                    serde_json::from_str::<Value>(&script.text().collect::<String>()).ok()
                })
                .flat_map(|value| path.evaluate(&value))
                .map(Node::Json)
                .collect(),
        }
    }
}

fn parse_css(css: &str) -> Result<scraper::Selector, String> {
    scraper::Selector::parse(css).map_err(|e| e.to_string())
}

/// A parsed page.
pub enum Document {
    Html(Html),
    Json(Value),
}

impl Document {
    /// Parse a response body. Bodies that are valid JSON objects or arrays
    /// become JSON documents, everything else is parsed as HTML.
    pub fn parse(body: &str) -> Self {
        let trimmed = body.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(value) = serde_json::from_str::<Value>(trimmed)
        {
            return Document::Json(value);
        }
        Document::Html(Html::parse_document(body))
    }

    pub fn root(&self) -> Node<'_> {
        match self {
            Document::Html(html) => Node::Element(html.root_element()),
            Document::Json(value) => Node::Json(value.clone()),
        }
    }
}

/// A matched node: an element, a regex capture, or a JSON value.
#[derive(Debug, Clone)]
pub enum Node<'a> {
    Element(ElementRef<'a>),
    Text(String),
    Json(Value),
}

impl Node<'_> {
    /// Whitespace-normalized text content.
    pub fn text(&self) -> String {
        match self {
            Node::Element(el) => normalize_whitespace(&el.text().collect::<String>()),
            Node::Text(s) => s.trim().to_string(),
            Node::Json(Value::String(s)) => s.clone(),
            Node::Json(Value::Null) => String::new(),
            Node::Json(other) => other.to_string(),
        }
    }

    pub fn inner_html(&self) -> String {
        match self {
            Node::Element(el) => el.inner_html(),
            other => other.text(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        match self {
            Node::Element(el) => el.value().attr(name).map(str::to_string),
            Node::Json(Value::Object(map)) => map.get(name).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            _ => None,
        }
    }
}

/// Resolve `selector` against `container`, walking the fallback chain.
///
/// Returns the matches of the first selector in the chain that matched
/// anything, truncated to one node unless the primary selector is
/// `multiple`. Zero matches everywhere yields an empty list.
pub fn resolve<'a>(container: &Node<'a>, selector: &CompiledSelector) -> Vec<Node<'a>> {
    resolve_matched(container, selector)
        .map(|(_, nodes)| nodes)
        .unwrap_or_default()
}

/// Like [`resolve`], also returning the link of the chain that matched.
pub fn resolve_matched<'a, 's>(
    container: &Node<'a>,
    selector: &'s CompiledSelector,
) -> Option<(&'s CompiledSelector, Vec<Node<'a>>)> {
    let (link, mut nodes) = resolve_chain(container, selector)?;
    if !selector.multiple {
        nodes.truncate(1);
    }
    Some((link, nodes))
}

/// Like [`resolve_matched`], enforcing the selector's match rules.
///
/// The count rule sees every match of the winning link before truncation,
/// the value rules see each kept node as extraction will read it.
pub fn resolve_checked<'a, 's>(
    container: &Node<'a>,
    selector: &'s CompiledSelector,
) -> Result<Option<(&'s CompiledSelector, Vec<Node<'a>>)>, String> {
    let Some(rules) = &selector.rules else {
        return Ok(resolve_matched(container, selector));
    };
    let Some((link, mut nodes)) = resolve_chain(container, selector) else {
        rules.check_count(0)?;
        return Ok(None);
    };
    rules.check_count(nodes.len())?;
    if !selector.multiple {
        nodes.truncate(1);
    }
    for node in &nodes {
        let raw = link
            .attribute
            .as_deref()
            .and_then(|name| node.attr(name))
            .unwrap_or_else(|| node.text());
        rules.check_value(&raw)?;
    }
    Ok(Some((link, nodes)))
}

fn resolve_chain<'a, 's>(
    container: &Node<'a>,
    selector: &'s CompiledSelector,
) -> Option<(&'s CompiledSelector, Vec<Node<'a>>)> {
    let mut current = Some(selector);
    while let Some(link) = current {
        let nodes = link.matches(container);
        if !nodes.is_empty() {
            return Some((link, nodes));
        }
        current = link.fallback.as_deref();
    }
    None
}

pub(crate) fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve `href` against `base`, keeping only http(s) results.
pub(crate) fn absolutize(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let joined = base.join(href).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}
