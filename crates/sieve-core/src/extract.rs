//! Turning one fetched page into item records.
//!
//! Extraction is synchronous: `scraper::Html` is not `Send`, so the
//! orchestrator runs [`extract_page`] on the blocking pool. The body is parsed
//! once and every selector runs over that single document, copying what it
//! matched into owned values. Row containers with many rows then fan the
//! coercion, transform and validation work out over scoped threads in
//! contiguous chunks, re-joined in row order.

use std::thread;

use serde_json::{Map, Value};
use url::Url;

use crate::error::AppError;
use crate::schema::{CompiledField, CompiledSchema, FieldType};
use crate::selector::{Document, Node, absolutize, resolve, resolve_checked, resolve_matched};
use crate::transform::{apply_chain, parse_number};

/// A transform that degraded while extracting one field of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWarning {
    pub field: String,
    pub message: String,
}

/// One assembled item, or the reason it was aborted.
#[derive(Debug)]
pub struct RowResult {
    pub data: Result<Map<String, Value>, AppError>,
    pub warnings: Vec<FieldWarning>,
}

/// A candidate next-page link found by the pagination selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLink {
    pub label: String,
    pub href: String,
}

/// What the page says about pagination.
#[derive(Debug, Clone, Default)]
pub struct LinkSignals {
    pub links: Vec<PageLink>,
    /// The next selector matched at all (a load-more button may carry no href).
    pub next_present: bool,
    /// A `selector_missing` stop selector matched nothing.
    pub stop_selector_missing: bool,
}

#[derive(Debug)]
pub struct PageExtraction {
    /// Items in page-then-row order; records whose values are all null are dropped.
    pub rows: Vec<RowResult>,
    pub signals: LinkSignals,
}

impl PageExtraction {
    pub fn item_count(&self) -> usize {
        self.rows.iter().filter(|r| r.data.is_ok()).count()
    }
}

/// Extract every item from `body`, fetched from `page_url`.
pub fn extract_page(
    schema: &CompiledSchema,
    body: &str,
    page_url: &Url,
    row_concurrency: usize,
) -> PageExtraction {
    let doc = Document::parse(body);
    let root = doc.root();

    let signals = link_signals(schema, &root, page_url);
    let rows = match schema.row_container() {
        Some(container) => assemble_rows(schema, container, &root, page_url, row_concurrency),
        None => assemble_zipped(schema, &root, page_url),
    };

    let rows = rows
        .into_iter()
        .map(|row| apply_schema_transforms(schema, row))
        .filter(|row| !matches!(&row.data, Ok(data) if data.values().all(Value::is_null)))
        .collect();

    PageExtraction { rows, signals }
}

/// Why a field aborted its item.
#[derive(Debug, Clone)]
enum FieldFailure {
    Missing(String),
    Invalid { field: String, message: String },
}

impl FieldFailure {
    fn invalid(field: &CompiledField, message: String) -> Self {
        FieldFailure::Invalid {
            field: field.name.clone(),
            message,
        }
    }
}

impl From<FieldFailure> for AppError {
    fn from(failure: FieldFailure) -> Self {
        match failure {
            FieldFailure::Missing(field) => AppError::SelectorResolution { field },
            FieldFailure::Invalid { field, message } => AppError::Validation { field, message },
        }
    }
}

/// What a field's selector matched, detached from the document.
enum Raw {
    /// Node values before coercion, one per kept node.
    Values(Vec<Value>),
    /// Child records of a row container, one per kept node.
    Records(Vec<RawRecord>),
    /// The selector's match rules were violated.
    Rejected(String),
}

/// One [`Raw`] per child field, in field order.
type RawRecord = Vec<Raw>;

#[derive(Debug, Clone)]
struct Cell {
    value: Value,
    warnings: Vec<FieldWarning>,
}

type Record = (Map<String, Value>, Vec<FieldWarning>);

fn row_result(record: Result<Record, FieldFailure>) -> RowResult {
    match record {
        Ok((data, warnings)) => RowResult {
            data: Ok(data),
            warnings,
        },
        Err(failure) => RowResult {
            data: Err(failure.into()),
            warnings: Vec::new(),
        },
    }
}

fn gather(node: &Node<'_>, field: &CompiledField) -> Raw {
    if field.is_row_container() {
        return match gather_records(node, field) {
            Ok(records) => Raw::Records(records),
            Err(message) => Raw::Rejected(message),
        };
    }
    match resolve_checked(node, &field.selector) {
        Err(message) => Raw::Rejected(message),
        Ok(None) => Raw::Values(Vec::new()),
        Ok(Some((link, nodes))) => Raw::Values(
            nodes
                .iter()
                .map(|n| node_value(n, field.field_type, link.attribute()))
                .collect(),
        ),
    }
}

fn gather_records(node: &Node<'_>, container: &CompiledField) -> Result<Vec<RawRecord>, String> {
    let nodes = resolve_checked(node, &container.selector)?
        .map(|(_, nodes)| nodes)
        .unwrap_or_default();
    Ok(nodes
        .iter()
        .map(|n| container.children.iter().map(|f| gather(n, f)).collect())
        .collect())
}

/// One item per row of the row container, page-level fields merged in.
fn assemble_rows(
    schema: &CompiledSchema,
    container: &CompiledField,
    root: &Node<'_>,
    base: &Url,
    concurrency: usize,
) -> Vec<RowResult> {
    let raw_rows = match gather_records(root, container) {
        Ok(rows) => rows,
        Err(message) => return vec![row_result(Err(FieldFailure::invalid(container, message)))],
    };

    let mut page_cells = Vec::new();
    for field in schema.fields.iter().filter(|f| !f.is_row_container()) {
        match cells(field, &gather(root, field), base).and_then(|c| settle(field, c)) {
            Ok(cell) => page_cells.push((field.name.as_str(), cell)),
            Err(failure) => {
                // A page-level failure aborts every row that would have carried it.
                return (0..raw_rows.len().max(1))
                    .map(|_| row_result(Err(failure.clone())))
                    .collect();
            }
        }
    }

    finish_rows(&container.children, &raw_rows, base, concurrency)
        .into_iter()
        .map(|row| {
            row.map(|(mut cells, mut warnings)| {
                let mut data = Map::new();
                for field in &schema.fields {
                    if field.is_row_container() {
                        data.append(&mut cells);
                    } else if let Some((_, cell)) =
                        page_cells.iter().find(|(name, _)| *name == field.name)
                    {
                        data.insert(field.name.clone(), cell.value.clone());
                        warnings.extend(cell.warnings.iter().cloned());
                    }
                }
                (data, warnings)
            })
        })
        .map(row_result)
        .collect()
}

fn finish_rows(
    fields: &[CompiledField],
    rows: &[RawRecord],
    base: &Url,
    concurrency: usize,
) -> Vec<Result<Record, FieldFailure>> {
    let workers = concurrency.max(1).min(rows.len());
    if workers <= 1 {
        return rows.iter().map(|row| finish_record(fields, row, base)).collect();
    }

    tracing::debug!(rows = rows.len(), workers, "Fanning out row extraction");
    let chunk = rows.len().div_ceil(workers);
    thread::scope(|scope| {
        let handles: Vec<_> = rows
            .chunks(chunk)
            .map(|part| {
                scope.spawn(move || {
                    part.iter()
                        .map(|row| finish_record(fields, row, base))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}

/// No row container: `multiple` fields are zipped into rows, single-valued
/// fields repeat on every row. Without any `multiple` field the page is one item.
fn assemble_zipped(schema: &CompiledSchema, root: &Node<'_>, base: &Url) -> Vec<RowResult> {
    let mut columns = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        match cells(field, &gather(root, field), base) {
            Ok(cells) => columns.push((field, cells)),
            Err(failure) => return vec![row_result(Err(failure))],
        }
    }

    let row_count = columns
        .iter()
        .filter(|(f, _)| f.selector.is_multiple())
        .map(|(_, cells)| cells.len())
        .max();

    let build = |index: Option<usize>| -> Result<Record, FieldFailure> {
        let mut data = Map::new();
        let mut warnings = Vec::new();
        for (field, cells) in &columns {
            let cell = match index {
                Some(i) if field.selector.is_multiple() => match cells.get(i) {
                    Some(cell) => validated(field, cell.clone())?,
                    None => missing(field)?,
                },
                _ => settle(field, cells.clone())?,
            };
            data.insert(field.name.clone(), cell.value);
            warnings.extend(cell.warnings);
        }
        Ok((data, warnings))
    };

    match row_count {
        None => vec![row_result(build(None))],
        Some(n) => (0..n).map(|i| row_result(build(Some(i)))).collect(),
    }
}

fn finish_record(fields: &[CompiledField], raws: &[Raw], base: &Url) -> Result<Record, FieldFailure> {
    let mut data = Map::new();
    let mut warnings = Vec::new();
    for (field, raw) in fields.iter().zip(raws) {
        let cell = settle(field, cells(field, raw, base)?)?;
        data.insert(field.name.clone(), cell.value);
        warnings.extend(cell.warnings);
    }
    Ok((data, warnings))
}

/// One cell per matched node: coerced, then run through the field's chain.
fn cells(field: &CompiledField, raw: &Raw, base: &Url) -> Result<Vec<Cell>, FieldFailure> {
    match raw {
        Raw::Rejected(message) => Err(FieldFailure::invalid(field, message.clone())),
        Raw::Records(records) => records
            .iter()
            .map(|record| {
                finish_record(&field.children, record, base).map(|(data, warnings)| Cell {
                    value: Value::Object(data),
                    warnings,
                })
            })
            .collect(),
        Raw::Values(values) => Ok(values
            .iter()
            .map(|raw| {
                let outcome =
                    apply_chain(coerce(raw.clone(), field.field_type, base), &field.transforms);
                Cell {
                    value: outcome.value,
                    warnings: outcome
                        .warnings
                        .into_iter()
                        .map(|e| FieldWarning {
                            field: field.name.clone(),
                            message: e.to_string(),
                        })
                        .collect(),
                }
            })
            .collect()),
    }
}

/// The field's final value, checked against its validation rules.
fn settle(field: &CompiledField, cells: Vec<Cell>) -> Result<Cell, FieldFailure> {
    validated(field, collapse(field, cells)?)
}

fn validated(field: &CompiledField, cell: Cell) -> Result<Cell, FieldFailure> {
    if let Some(rules) = &field.validation {
        rules
            .check(&cell.value)
            .map_err(|message| FieldFailure::invalid(field, message))?;
    }
    Ok(cell)
}

/// Reduce a field's cells to its value: an array for `multiple`, else the first.
fn collapse(field: &CompiledField, mut cells: Vec<Cell>) -> Result<Cell, FieldFailure> {
    if cells.is_empty() {
        return missing(field);
    }
    if field.selector.is_multiple() {
        let mut warnings = Vec::new();
        let values = cells
            .into_iter()
            .map(|c| {
                warnings.extend(c.warnings);
                c.value
            })
            .collect();
        return Ok(Cell {
            value: Value::Array(values),
            warnings,
        });
    }
    Ok(cells.swap_remove(0))
}

fn missing(field: &CompiledField) -> Result<Cell, FieldFailure> {
    if field.required {
        return Err(FieldFailure::Missing(field.name.clone()));
    }
    Ok(Cell {
        value: field.default_value.clone().unwrap_or(Value::Null),
        warnings: Vec::new(),
    })
}

/// Raw value of a node: an explicit attribute wins, then type defaults.
fn node_value(node: &Node<'_>, field_type: FieldType, attribute: Option<&str>) -> Value {
    if let Some(attr) = attribute {
        return match node {
            Node::Json(Value::Object(map)) => map.get(attr).cloned().unwrap_or(Value::Null),
            Node::Element(_) => node.attr(attr).map(Value::String).unwrap_or(Value::Null),
            _ => Value::String(node.text()),
        };
    }

    match (node, field_type) {
        (Node::Json(value), _) => value.clone(),
        (Node::Element(_), FieldType::Html) => Value::String(node.inner_html()),
        (Node::Element(_), FieldType::Url) => {
            Value::String(node.attr("href").unwrap_or_else(|| node.text()))
        }
        (Node::Element(_), FieldType::Image) => Value::String(
            node.attr("src")
                .or_else(|| node.attr("data-src"))
                .unwrap_or_else(|| node.text()),
        ),
        _ => Value::String(node.text()),
    }
}

const FALSY: &[&str] = &["false", "no", "n", "0", "off", "", "unavailable", "out of stock"];

/// Type coercion applied before the transform chain. Only strings are coerced.
fn coerce(value: Value, field_type: FieldType, base: &Url) -> Value {
    let Value::String(text) = value else {
        return value;
    };

    match field_type {
        FieldType::Number | FieldType::Price => parse_number(&text).unwrap_or(Value::String(text)),
        FieldType::Boolean => {
            // Anything but an explicit negative counts as true.
            let lowered = text.trim().to_lowercase();
            Value::Bool(!FALSY.contains(&lowered.as_str()))
        }
        FieldType::Url | FieldType::Image => absolutize(base, &text)
            .map(Value::String)
            .unwrap_or(Value::String(text)),
        _ => Value::String(text),
    }
}

fn apply_schema_transforms(schema: &CompiledSchema, row: RowResult) -> RowResult {
    let RowResult { data, mut warnings } = row;
    let data = data.map(|mut data| {
        for (target, step) in &schema.transforms {
            for (key, value) in data.iter_mut() {
                if target.as_deref().is_some_and(|t| t != key) {
                    continue;
                }
                match step.apply(value) {
                    Ok(next) => *value = next,
                    Err(e) => warnings.push(FieldWarning {
                        field: key.clone(),
                        message: e.to_string(),
                    }),
                }
            }
        }
        data
    });
    RowResult { data, warnings }
}

fn link_signals(schema: &CompiledSchema, root: &Node<'_>, base: &Url) -> LinkSignals {
    let mut signals = LinkSignals {
        stop_selector_missing: schema
            .stop_selectors
            .iter()
            .any(|s| resolve(root, s).is_empty()),
        ..LinkSignals::default()
    };

    if let Some(next) = &schema.next_selector
        && let Some((link, nodes)) = resolve_matched(root, next)
    {
        signals.next_present = true;
        let attr = link.attribute().unwrap_or("href");
        signals.links = nodes
            .iter()
            .filter_map(|node| {
                let href = match node {
                    Node::Element(_) => node.attr(attr)?,
                    other => other.text(),
                };
                Some(PageLink {
                    label: node.text(),
                    href: absolutize(base, &href)?,
                })
            })
            .collect();
    }

    signals
}
