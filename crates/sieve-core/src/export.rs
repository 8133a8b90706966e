//! Export formatter: JSON, CSV, XML and SQL payloads of extracted items.
//!
//! The SQL output uses naive single-quote escaping and sanitized identifiers.
//! It is meant for loading trusted data into a scratch database, not for
//! feeding untrusted destinations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::models::ExtractedItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Xml,
    Sql,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Xml => "xml",
            ExportFormat::Sql => "sql",
        }
    }

    /// File extension without the dot.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "xml" => Ok(ExportFormat::Xml),
            "sql" => Ok(ExportFormat::Sql),
            _ => Err(AppError::Export(format!("Unsupported export format: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Column subset, in output order. `None` exports every field.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default = "default_pretty")]
    pub pretty: bool,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_root_element")]
    pub root_element: String,
    /// CSV field separator; a single ASCII character.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// CSV header row.
    #[serde(default = "default_include_headers")]
    pub include_headers: bool,
}

fn default_pretty() -> bool {
    true
}

fn default_table_name() -> String {
    "extracted_data".into()
}

fn default_root_element() -> String {
    "items".into()
}

fn default_delimiter() -> char {
    ','
}

fn default_include_headers() -> bool {
    true
}

impl ExportOptions {
    pub fn new(format: ExportFormat) -> Self {
        Self {
            format,
            fields: None,
            pretty: default_pretty(),
            table_name: default_table_name(),
            root_element: default_root_element(),
            delimiter: default_delimiter(),
            include_headers: default_include_headers(),
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn compact(mut self) -> Self {
        self.pretty = false;
        self
    }

    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.table_name = name.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn without_headers(mut self) -> Self {
        self.include_headers = false;
        self
    }
}

/// Render `items` in the requested format.
pub fn export(items: &[ExtractedItem], options: &ExportOptions) -> Result<String, AppError> {
    let columns = columns(items, options)?;
    let out = match options.format {
        ExportFormat::Json => export_json(items, columns.as_deref(), options.pretty)?,
        ExportFormat::Csv => export_csv(items, &require_columns(columns, "CSV")?, options)?,
        ExportFormat::Xml => export_xml(items, columns.as_deref(), options),
        ExportFormat::Sql => export_sql(items, &require_columns(columns, "SQL")?, options),
    };
    tracing::debug!(
        format = %options.format,
        items = items.len(),
        bytes = out.len(),
        "Exported items"
    );
    Ok(out)
}

/// Selected columns, or `None` for "every key of each item".
///
/// Without a field subset the header comes from the first item's keys.
fn columns(
    items: &[ExtractedItem],
    options: &ExportOptions,
) -> Result<Option<Vec<String>>, AppError> {
    match &options.fields {
        Some(fields) => {
            if let Some(unknown) = fields
                .iter()
                .find(|f| !items.is_empty() && !items.iter().any(|i| i.data.contains_key(*f)))
            {
                return Err(AppError::Export(format!("Unknown export field: {}", unknown)));
            }
            Ok(Some(fields.clone()))
        }
        None => Ok(items.first().map(|i| i.data.keys().cloned().collect())),
    }
}

fn require_columns(columns: Option<Vec<String>>, format: &str) -> Result<Vec<String>, AppError> {
    match columns {
        Some(c) if !c.is_empty() => Ok(c),
        _ => Err(AppError::Export(format!("No data to export as {}", format))),
    }
}

fn project(data: &Map<String, Value>, columns: Option<&[String]>) -> Map<String, Value> {
    match columns {
        Some(cols) => cols
            .iter()
            .map(|c| (c.clone(), data.get(c).cloned().unwrap_or(Value::Null)))
            .collect(),
        None => data.clone(),
    }
}

/// Cell text: strings as-is, scalars stringified, containers as compact JSON.
/// `None` for null or absent values.
fn cell(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn export_json(
    items: &[ExtractedItem],
    columns: Option<&[String]>,
    pretty: bool,
) -> Result<String, AppError> {
    let rows: Vec<Value> = items
        .iter()
        .map(|i| Value::Object(project(&i.data, columns)))
        .collect();
    let json = if pretty {
        serde_json::to_string_pretty(&rows)?
    } else {
        serde_json::to_string(&rows)?
    };
    Ok(json)
}

fn export_csv(
    items: &[ExtractedItem],
    columns: &[String],
    options: &ExportOptions,
) -> Result<String, AppError> {
    let delimiter = match options.delimiter {
        '"' | '\n' | '\r' => None,
        c => u8::try_from(c).ok().filter(u8::is_ascii),
    }
    .ok_or_else(|| {
        AppError::Export(format!("Unusable CSV delimiter: {:?}", options.delimiter))
    })?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .has_headers(options.include_headers)
        .from_writer(Vec::new());
    let csv_err = |e: csv::Error| AppError::Export(format!("CSV write failed: {}", e));

    if options.include_headers {
        writer.write_record(columns).map_err(csv_err)?;
    }
    for item in items {
        let record: Vec<String> = columns
            .iter()
            .map(|c| cell(item.data.get(c)).unwrap_or_default())
            .collect();
        writer.write_record(&record).map_err(csv_err)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Export(format!("CSV flush failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| AppError::Export(format!("CSV is not UTF-8: {}", e)))
}

fn export_xml(
    items: &[ExtractedItem],
    columns: Option<&[String]>,
    options: &ExportOptions,
) -> String {
    let (nl, i1, i2) = if options.pretty {
        ("\n", "  ", "    ")
    } else {
        ("", "", "")
    };
    let root = xml_name(&options.root_element);

    let mut xml = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{nl}<{root}>{nl}");
    for item in items {
        xml.push_str(&format!("{i1}<item>{nl}"));
        for (key, value) in project(&item.data, columns) {
            let tag = xml_name(&key);
            let text = escape_xml(&cell(Some(&value)).unwrap_or_default());
            xml.push_str(&format!("{i2}<{tag}>{text}</{tag}>{nl}"));
        }
        xml.push_str(&format!("{i1}</item>{nl}"));
    }
    xml.push_str(&format!("</{root}>{nl}"));
    xml
}

fn export_sql(items: &[ExtractedItem], columns: &[String], options: &ExportOptions) -> String {
    let table = sql_identifier(&options.table_name);
    let idents: Vec<String> = columns.iter().map(|c| sql_identifier(c)).collect();

    let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (\n", table);
    let defs: Vec<String> = idents.iter().map(|c| format!("  {} TEXT", c)).collect();
    sql.push_str(&defs.join(",\n"));
    sql.push_str("\n);\n\n");

    let column_list = idents.join(", ");
    for item in items {
        let values: Vec<String> = columns
            .iter()
            .map(|c| match cell(item.data.get(c)) {
                Some(s) => format!("'{}'", s.replace('\'', "''")),
                None => "NULL".into(),
            })
            .collect();
        sql.push_str(&format!(
            "INSERT INTO {} ({}) VALUES ({});\n",
            table,
            column_list,
            values.join(", ")
        ));
    }
    sql
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Valid XML element name: starts with a letter or `_`, then letters,
/// digits, `-`, `_` or `.`; anything else becomes `_`.
fn xml_name(s: &str) -> String {
    let mut name = String::with_capacity(s.len() + 1);
    for (i, c) in s.chars().enumerate() {
        let ok = c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
        if i == 0 && !(c.is_ascii_alphabetic() || c == '_') {
            name.push('_');
            if ok {
                name.push(c);
            }
        } else {
            name.push(if ok { c } else { '_' });
        }
    }
    if name.is_empty() || name.to_ascii_lowercase().starts_with("xml") {
        name.insert(0, '_');
    }
    name
}

/// snake_case identifier; prefixed with `col_` when empty or leading digit.
fn sql_identifier(s: &str) -> String {
    let mut ident = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            ident.push(c.to_ascii_lowercase());
        } else if matches!(c, ' ' | '-' | '_' | '.') {
            ident.push('_');
        }
    }
    if ident.chars().next().is_none_or(|c| c.is_ascii_digit()) {
        ident.insert_str(0, "col_");
    }
    ident
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items() -> Vec<ExtractedItem> {
        vec![
            ExtractedItem::new(
                "https://ex.com",
                json!({"title": "Dune", "price": 9.5, "tags": ["sf", "classic"]})
                    .as_object()
                    .unwrap()
                    .clone(),
            ),
            ExtractedItem::new(
                "https://ex.com",
                json!({"title": "Tom's <Book> & Co", "price": null})
                    .as_object()
                    .unwrap()
                    .clone(),
            ),
        ]
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::Sql.to_string(), "sql");
        let err = "xlsx".parse::<ExportFormat>().unwrap_err();
        assert!(matches!(err, AppError::Export(_)));
    }

    #[test]
    fn test_csv_round_trip_with_quotes_and_newlines() {
        let value = "He said, \"hi\"\nBye";
        let rows = vec![ExtractedItem::new(
            "https://ex.com",
            json!({"quote": value, "n": 1}).as_object().unwrap().clone(),
        )];
        let out = export(&rows, &ExportOptions::new(ExportFormat::Csv)).unwrap();
        assert!(out.contains("\"He said, \"\"hi\"\"\nBye\""));

        let mut reader = csv::Reader::from_reader(out.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "quote");
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[0], value);
        assert_eq!(&record[1], "1");
    }

    #[test]
    fn test_csv_cells_stringify_non_strings() {
        let out = export(&items(), &ExportOptions::new(ExportFormat::Csv)).unwrap();
        let mut reader = csv::Reader::from_reader(out.as_bytes());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(&rows[0][2], r#"["sf","classic"]"#);
        assert_eq!(&rows[1][1], "");
        assert_eq!(&rows[1][2], "");
    }

    #[test]
    fn test_csv_delimiter_and_headerless_output() {
        let opts = ExportOptions::new(ExportFormat::Csv)
            .with_fields(["title", "price"])
            .with_delimiter(';')
            .without_headers();
        let out = export(&items(), &opts).unwrap();
        assert_eq!(out, "Dune;9.5\nTom's <Book> & Co;\n");

        let tabs = ExportOptions::new(ExportFormat::Csv)
            .with_fields(["title"])
            .with_delimiter('\t');
        let out = export(&items(), &tabs).unwrap();
        assert!(out.starts_with("title\nDune\n"));

        for bad in ['"', '→', '\n'] {
            let opts = ExportOptions::new(ExportFormat::Csv).with_delimiter(bad);
            assert!(matches!(export(&items(), &opts), Err(AppError::Export(_))));
        }
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: ExportOptions =
            serde_json::from_value(json!({"format": "csv", "delimiter": "|", "includeHeaders": false}))
                .unwrap();
        assert_eq!(opts.delimiter, '|');
        assert!(!opts.include_headers);
        let opts: ExportOptions = serde_json::from_value(json!({"format": "csv"})).unwrap();
        assert_eq!(opts, ExportOptions::new(ExportFormat::Csv));
    }

    #[test]
    fn test_json_field_subset() {
        let opts = ExportOptions::new(ExportFormat::Json)
            .with_fields(["price", "title"])
            .compact();
        let out = export(&items(), &opts).unwrap();
        assert_eq!(
            out,
            r#"[{"price":9.5,"title":"Dune"},{"price":null,"title":"Tom's <Book> & Co"}]"#
        );
    }

    #[test]
    fn test_unknown_field_is_an_error() {
        let opts = ExportOptions::new(ExportFormat::Json).with_fields(["nope"]);
        assert!(matches!(export(&items(), &opts), Err(AppError::Export(_))));
    }

    #[test]
    fn test_empty_exports() {
        assert_eq!(
            export(&[], &ExportOptions::new(ExportFormat::Json).compact()).unwrap(),
            "[]"
        );
        assert!(export(&[], &ExportOptions::new(ExportFormat::Csv)).is_err());
        assert!(export(&[], &ExportOptions::new(ExportFormat::Sql)).is_err());
        let xml = export(&[], &ExportOptions::new(ExportFormat::Xml)).unwrap();
        assert!(xml.contains("<items>") && xml.contains("</items>"));
    }

    #[test]
    fn test_xml_escapes_entities() {
        let out = export(&items(), &ExportOptions::new(ExportFormat::Xml)).unwrap();
        assert!(out.contains("<title>Tom&apos;s &lt;Book&gt; &amp; Co</title>"));
        assert!(out.contains("<price></price>"));
        assert_eq!(out.matches("<item>").count(), 2);
    }

    #[test]
    fn test_xml_names_are_sanitized() {
        assert_eq!(xml_name("2nd price"), "_2nd_price");
        assert_eq!(xml_name("xmlish"), "_xmlish");
        assert_eq!(xml_name("unit.price"), "unit.price");
    }

    #[test]
    fn test_sql_statements() {
        let opts = ExportOptions::new(ExportFormat::Sql).with_table_name("Book List");
        let out = export(&items(), &opts).unwrap();
        assert!(out.starts_with("CREATE TABLE IF NOT EXISTS book_list (\n  title TEXT,\n  price TEXT,\n  tags TEXT\n);"));
        assert!(out.contains("VALUES ('Tom''s <Book> & Co', NULL, NULL);"));
        assert_eq!(out.matches("INSERT INTO book_list").count(), 2);
    }

    #[test]
    fn test_sql_identifiers() {
        assert_eq!(sql_identifier("Unit Price"), "unit_price");
        assert_eq!(sql_identifier("1st"), "col_1st");
        assert_eq!(sql_identifier("$$"), "col_");
    }
}
