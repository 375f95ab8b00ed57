use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

pub type Row = Map<String, Value>;

/// One unit of work: a single row from a record table.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub id: u64,
    pub source: String,
    pub fields: Row,
    pub json: String,
}

impl Record {
    pub fn new(id: u64, source: impl Into<String>, fields: Row) -> Self {
        let json = row_json(&fields);
        Self {
            id,
            source: source.into(),
            fields,
            json,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextTable {
    pub source: String,
    pub rows: Vec<Row>,
}

impl ContextTable {
    /// Unique values of each row's first column, in row order.
    pub fn first_column_values(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for row in &self.rows {
            let Some((_, v)) = row.iter().next() else {
                continue;
            };
            let s = match v {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }
}

/// Example rows attached to every request of a run.
#[derive(Debug, Clone)]
pub struct SharedContext {
    tables: Vec<ContextTable>,
    json: String,
}

impl SharedContext {
    pub fn new(tables: Vec<ContextTable>) -> Self {
        let tables: Vec<ContextTable> = tables.into_iter().filter(|t| !t.rows.is_empty()).collect();
        let all_rows: Vec<Value> = tables
            .iter()
            .flat_map(|t| t.rows.iter().cloned().map(Value::Object))
            .collect();
        let json = if all_rows.is_empty() {
            String::new()
        } else {
            Value::Array(all_rows).to_string()
        };
        Self { tables, json }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.json.is_empty()
    }

    /// Serialized block sent to the model; empty when there is no context.
    pub fn json(&self) -> &str {
        &self.json
    }

    pub fn tables(&self) -> &[ContextTable] {
        &self.tables
    }

    pub fn table(&self, source: &str) -> Option<&ContextTable> {
        self.tables.iter().find(|t| t.source == source)
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

/// Compact JSON for one row, keys in source order.
pub fn row_json(row: &Row) -> String {
    serde_json::to_string(row).unwrap_or_default()
}

pub fn load_records(dir: &Path, normalize_unicode: bool) -> Result<Vec<Record>> {
    let files = list_table_files(dir)
        .with_context(|| format!("listing records dir: {}", dir.display()))?;

    let mut records = Vec::new();
    for path in files {
        let Some(rows) = read_table(&path, normalize_unicode)? else {
            continue;
        };
        let source = file_name(&path);
        debug!("loaded {} records from {}", rows.len(), source);
        for row in rows {
            let id = records.len() as u64;
            records.push(Record::new(id, source.clone(), row));
        }
    }

    if records.is_empty() {
        return Err(anyhow!("no records found in {}", dir.display()));
    }
    Ok(records)
}

pub fn load_context(dir: &Path, normalize_unicode: bool) -> Result<SharedContext> {
    if !dir.exists() {
        warn!(
            "context dir {} does not exist; proceeding without example context",
            dir.display()
        );
        return Ok(SharedContext::empty());
    }

    let files = list_table_files(dir)
        .with_context(|| format!("listing context dir: {}", dir.display()))?;
    let mut tables = Vec::new();
    for path in files {
        let Some(rows) = read_table(&path, normalize_unicode)? else {
            continue;
        };
        let source = file_name(&path);
        if rows.is_empty() {
            warn!("context file {} is empty, skipping", source);
            continue;
        }
        tables.push(ContextTable { source, rows });
    }
    Ok(SharedContext::new(tables))
}

fn list_table_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if file_name(&path).starts_with('.') {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Reads a JSON array of objects, a JSON Lines file, or a CSV file with a
/// header row. Returns `None` for unsupported extensions.
pub fn read_table(path: &Path, normalize_unicode: bool) -> Result<Option<Vec<Row>>> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());

    let raw = match ext.as_deref() {
        Some("json") | Some("jsonl") => std::fs::read_to_string(path)
            .with_context(|| format!("reading table: {}", path.display()))?,
        Some("csv") => return read_csv(path, normalize_unicode).map(Some),
        _ => {
            warn!(
                "unsupported table format, only .json, .jsonl and .csv are read: {}",
                path.display()
            );
            return Ok(None);
        }
    };

    let values: Vec<Value> = if ext.as_deref() == Some("jsonl") {
        raw.lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty())
            .map(|(i, l)| {
                serde_json::from_str::<Value>(l)
                    .with_context(|| format!("{} line {}", path.display(), i + 1))
            })
            .collect::<Result<_>>()?
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    };

    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::Object(row) if normalize_unicode => Ok(normalize_row(row)),
            Value::Object(row) => Ok(row),
            _ => Err(anyhow!("{} row {} is not a JSON object", path.display(), i)),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Header names become keys in column order. Cells stay strings; empty cells
/// become null.
fn read_csv(path: &Path, normalize_unicode: bool) -> Result<Vec<Row>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading table: {}", path.display()))?;
    let text = decode_text(&bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{} row {}", path.display(), i + 1))?;
        let row: Row = headers
            .iter()
            .zip(record.iter())
            .map(|(key, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (key.to_string(), value)
            })
            .collect();
        rows.push(if normalize_unicode { normalize_row(row) } else { row });
    }
    Ok(rows)
}

/// UTF-8 with any byte-order mark dropped, else Latin-1.
fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

fn normalize_row(row: Row) -> Row {
    row.into_iter()
        .map(|(k, v)| (k.nfc().collect::<String>(), normalize_value(v)))
        .collect()
}

fn normalize_value(v: Value) -> Value {
    match v {
        Value::String(s) => Value::String(s.nfc().collect()),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::Object(map) => Value::Object(normalize_row(map)),
        other => other,
    }
}
