//! Query-source contracts and the HTTP / fixture source implementations.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info_span, Instrument};
use wsnap_core::{CellValue, RawRow, SourceTable};

pub const CRATE_NAME: &str = "wsnap-adapters";

/// Daily auction screen: non-ST, no STAR board, auction gain in (1%, 6%),
/// profitable TTM P/E, positive main-force flow, auction volume ratio > 1,
/// 10- and 5-day gains of at least 10%, listed for more than 100 days.
pub const DEFAULT_SCREEN_QUERY: &str = "今天非st，非科创板，竞价涨跌幅大于1%且小于6%，\
TTM 市盈率不为亏损，主力净量大于0，集合竞价量比大于1，\
10日涨幅大于等于10%，5日涨幅大于等于10%，上市时间大于100天";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("query request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("query source returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("query result is not tabular: {0}")]
    Shape(String),
    #[error("query result is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Raw payload plus its tabular reading. `table` is `None` when the source
/// had nothing to return.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub table: Option<SourceTable>,
    pub raw: Vec<u8>,
}

impl QueryResponse {
    pub fn from_json_bytes(raw: Vec<u8>) -> Result<Self, SourceError> {
        let value: JsonValue = if raw.iter().all(u8::is_ascii_whitespace) {
            JsonValue::Null
        } else {
            serde_json::from_slice(&raw)?
        };
        let table = table_from_json(&value)?;
        Ok(Self { table, raw })
    }
}

#[async_trait]
pub trait QuerySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn query(&self, expression: &str, credential: &str) -> Result<QueryResponse, SourceError>;
}

/// Read a JSON query result as a table. Accepted shapes:
/// an array of row objects, `{"columns": [...], "rows": [[...]]}`,
/// a column-oriented object of equal-length arrays, or any of these under a
/// `data` key. `null` and empty results read as `None`.
pub fn table_from_json(value: &JsonValue) -> Result<Option<SourceTable>, SourceError> {
    match value {
        JsonValue::Null => Ok(None),
        JsonValue::Array(items) => table_from_records(items),
        JsonValue::Object(object) => {
            if let Some(inner) = object.get("data") {
                return table_from_json(inner);
            }
            if let (Some(JsonValue::Array(columns)), Some(JsonValue::Array(rows))) =
                (object.get("columns"), object.get("rows"))
            {
                return table_from_split(columns, rows);
            }
            table_from_columnar(object)
        }
        other => Err(SourceError::Shape(format!("unexpected top-level {}", json_kind(other)))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

pub fn cell_from_json(value: &JsonValue) -> CellValue {
    match value {
        JsonValue::Null => CellValue::Null,
        JsonValue::Bool(b) => CellValue::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => CellValue::Int(i),
            None => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Null),
        },
        JsonValue::String(s) => CellValue::Text(s.clone()),
        nested => CellValue::Text(nested.to_string()),
    }
}

fn push_column(columns: &mut Vec<String>, name: &str) {
    if !columns.iter().any(|c| c == name) {
        columns.push(name.to_string());
    }
}

fn table_from_records(items: &[JsonValue]) -> Result<Option<SourceTable>, SourceError> {
    if items.is_empty() {
        return Ok(None);
    }
    let mut columns = Vec::new();
    let mut rows = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let JsonValue::Object(object) = item else {
            return Err(SourceError::Shape(format!(
                "row {index} is {} not an object",
                json_kind(item)
            )));
        };
        let mut row = RawRow::with_capacity(object.len());
        for (name, cell) in object {
            push_column(&mut columns, name);
            row.insert(name.clone(), cell_from_json(cell));
        }
        rows.push(row);
    }
    Ok(Some(SourceTable::new(columns, rows)))
}

fn table_from_split(columns: &[JsonValue], rows: &[JsonValue]) -> Result<Option<SourceTable>, SourceError> {
    let columns = columns
        .iter()
        .map(|c| match c {
            JsonValue::String(s) => Ok(s.clone()),
            other => Err(SourceError::Shape(format!("column name is {}", json_kind(other)))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut table_rows = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let JsonValue::Array(cells) = row else {
            return Err(SourceError::Shape(format!("row {index} is not an array")));
        };
        if cells.len() != columns.len() {
            return Err(SourceError::Shape(format!(
                "row {index} has {} cells for {} columns",
                cells.len(),
                columns.len()
            )));
        }
        table_rows.push(
            columns
                .iter()
                .cloned()
                .zip(cells.iter().map(cell_from_json))
                .collect::<RawRow>(),
        );
    }
    Ok(Some(SourceTable::new(columns, table_rows)))
}

fn table_from_columnar(object: &Map<String, JsonValue>) -> Result<Option<SourceTable>, SourceError> {
    let mut height = None;
    for (name, values) in object {
        let JsonValue::Array(values) = values else {
            return Err(SourceError::Shape(format!("column {name} is not an array")));
        };
        if let Some(nested) = values.iter().find(|v| v.is_object() || v.is_array()) {
            return Err(SourceError::Shape(format!(
                "column {name} holds {} cells",
                json_kind(nested)
            )));
        }
        match height {
            None => height = Some(values.len()),
            Some(h) if h != values.len() => {
                return Err(SourceError::Shape(format!(
                    "column {name} has {} values, expected {h}",
                    values.len()
                )))
            }
            Some(_) => {}
        }
    }
    let height = height.unwrap_or(0);
    if height == 0 {
        return Ok(None);
    }
    let columns: Vec<String> = object.keys().cloned().collect();
    let rows = (0..height)
        .map(|i| {
            object
                .iter()
                .map(|(name, values)| (name.clone(), values.get(i).map(cell_from_json).unwrap_or(CellValue::Null)))
                .collect::<RawRow>()
        })
        .collect();
    Ok(Some(SourceTable::new(columns, rows)))
}

/// Natural-language screening endpoint. The session cookie is the credential.
#[derive(Debug, Clone)]
pub struct HttpQuerySource {
    client: reqwest::Client,
    endpoint: String,
    page_size: u32,
}

impl HttpQuerySource {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            page_size: 100,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn post_question(&self, expression: &str, credential: &str) -> Result<QueryResponse, SourceError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::COOKIE, credential)
            .json(&self.request_body(expression))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let raw = resp.bytes().await?.to_vec();
        QueryResponse::from_json_bytes(raw)
    }

    pub fn request_body(&self, expression: &str) -> JsonValue {
        serde_json::json!({
            "question": expression,
            "perpage": self.page_size,
            "page": 1,
            "query_type": "stock",
        })
    }
}

#[async_trait]
impl QuerySource for HttpQuerySource {
    fn source_id(&self) -> &'static str {
        "wencai-http"
    }

    async fn query(&self, expression: &str, credential: &str) -> Result<QueryResponse, SourceError> {
        let span = info_span!("screen_query", source = self.source_id(), endpoint = %self.endpoint);
        self.post_question(expression, credential).instrument(span).await
    }
}

/// Serves a saved query result from disk; the expression and credential are
/// ignored.
#[derive(Debug, Clone)]
pub struct FixtureQuerySource {
    path: PathBuf,
}

impl FixtureQuerySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QuerySource for FixtureQuerySource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn query(&self, _expression: &str, _credential: &str) -> Result<QueryResponse, SourceError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading fixture {}", self.path.display()))?;
        QueryResponse::from_json_bytes(raw)
    }
}
