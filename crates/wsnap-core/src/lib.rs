//! Core domain model and column-matching rules for screen snapshots.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "wsnap-core";

/// Marker carried by every "interval change, pre-adjusted price" column.
pub const INTERVAL_MARKER: &str = "区间涨跌幅:前复权";

/// Exchange suffixes the screening source appends to stock identifiers.
pub const EXCHANGE_SUFFIXES: [&str; 3] = [".SH", ".SZ", ".BJ"];

/// Identifier columns in priority order.
pub const CODE_COLUMNS: [&str; 4] = ["代码", "股票代码", "证券代码", "code"];

/// Name columns in priority order.
pub const NAME_COLUMNS: [&str; 3] = ["股票简称", "证券简称", "name"];

const FORECAST_PE_PREFIX: &str = "预测市盈率(pe,最新预测)[";

/// One scalar cell from the source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    /// NaN floats count as missing, the same as an explicit null.
    pub fn is_null(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Float(v) => v.is_nan(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Int(v) => Some(*v as f64),
            CellValue::Float(v) if v.is_finite() => Some(*v),
            CellValue::Text(s) => parse_loose_number(s),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            _ if self.is_null() => None,
            CellValue::Bool(v) => Some(v.to_string()),
            CellValue::Int(v) => Some(v.to_string()),
            CellValue::Float(v) => Some(v.to_string()),
            CellValue::Text(s) => Some(s.clone()),
            CellValue::Null => None,
        }
    }

    /// Identifier rendering: integral floats lose their fractional part so
    /// `600519.0` and `600519` resolve to the same code.
    fn as_identifier(&self) -> Option<String> {
        match self {
            CellValue::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(format!("{}", *v as i64)),
            other => other.as_text(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Float(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

fn parse_loose_number(text: &str) -> Option<f64> {
    let trimmed = text.trim().trim_end_matches('%').trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned = trimmed.replace(',', "");
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Untyped source row keyed by (dynamic) column name.
pub type RawRow = HashMap<String, CellValue>;

/// Tabular query result. `columns` keeps source order, which matters for
/// fuzzy matching and interval tie-breaks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTable {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl SourceTable {
    pub fn new(columns: Vec<String>, rows: Vec<RawRow>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Strip exchange suffixes in every identifier column present in the table.
    /// Non-null identifiers become text, mirroring a string cast of the column.
    pub fn strip_identifier_suffixes(&mut self) {
        let id_columns: Vec<&str> = CODE_COLUMNS
            .iter()
            .copied()
            .filter(|c| *c != "code" && self.columns.iter().any(|col| col == c))
            .collect();
        for row in &mut self.rows {
            for column in &id_columns {
                if let Some(cell) = row.get_mut(*column) {
                    if let Some(text) = cell.as_identifier() {
                        *cell = CellValue::Text(strip_exchange_suffix(&text));
                    }
                }
            }
        }
    }
}

pub fn strip_exchange_suffix(code: &str) -> String {
    EXCHANGE_SUFFIXES
        .iter()
        .fold(code.to_string(), |acc, suffix| acc.replace(suffix, ""))
}

/// Exact-name lookup: the first candidate that is a column and non-null wins.
pub fn resolve<'a>(row: &'a RawRow, columns: &[String], candidates: &[&str]) -> Option<&'a CellValue> {
    candidates.iter().find_map(|name| {
        if !columns.iter().any(|c| c == name) {
            return None;
        }
        row.get(*name).filter(|v| !v.is_null())
    })
}

/// Substring lookup. Pattern order first, then column order.
pub fn resolve_fuzzy<'a, P: AsRef<str>>(
    row: &'a RawRow,
    columns: &[String],
    patterns: &[P],
) -> Option<&'a CellValue> {
    patterns.iter().find_map(|pattern| {
        let pattern = pattern.as_ref();
        columns
            .iter()
            .filter(|c| c.contains(pattern))
            .find_map(|c| row.get(c.as_str()).filter(|v| !v.is_null()))
    })
}

/// Pick the interval-change column with the longest (or shortest) name.
///
/// Ties in name length do not go straight to the first column: the span of
/// the `YYYYMMDD` dates embedded in each name is compared first (wider span
/// counts as longer). Only when length and span both tie does the first
/// column in source order win.
pub fn select_interval<'a>(row: &'a RawRow, columns: &[String], longer: bool) -> Option<&'a CellValue> {
    let mut chosen: Option<(&String, (usize, i64))> = None;
    for column in columns.iter().filter(|c| c.contains(INTERVAL_MARKER)) {
        let key = (column.chars().count(), embedded_span_days(column).unwrap_or(0));
        let better = match chosen {
            None => true,
            Some((_, best)) if longer => key > best,
            Some((_, best)) => key < best,
        };
        if better {
            chosen = Some((column, key));
        }
    }
    let (column, _) = chosen?;
    row.get(column.as_str()).filter(|v| !v.is_null())
}

/// Days between the earliest and latest `YYYYMMDD` stamp in a column name.
fn embedded_span_days(column: &str) -> Option<i64> {
    let mut dates = Vec::new();
    let mut digits = String::new();
    for ch in column.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.len() == 8 {
            if let Ok(date) = NaiveDate::parse_from_str(&digits, "%Y%m%d") {
                dates.push(date);
            }
        }
        digits.clear();
    }
    let first = dates.iter().min()?;
    let last = dates.iter().max()?;
    Some((*last - *first).num_days())
}

/// Normalized row persisted in the `stocks` table. Field names are the
/// store's column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub code: i64,
    pub stock_name: String,
    pub latest_price: Option<f64>,
    pub latest_change_pct: Option<f64>,
    pub listing_board: Option<String>,
    pub auction_change_pct: Option<f64>,
    pub pe_ttm: Option<f64>,
    pub pe: Option<f64>,
    pub dde_large_order: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub interval_change_13d: Option<f64>,
    pub interval_change_5d: Option<f64>,
    pub listing_days: Option<f64>,
    pub forecast_pe_1y: Option<f64>,
    pub forecast_pe_2y: Option<f64>,
    pub forecast_pe_3y: Option<f64>,
    pub market_cap: Option<f64>,
    pub eps: Option<f64>,
    pub gross_margin: Option<f64>,
    pub net_margin: Option<f64>,
    pub auction_price: Option<f64>,
    pub auction_type: Option<String>,
    pub auction_desc: Option<String>,
    pub auction_rating: Option<String>,
    pub auction_volume: Option<f64>,
    pub auction_amount: Option<f64>,
    pub market_code: Option<String>,
    pub update_date: NaiveDate,
}

impl CanonicalRecord {
    /// Record with only the identity fields set.
    pub fn new(code: i64, stock_name: impl Into<String>, update_date: NaiveDate) -> Self {
        Self {
            code,
            stock_name: stock_name.into(),
            latest_price: None,
            latest_change_pct: None,
            listing_board: None,
            auction_change_pct: None,
            pe_ttm: None,
            pe: None,
            dde_large_order: None,
            volume_ratio: None,
            interval_change_13d: None,
            interval_change_5d: None,
            listing_days: None,
            forecast_pe_1y: None,
            forecast_pe_2y: None,
            forecast_pe_3y: None,
            market_cap: None,
            eps: None,
            gross_margin: None,
            net_margin: None,
            auction_price: None,
            auction_type: None,
            auction_desc: None,
            auction_rating: None,
            auction_volume: None,
            auction_amount: None,
            market_code: None,
            update_date,
        }
    }
}

/// Store column names in schema order.
pub const RECORD_COLUMNS: [&str; 28] = [
    "code",
    "stock_name",
    "latest_price",
    "latest_change_pct",
    "listing_board",
    "auction_change_pct",
    "pe_ttm",
    "pe",
    "dde_large_order",
    "volume_ratio",
    "interval_change_13d",
    "interval_change_5d",
    "listing_days",
    "forecast_pe_1y",
    "forecast_pe_2y",
    "forecast_pe_3y",
    "market_cap",
    "eps",
    "gross_margin",
    "net_margin",
    "auction_price",
    "auction_type",
    "auction_desc",
    "auction_rating",
    "auction_volume",
    "auction_amount",
    "market_code",
    "update_date",
];

fn number(value: Option<&CellValue>) -> Option<f64> {
    value.and_then(CellValue::as_f64)
}

fn text(value: Option<&CellValue>) -> Option<String> {
    value.and_then(CellValue::as_text)
}

/// Forecast P/E columns embed the forecast year, e.g. `预测市盈率(pe,最新预测)[20251231]`.
pub fn forecast_pe_pattern(update_date: NaiveDate, years_ahead: i32) -> String {
    format!("{FORECAST_PE_PREFIX}{}", update_date.year() + years_ahead)
}

/// Map one source row onto the canonical schema. Rows without a usable
/// identifier or name yield `None`.
pub fn normalize(row: &RawRow, columns: &[String], update_date: NaiveDate) -> Option<CanonicalRecord> {
    let raw_code = resolve(row, columns, &CODE_COLUMNS)?.as_identifier()?;
    let cleaned = strip_exchange_suffix(&raw_code);
    let code = cleaned.trim().parse::<i64>().ok()?;

    let stock_name = resolve(row, columns, &NAME_COLUMNS)?.as_text()?;
    if stock_name.is_empty() {
        return None;
    }

    let exact = |names: &[&str]| resolve(row, columns, names);
    let fuzzy = |patterns: &[&str]| resolve_fuzzy(row, columns, patterns);
    let forecast = |years_ahead: i32| {
        number(resolve_fuzzy(
            row,
            columns,
            &[forecast_pe_pattern(update_date, years_ahead)],
        ))
    };

    Some(CanonicalRecord {
        code,
        stock_name,
        latest_price: number(exact(&["最新价", "现价", "price"])),
        latest_change_pct: number(exact(&["最新涨跌幅", "涨跌幅", "涨跌幅(%)"])),
        listing_board: text(exact(&["上市板块", "板块"])),
        auction_change_pct: number(fuzzy(&["竞价涨幅"])),
        pe_ttm: number(fuzzy(&["市盈率(pe,ttm)"])),
        pe: number(fuzzy(&["市盈率(pe)"])),
        dde_large_order: number(fuzzy(&["dde大单净量"])),
        volume_ratio: number(fuzzy(&["分时量比"])),
        interval_change_13d: number(select_interval(row, columns, true)),
        interval_change_5d: number(select_interval(row, columns, false)),
        listing_days: number(fuzzy(&["上市天数"])),
        forecast_pe_1y: forecast(0),
        forecast_pe_2y: forecast(1),
        forecast_pe_3y: forecast(2),
        market_cap: number(fuzzy(&["总市值"])),
        eps: number(exact(&["基本每股收益", "EPS"])),
        gross_margin: number(exact(&["销售毛利率", "毛利率"])),
        net_margin: number(exact(&["销售净利率", "净利率"])),
        auction_price: number(fuzzy(&["竞价匹配价"])),
        auction_type: text(fuzzy(&["竞价异动类型"])),
        auction_desc: text(fuzzy(&["竞价异动说明"])),
        auction_rating: text(fuzzy(&["集合竞价评级"])),
        auction_volume: number(fuzzy(&["竞价量"])),
        auction_amount: number(exact(&["竞价金额", "竞价成交额"])),
        market_code: text(exact(&["market_code"])),
        update_date,
    })
}

/// Normalize every row of a table, dropping malformed rows.
pub fn normalize_table(table: &SourceTable, update_date: NaiveDate) -> Vec<CanonicalRecord> {
    table
        .rows
        .iter()
        .filter_map(|row| normalize(row, &table.columns, update_date))
        .collect()
}
