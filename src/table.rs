//! Row-based in-memory table with typed cells and explicit nulls.
//!
//! Every stage of the pipeline passes entities around as a [`Table`]: the
//! reader produces one per source file, the reconciler merges and repairs
//! them, and the loader upserts them. Cells are [`Value`]s, so a missing or
//! unparsable field is always [`Value::Null`] rather than an empty string or
//! a sentinel.
//!
//! Column-wise operations ([`Table::map_column`], [`Table::set_column`],
//! [`Table::coerce_column`]) apply a transformation to every row and leave
//! nulls untouched unless the transformation says otherwise.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

static NULL: Value = Value::Null;

/// A single typed cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// A list of scalar strings (categories, roles, keywords).
    List(Vec<String>),
    /// Any structured payload that has no tabular shape.
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow the text of a `Text` cell.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric view of the cell. Text is parsed leniently (`"1,000"` → 1000).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if f.is_finite() => Some(*f),
            Value::Text(s) => parse_number(s),
            _ => None,
        }
    }

    /// Date-time view of the cell; dates are taken at midnight.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            Value::Date(d) => d.and_hms_opt(0, 0, 0),
            Value::Text(s) => parse_datetime(s),
            _ => None,
        }
    }

    /// Text cell with the given content, or `Null` when blank.
    pub fn text(s: impl Into<String>) -> Value {
        let s = s.into();
        if s.trim().is_empty() {
            Value::Null
        } else {
            Value::Text(s)
        }
    }

    /// Convert a JSON payload field into a cell.
    ///
    /// Arrays made only of strings become [`Value::List`]; empty strings and
    /// JSON `null` become `Null`; other nested shapes are kept as
    /// [`Value::Json`].
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::text(s.clone()),
            serde_json::Value::Array(items) => {
                let strings: Option<Vec<String>> = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect();
                match strings {
                    Some(list) => Value::List(list),
                    None => Value::Json(value.clone()),
                }
            }
            serde_json::Value::Object(_) => Value::Json(value.clone()),
        }
    }

    /// Stable textual form used for equality keys (dedup, joins).
    pub fn key_repr(&self) -> String {
        match self {
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::List(items) => {
                let encoded = serde_json::to_string(items).map_err(|_| fmt::Error)?;
                f.write_str(&encoded)
            }
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

/// One row: column name → cell. Absent columns read as `Null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> &Value {
        self.0.get(column).unwrap_or(&NULL)
    }

    /// Non-blank text of a column.
    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).as_str().filter(|s| !s.trim().is_empty())
    }

    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Record(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// An ordered set of columns and the rows that populate them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Record>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        let mut table = Table::default();
        for column in columns {
            table.ensure_column(column);
        }
        table
    }

    /// Build a table from rows, collecting the union of their columns in
    /// first-seen order.
    pub fn from_rows(rows: impl IntoIterator<Item = Record>) -> Self {
        let mut table = Table::default();
        for row in rows {
            table.push(row);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Record] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<Record> {
        self.rows
    }

    /// Add a column (filled with `Null`) if it is not already present.
    pub fn ensure_column(&mut self, column: impl Into<String>) {
        let column = column.into();
        if !self.has_column(&column) {
            self.columns.push(column);
        }
    }

    /// Append a row; columns the table has not seen yet are added.
    pub fn push(&mut self, row: Record) {
        for column in row.columns() {
            if !self.has_column(column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(row);
    }

    /// Set the same value on every row.
    pub fn set_column(&mut self, column: &str, value: Value) {
        self.ensure_column(column);
        for row in &mut self.rows {
            row.set(column, value.clone());
        }
    }

    /// Replace every non-null cell of `column` with `f(cell)`. No-op when
    /// the column is absent. Nulls propagate.
    pub fn map_column<F>(&mut self, column: &str, mut f: F)
    where
        F: FnMut(&Value) -> Value,
    {
        if !self.has_column(column) {
            return;
        }
        for row in &mut self.rows {
            let current = row.get(column);
            if current.is_null() {
                continue;
            }
            let next = f(current);
            row.set(column, next);
        }
    }

    /// Like [`map_column`](Self::map_column) but the closure also sees nulls,
    /// for fill-style transformations.
    pub fn coerce_column<F>(&mut self, column: &str, mut f: F)
    where
        F: FnMut(&Value) -> Value,
    {
        if !self.has_column(column) {
            return;
        }
        for row in &mut self.rows {
            let next = f(row.get(column));
            row.set(column, next);
        }
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&Record) -> bool,
    {
        self.rows.retain(f);
    }

    pub fn column(&self, column: &str) -> impl Iterator<Item = &Value> + '_ {
        let column = column.to_string();
        self.rows.iter().map(move |row| row.get(&column))
    }

    /// Distinct non-blank text values of a column, in first-seen order.
    pub fn distinct_text(&self, column: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for value in self.column(column) {
            if let Some(s) = value.as_str() {
                let s = s.trim();
                if !s.is_empty() && seen.insert(s.to_string()) {
                    out.push(s.to_string());
                }
            }
        }
        out
    }

    /// Set of non-blank text keys in a column.
    pub fn key_set(&self, column: &str) -> HashSet<String> {
        self.distinct_text(column).into_iter().collect()
    }
}

/// Lenient numeric parse: strips thousands separators, `$`, whitespace.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Parse a date-time in any of the shapes found in exports: RFC 3339 (offset
/// normalized to UTC), naive date-times, or bare dates at midnight.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parse a calendar date. Date-time strings are truncated to their date;
/// `YYYY-MM` and `YYYY` resolve to the first day of the period.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc().date());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
        return Some(d);
    }
    if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
        let year: i32 = s.parse().ok()?;
        return NaiveDate::from_ymd_opt(year, 1, 1);
    }
    None
}

/// Coerce a cell to a date-time, degrading anything unparsable to `Null`.
pub fn to_datetime(value: &Value) -> Value {
    value.as_datetime().map(Value::DateTime).unwrap_or(Value::Null)
}

/// Coerce a cell to a date, degrading anything unparsable to `Null`.
pub fn to_date(value: &Value) -> Value {
    match value {
        Value::Date(d) => Value::Date(*d),
        Value::DateTime(dt) => Value::Date(dt.date()),
        Value::Text(s) => parse_date(s).map(Value::Date).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Coerce a cell to a number, preferring an integer when lossless.
pub fn to_number(value: &Value) -> Value {
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::Int(f as i64),
        Some(f) => Value::Float(f),
        None => Value::Null,
    }
}

/// Coerce a cell to a boolean. Unrecognized text becomes `Null`.
pub fn to_bool(value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::Bool(*b),
        Value::Int(i) => Value::Bool(*i != 0),
        Value::Float(f) => Value::Bool(*f != 0.0),
        Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => Value::Bool(true),
            "false" | "f" | "0" | "no" | "n" => Value::Bool(false),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}
