use chrono::NaiveDateTime;
use std::fmt;

/// A single column value read from or written to MySQL.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Interpret the value as an unsigned id. Text is parsed, negative numbers are rejected.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DbValue::Int(v) => u64::try_from(*v).ok(),
            DbValue::UInt(v) => Some(*v),
            DbValue::Float(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as u64),
            DbValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DbValue::Int(v) => Some(*v),
            DbValue::UInt(v) => i64::try_from(*v).ok(),
            DbValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Textual representation, `None` for NULL and non-UTF-8 payloads.
    pub fn as_string(&self) -> Option<String> {
        match self {
            DbValue::Null => None,
            DbValue::Bytes(b) => String::from_utf8(b.clone()).ok(),
            DbValue::Int(v) => Some(v.to_string()),
            DbValue::UInt(v) => Some(v.to_string()),
            DbValue::Float(v) => Some(v.to_string()),
            DbValue::Text(s) => Some(s.clone()),
            DbValue::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            DbValue::Int(v) => *v != 0,
            DbValue::UInt(v) => *v != 0,
            DbValue::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

impl fmt::Display for DbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbValue::Null => write!(f, "NULL"),
            DbValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            other => write!(f, "{}", other.as_string().unwrap_or_default()),
        }
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Int(v)
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Int(v as i64)
    }
}

impl From<u64> for DbValue {
    fn from(v: u64) -> Self {
        DbValue::UInt(v)
    }
}

impl From<u32> for DbValue {
    fn from(v: u32) -> Self {
        DbValue::UInt(v as u64)
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Int(v as i64)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(v: Vec<u8>) -> Self {
        DbValue::Bytes(v)
    }
}

impl From<NaiveDateTime> for DbValue {
    fn from(v: NaiveDateTime) -> Self {
        DbValue::DateTime(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DbValue::Null)
    }
}

/// A row with ordered, named columns. Column lookups are case-insensitive
/// because MySQL reports column names the way they were declared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<DbValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, replacing an existing column of the same name.
    pub fn with(mut self, column: &str, value: impl Into<DbValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<DbValue>) {
        let value = value.into();
        match self.position(column) {
            Some(idx) => self.values[idx] = value,
            None => {
                self.columns.push(column.to_string());
                self.values.push(value);
            }
        }
    }

    pub fn get(&self, column: &str) -> Option<&DbValue> {
        self.position(column).map(|idx| &self.values[idx])
    }

    pub fn get_u64(&self, column: &str) -> Option<u64> {
        self.get(column).and_then(DbValue::as_u64)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(DbValue::as_i64)
    }

    pub fn get_string(&self, column: &str) -> Option<String> {
        self.get(column).and_then(DbValue::as_string)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[DbValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DbValue)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }
}
