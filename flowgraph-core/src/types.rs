use serde::{Deserialize, Serialize};

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ─── DataType ───────────────────────────────────────────────────

/// Canonical set of column types (§3). Every concrete type has a stable
/// textual name used in persistence and error messages (see `registry`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Boolean,
    String,
    Binary,
    Date,
    Time,
    Datetime,
    Duration,
    List(Box<DataType>),
    Struct(Vec<(String, DataType)>),
    Null,
    Unknown,
}

// ─── Column / Schema ────────────────────────────────────────────

/// `(name, data_type, nullable)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// An ordered sequence of [`Column`]s with unique names (§3).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema(pub Vec<Column>);

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self(columns)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.0.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn push(&mut self, column: Column) {
        self.0.push(column);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ─── Scalar value ───────────────────────────────────────────────

/// A scalar value: sample cells, formula literals, default expressions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::I64(n) => write!(f, "{n}"),
            Value::F64(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}
