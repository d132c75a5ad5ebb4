//! Column-major data blocks
//!
//! A [`Block`] is an ordered set of named, typed, growable column arrays. It
//! mirrors the destination's storage layout so flushing never transposes:
//! the translator appends straight into the per-column vectors.
//!
//! Materialized tables carry two trailer columns in fixed positions: `_sign`
//! (`Int8`, ±1) and `_version` (`UInt64`), always the last two columns.

use crate::error::{Result, SyncError};

/// Number of trailer columns (`_sign`, `_version`) on a materialized table.
pub const TRAILER_COLUMNS: usize = 2;

/// Destination column kinds the translator can fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
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
    String,
    FixedString(usize),
    Nullable(Box<ColumnKind>),
}

impl ColumnKind {
    /// Parse a destination type name.
    ///
    /// Destination adapters use this when reading catalog metadata; a name
    /// outside the supported set is an [`SyncError::UnsupportedColumnType`].
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if let Some(inner) = name.strip_prefix("Nullable(").and_then(|s| s.strip_suffix(')')) {
            return Ok(ColumnKind::Nullable(Box::new(ColumnKind::parse(inner)?)));
        }
        if let Some(len) = name.strip_prefix("FixedString(").and_then(|s| s.strip_suffix(')')) {
            let len = len
                .trim()
                .parse()
                .map_err(|_| SyncError::unsupported(name.to_string()))?;
            return Ok(ColumnKind::FixedString(len));
        }
        match name {
            "Int8" => Ok(ColumnKind::Int8),
            "Int16" => Ok(ColumnKind::Int16),
            "Int32" => Ok(ColumnKind::Int32),
            "Int64" => Ok(ColumnKind::Int64),
            "UInt8" => Ok(ColumnKind::UInt8),
            "UInt16" => Ok(ColumnKind::UInt16),
            "UInt32" => Ok(ColumnKind::UInt32),
            "UInt64" => Ok(ColumnKind::UInt64),
            "Float32" => Ok(ColumnKind::Float32),
            "Float64" => Ok(ColumnKind::Float64),
            "String" => Ok(ColumnKind::String),
            other => Err(SyncError::unsupported(other.to_string())),
        }
    }
}

/// A named column declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Typed column storage. One growable array per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    String(Vec<Vec<u8>>),
    FixedString { len: usize, values: Vec<Vec<u8>> },
}

impl ColumnData {
    fn empty(kind: &ColumnKind) -> Self {
        match kind {
            ColumnKind::Int8 => ColumnData::Int8(Vec::new()),
            ColumnKind::Int16 => ColumnData::Int16(Vec::new()),
            ColumnKind::Int32 => ColumnData::Int32(Vec::new()),
            ColumnKind::Int64 => ColumnData::Int64(Vec::new()),
            ColumnKind::UInt8 => ColumnData::UInt8(Vec::new()),
            ColumnKind::UInt16 => ColumnData::UInt16(Vec::new()),
            ColumnKind::UInt32 => ColumnData::UInt32(Vec::new()),
            ColumnKind::UInt64 => ColumnData::UInt64(Vec::new()),
            ColumnKind::Float32 => ColumnData::Float32(Vec::new()),
            ColumnKind::Float64 => ColumnData::Float64(Vec::new()),
            ColumnKind::String => ColumnData::String(Vec::new()),
            ColumnKind::FixedString(len) => ColumnData::FixedString {
                len: *len,
                values: Vec::new(),
            },
            // Nullable wraps the nested storage; the null map lives on the Column.
            ColumnKind::Nullable(inner) => ColumnData::empty(inner),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int8(v) => v.len(),
            ColumnData::Int16(v) => v.len(),
            ColumnData::Int32(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::UInt8(v) => v.len(),
            ColumnData::UInt16(v) => v.len(),
            ColumnData::UInt32(v) => v.len(),
            ColumnData::UInt64(v) => v.len(),
            ColumnData::Float32(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::String(v) => v.len(),
            ColumnData::FixedString { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated payload size in bytes.
    pub fn bytes(&self) -> usize {
        match self {
            ColumnData::Int8(v) => v.len(),
            ColumnData::Int16(v) => v.len() * 2,
            ColumnData::Int32(v) => v.len() * 4,
            ColumnData::Int64(v) => v.len() * 8,
            ColumnData::UInt8(v) => v.len(),
            ColumnData::UInt16(v) => v.len() * 2,
            ColumnData::UInt32(v) => v.len() * 4,
            ColumnData::UInt64(v) => v.len() * 8,
            ColumnData::Float32(v) => v.len() * 4,
            ColumnData::Float64(v) => v.len() * 8,
            ColumnData::String(v) => v.iter().map(|b| b.len()).sum(),
            ColumnData::FixedString { len, values } => len * values.len(),
        }
    }

    /// Append the kind's default value (zero / empty / zero-padded).
    pub fn push_default(&mut self) {
        match self {
            ColumnData::Int8(v) => v.push(0),
            ColumnData::Int16(v) => v.push(0),
            ColumnData::Int32(v) => v.push(0),
            ColumnData::Int64(v) => v.push(0),
            ColumnData::UInt8(v) => v.push(0),
            ColumnData::UInt16(v) => v.push(0),
            ColumnData::UInt32(v) => v.push(0),
            ColumnData::UInt64(v) => v.push(0),
            ColumnData::Float32(v) => v.push(0.0),
            ColumnData::Float64(v) => v.push(0.0),
            ColumnData::String(v) => v.push(Vec::new()),
            ColumnData::FixedString { len, values } => values.push(vec![0; *len]),
        }
    }
}

/// One column of a block: declaration plus storage.
///
/// `null_map` is present exactly for `Nullable(_)` declarations; a `1` marks
/// a NULL slot (the storage then holds the kind's default at that position).
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub data: ColumnData,
    pub null_map: Option<Vec<u8>>,
}

impl Column {
    pub fn empty(schema: &ColumnSchema) -> Self {
        let null_map = matches!(schema.kind, ColumnKind::Nullable(_)).then(Vec::new);
        Self {
            name: schema.name.clone(),
            kind: schema.kind.clone(),
            data: ColumnData::empty(&schema.kind),
            null_map,
        }
    }
}

/// An ordered, column-major container matching a destination table's layout.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub columns: Vec<Column>,
}

impl Block {
    /// Build an empty block from a column schema.
    pub fn from_schema(schema: &[ColumnSchema]) -> Self {
        Self {
            columns: schema.iter().map(Column::empty).collect(),
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Row count (length of the first column; all columns stay aligned).
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Estimated payload size across all columns.
    pub fn bytes(&self) -> usize {
        self.columns.iter().map(|c| c.data.bytes()).sum()
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn column_mut(&mut self, index: usize) -> &mut Column {
        &mut self.columns[index]
    }

    pub fn position_by_name(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// An empty block with the same column declarations.
    pub fn clone_empty(&self) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|c| {
                    Column::empty(&ColumnSchema {
                        name: c.name.clone(),
                        kind: c.kind.clone(),
                    })
                })
                .collect(),
        }
    }

    /// An empty block keeping only the first `count` column declarations.
    ///
    /// Used by the snapshot dump, which inserts ordinary columns and leaves
    /// the trailer columns to their destination-side defaults.
    pub fn head_columns(&self, count: usize) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .take(count)
                .map(|c| {
                    Column::empty(&ColumnSchema {
                        name: c.name.clone(),
                        kind: c.kind.clone(),
                    })
                })
                .collect(),
        }
    }

    /// Mutable access to the `_sign` and `_version` trailer columns.
    pub fn trailer_columns_mut(&mut self) -> Result<(&mut Column, &mut Column)> {
        let count = self.columns.len();
        if count < TRAILER_COLUMNS {
            return Err(SyncError::logical(
                "materialized block is missing its sign/version trailer columns",
            ));
        }
        let (_, tail) = self.columns.split_at_mut(count - TRAILER_COLUMNS);
        if let [sign, version] = tail {
            Ok((sign, version))
        } else {
            Err(SyncError::logical("trailer split produced the wrong arity"))
        }
    }
}
