//! Dynamically tagged field values
//!
//! A [`Field`] is one cell of a row image as it arrives from the source: the
//! binlog decoder and the query connections both produce rows of fields. The
//! tag set is closed; the translator dispatches on the destination column
//! kind first and then pulls the matching variant.

/// One field of a source row image.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// SQL NULL.
    Null,
    /// The 64-bit wire representation of an integer column. Narrower
    /// destination columns truncate from this.
    UInt64(u64),
    /// Reserved for `MYSQL_TYPE_INT24` images, which arrive as a 32-bit value
    /// whose bit 23 drives sign extension.
    Int64(i64),
    /// Any floating point value; 32-bit destinations narrow from this.
    Float64(f64),
    /// String and fixed-string payloads, copied byte-for-byte. No transcoding.
    Bytes(Vec<u8>),
}

impl Field {
    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }

    /// Read the field as text, if it carries bytes.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Field::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Read the field as an unsigned 64-bit integer, parsing textual payloads.
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            Field::UInt64(value) => Some(*value),
            Field::Int64(value) => u64::try_from(*value).ok(),
            Field::Bytes(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Bytes(value.as_bytes().to_vec())
    }
}

impl From<u64> for Field {
    fn from(value: u64) -> Self {
        Field::UInt64(value)
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Field::Float64(value)
    }
}
