// shardstream-core/src/format/schema.rs

//! Column schema and sample encoding.
//!
//! A sample is encoded as:
//! ```text
//! +-----------------------------+
//! | u32 size per variable column|  <- little-endian, schema order
//! +-----------------------------+
//! | column data                 |  <- schema order; fixed-width columns
//! +-----------------------------+     are little-endian scalars
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Type of a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// UTF-8 text.
    Str,
    /// Opaque bytes.
    Bytes,
    /// Nested structured value, stored as JSON text.
    Json,
}

impl ColumnType {
    /// Encoded width for fixed-width types, `None` for variable-width ones.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::Str | Self::Bytes | Self::Json => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Ordered list of typed columns shared by every sample of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Column>", into = "Vec<Column>")]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Creates a schema, rejecting empty, blank or duplicate column names.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if columns.is_empty() {
            return Err(StreamError::schema("schema must declare at least one column"));
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.trim().is_empty() {
                return Err(StreamError::schema("column names must not be empty"));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(StreamError::schema(format!(
                    "duplicate column '{}'",
                    column.name
                )));
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn variable_columns(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| c.ty.fixed_size().is_none())
            .count()
    }

    /// Serializes `sample` in schema order.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMismatch` if a column is missing, has the wrong type, or
    /// the sample carries a field the schema does not declare.
    pub fn encode(&self, sample: &Sample) -> Result<Vec<u8>> {
        if sample.len() != self.columns.len() {
            for (name, _) in sample.iter() {
                if !self.columns.iter().any(|c| c.name == name) {
                    return Err(StreamError::schema(format!("unknown column '{name}'")));
                }
            }
        }

        let mut sizes = Vec::with_capacity(self.variable_columns());
        let mut body = Vec::new();

        for column in &self.columns {
            let value = sample
                .get(&column.name)
                .ok_or_else(|| StreamError::schema(format!("missing column '{}'", column.name)))?;
            if value.column_type() != column.ty {
                return Err(StreamError::schema(format!(
                    "column '{}' expects {:?}, got {:?}",
                    column.name,
                    column.ty,
                    value.column_type()
                )));
            }

            let start = body.len();
            value.write_to(&mut body)?;
            if column.ty.fixed_size().is_none() {
                let len = u32::try_from(body.len() - start).map_err(|_| {
                    StreamError::schema(format!("column '{}' exceeds 4 GiB", column.name))
                })?;
                sizes.push(len);
            }
        }

        let mut out = Vec::with_capacity(sizes.len() * 4 + body.len());
        for size in sizes {
            out.extend_from_slice(&size.to_le_bytes());
        }
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parses one encoded sample.
    pub fn decode(&self, data: &[u8]) -> Result<Sample> {
        let head_len = self.variable_columns() * 4;
        if data.len() < head_len {
            return Err(StreamError::decode(
                "sample",
                format!("{} bytes is shorter than the {head_len} byte size header", data.len()),
            ));
        }

        let mut sizes = data[..head_len]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as usize);
        let mut pos = head_len;
        let mut fields = Vec::with_capacity(self.columns.len());

        for column in &self.columns {
            let len = match column.ty.fixed_size() {
                Some(size) => size,
                None => sizes.next().unwrap_or_default(),
            };
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| {
                    StreamError::decode(
                        "sample",
                        format!("column '{}' runs past the end of the sample", column.name),
                    )
                })?;
            let value = Value::read_from(column.ty, &data[pos..end])
                .map_err(|e| StreamError::decode(format!("column '{}'", column.name), e))?;
            fields.push((column.name.clone(), value));
            pos = end;
        }

        if pos != data.len() {
            return Err(StreamError::decode(
                "sample",
                format!("{} trailing bytes", data.len() - pos),
            ));
        }

        Ok(Sample { fields })
    }
}

impl TryFrom<Vec<Column>> for Schema {
    type Error = StreamError;

    fn try_from(columns: Vec<Column>) -> Result<Self> {
        Schema::new(columns)
    }
}

impl From<Schema> for Vec<Column> {
    fn from(schema: Schema) -> Self {
        schema.columns
    }
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::U8(_) => ColumnType::U8,
            Self::U16(_) => ColumnType::U16,
            Self::U32(_) => ColumnType::U32,
            Self::U64(_) => ColumnType::U64,
            Self::I8(_) => ColumnType::I8,
            Self::I16(_) => ColumnType::I16,
            Self::I32(_) => ColumnType::I32,
            Self::I64(_) => ColumnType::I64,
            Self::F32(_) => ColumnType::F32,
            Self::F64(_) => ColumnType::F64,
            Self::Str(_) => ColumnType::Str,
            Self::Bytes(_) => ColumnType::Bytes,
            Self::Json(_) => ColumnType::Json,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Widens any unsigned integer column.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U8(v) => Some(u64::from(*v)),
            Self::U16(v) => Some(u64::from(*v)),
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Widens any signed integer column.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::U8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Str(s) => out.extend_from_slice(s.as_bytes()),
            Self::Bytes(b) => out.extend_from_slice(b),
            Self::Json(v) => serde_json::to_writer(out, v)
                .map_err(|e| StreamError::serialization(format!("json column: {e}")))?,
        }
        Ok(())
    }

    fn read_from(ty: ColumnType, raw: &[u8]) -> std::result::Result<Self, String> {
        fn fixed<const N: usize>(raw: &[u8]) -> std::result::Result<[u8; N], String> {
            raw.try_into()
                .map_err(|_| format!("expected {N} bytes, got {}", raw.len()))
        }

        Ok(match ty {
            ColumnType::U8 => Self::U8(u8::from_le_bytes(fixed(raw)?)),
            ColumnType::U16 => Self::U16(u16::from_le_bytes(fixed(raw)?)),
            ColumnType::U32 => Self::U32(u32::from_le_bytes(fixed(raw)?)),
            ColumnType::U64 => Self::U64(u64::from_le_bytes(fixed(raw)?)),
            ColumnType::I8 => Self::I8(i8::from_le_bytes(fixed(raw)?)),
            ColumnType::I16 => Self::I16(i16::from_le_bytes(fixed(raw)?)),
            ColumnType::I32 => Self::I32(i32::from_le_bytes(fixed(raw)?)),
            ColumnType::I64 => Self::I64(i64::from_le_bytes(fixed(raw)?)),
            ColumnType::F32 => Self::F32(f32::from_le_bytes(fixed(raw)?)),
            ColumnType::F64 => Self::F64(f64::from_le_bytes(fixed(raw)?)),
            ColumnType::Str => Self::Str(
                String::from_utf8(raw.to_vec()).map_err(|e| format!("invalid utf-8: {e}"))?,
            ),
            ColumnType::Bytes => Self::Bytes(raw.to_vec()),
            ColumnType::Json => {
                Self::Json(serde_json::from_slice(raw).map_err(|e| format!("invalid json: {e}"))?)
            }
        })
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
    String => Str, Vec<u8> => Bytes, serde_json::Value => Json,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

/// An ordered mapping from column name to value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sample {
    fields: Vec<(String, Value)>,
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets a field, replacing any previous value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }
}
