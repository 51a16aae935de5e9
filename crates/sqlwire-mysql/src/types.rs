//! Result set metadata and text-protocol value decoding.
//!
//! A text result set is a column count, one column definition packet per
//! column, then one packet per row in which every value is a
//! length-encoded string (`0xFB` for NULL). The column type decides how
//! the string is turned into a [`Value`].

use std::sync::Arc;

use sqlwire_core::{ColumnInfo, Result, Row, Value};

use crate::protocol::{PacketReader, invalid_response};

/// `MYSQL_TYPE_*` codes carried in column definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Unknown codes decode as `String`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 | 0x11 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A | 0x0E => FieldType::Date,
            0x0B | 0x13 => FieldType::Time,
            0x0C | 0x12 => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    /// BLOB-family codes; text columns share them and differ by the
    /// `BINARY` flag and collation.
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }
}

/// Column definition flags.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNSIGNED: u16 = 32;
    pub const BINARY: u16 = 128;
    pub const AUTO_INCREMENT: u16 = 512;
}

/// Collation id 63, the `binary` pseudo character set.
const BINARY_COLLATION: u16 = 63;

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub schema: String,
    /// Table name or alias
    pub table: String,
    /// Column name or alias
    pub name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a 4.1 column definition packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(payload);
        let missing = |field: &str| {
            invalid_response(format!("column definition missing {field}"), payload)
        };

        let _catalog = reader.read_lenenc_bytes().ok_or_else(|| missing("catalog"))?;
        let schema = reader.read_lenenc_string().ok_or_else(|| missing("schema"))?;
        let table = reader.read_lenenc_string().ok_or_else(|| missing("table"))?;
        let _org_table = reader.read_lenenc_bytes().ok_or_else(|| missing("org_table"))?;
        let name = reader.read_lenenc_string().ok_or_else(|| missing("name"))?;
        let _org_name = reader.read_lenenc_bytes().ok_or_else(|| missing("org_name"))?;
        reader.read_lenenc_int().ok_or_else(|| missing("fixed length"))?;

        let charset = reader.read_u16_le().ok_or_else(|| missing("charset"))?;
        let column_length = reader.read_u32_le().ok_or_else(|| missing("length"))?;
        let column_type = FieldType::from_u8(reader.read_u8().ok_or_else(|| missing("type"))?);
        let flags = reader.read_u16_le().ok_or_else(|| missing("flags"))?;
        let decimals = reader.read_u8().ok_or_else(|| missing("decimals"))?;

        Ok(Self {
            schema,
            table,
            name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    /// Does the column hold raw bytes rather than text?
    pub const fn is_binary(&self) -> bool {
        self.charset == BINARY_COLLATION
            && (self.column_type.is_blob()
                || matches!(
                    self.column_type,
                    FieldType::Bit | FieldType::VarString | FieldType::String | FieldType::VarChar
                ))
    }
}

/// Decode one text-protocol value.
///
/// Numbers that fail to parse are kept as text rather than dropped.
pub fn decode_text_value(column: &ColumnDef, data: &[u8]) -> Value {
    if column.is_binary() {
        return Value::Bytes(data.to_vec());
    }
    let text = String::from_utf8_lossy(data);

    match column.column_type {
        ty if ty.is_integer() => {
            if let Ok(v) = text.parse::<i64>() {
                Value::Int(v)
            } else if let Ok(v) = text.parse::<u64>() {
                Value::UInt(v)
            } else {
                Value::Text(text.into_owned())
            }
        }
        FieldType::Float | FieldType::Double => text
            .parse::<f64>()
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),
        FieldType::Json => serde_json::from_str(&text)
            .map_or_else(|_| Value::Text(text.into_owned()), Value::Json),
        FieldType::Null => Value::Null,
        _ => Value::Text(text.into_owned()),
    }
}

/// Decode a text-protocol row packet.
pub fn decode_text_row(
    payload: &[u8],
    columns: &[ColumnDef],
    info: &Arc<ColumnInfo>,
) -> Result<Row> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());

    for column in columns {
        if reader.peek() == Some(0xFB) {
            reader.skip(1);
            values.push(Value::Null);
            continue;
        }
        let data = reader.read_lenenc_bytes().ok_or_else(|| {
            invalid_response(format!("row truncated at column '{}'", column.name), payload)
        })?;
        values.push(decode_text_value(column, &data));
    }

    Ok(Row::with_columns(Arc::clone(info), values))
}
