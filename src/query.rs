/// Result shapes an `on_query` hook returns, and their RowDescription /
/// DataRow / CommandComplete wire encoding.
use bytes::Bytes;
use std::collections::HashMap;

use crate::codec::BufferWriter;

/// Text-format column description. `table_oid`/`column_id` default to 0 and
/// `type_size`/`type_modifier` default to -1 when unknown, matching what
/// real backends send for ad hoc result sets.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub table_oid: i32,
    pub column_id: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    /// 0 = text, 1 = binary. This engine only emits text-format rows.
    pub format: i16,
}

impl Field {
    pub fn new(name: impl Into<String>, type_oid: i32) -> Self {
        Field {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// A single result row, keyed by column name so `on_query` hooks don't need
/// to track field order themselves.
pub type Row = HashMap<String, Option<Bytes>>;

/// One item of the lazy sequence an `on_query` hook may return.
#[derive(Debug, Clone)]
pub enum CommandResponse {
    /// A statement with no result set (INSERT/UPDATE/DELETE/...).
    Exec {
        command: String,
        affected_rows: u64,
    },
    /// A statement that produces a result set.
    Query {
        command: String,
        fields: Vec<Field>,
        rows: Vec<Row>,
        /// Overrides the row count CommandComplete reports; defaults to
        /// `rows.len()` when absent.
        affected_rows: Option<u64>,
    },
}

fn command_complete_tag(command: &str, count: u64) -> String {
    let upper = command.to_uppercase();
    if upper == "INSERT" {
        format!("INSERT 0 {}", count)
    } else {
        format!("{} {}", upper, count)
    }
}

pub fn encode_command_complete(command: &str, count: u64) -> Bytes {
    let mut w = BufferWriter::new();
    w.add_cstring(&command_complete_tag(command, count));
    w.flush(Some(b'C'))
}

pub fn encode_row_description(fields: &[Field]) -> Bytes {
    let mut w = BufferWriter::new();
    w.add_int16(fields.len() as i16);

    for field in fields {
        w.add_cstring(&field.name);
        w.add_int32(field.table_oid);
        w.add_int16(field.column_id);
        w.add_int32(field.type_oid);
        w.add_int16(field.type_size);
        w.add_int32(field.type_modifier);
        w.add_int16(field.format);
    }

    w.flush(Some(b'T'))
}

/// Encodes one DataRow. Column order follows `fields`; a row missing a
/// field's key is a fatal engine error rather than silently emitting NULL,
/// per the data model's "fails fatally" rule.
pub fn encode_data_row(fields: &[Field], row: &Row) -> crate::error::Result<Bytes> {
    let mut w = BufferWriter::new();
    w.add_int16(fields.len() as i16);

    for field in fields {
        match row.get(&field.name) {
            Some(Some(value)) => {
                w.add_int32(value.len() as i32);
                w.add(value);
            }
            Some(None) => {
                w.add_int32(-1);
            }
            None => {
                return Err(crate::error::Error::Protocol(format!(
                    "row missing column `{}`",
                    field.name
                )))
            }
        }
    }

    Ok(w.flush(Some(b'D')))
}

pub fn encode_empty_query_response() -> Bytes {
    BufferWriter::new().flush(Some(b'I'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_command_complete_uses_special_tag() {
        let bytes = encode_command_complete("insert", 3);
        assert!(bytes.ends_with(b"INSERT 0 3\0"));
    }

    #[test]
    fn select_command_complete_uses_upper_tag() {
        let bytes = encode_command_complete("select", 1);
        assert!(bytes.ends_with(b"SELECT 1\0"));
    }

    #[test]
    fn row_description_encodes_one_field() {
        let fields = vec![Field::new("x", 23)];
        let bytes = encode_row_description(&fields);
        assert_eq!(bytes[0], b'T');
        // Int16 field count right after the 5-byte header.
        assert_eq!(i16::from_be_bytes([bytes[5], bytes[6]]), 1);
    }

    #[test]
    fn data_row_missing_column_is_fatal() {
        let fields = vec![Field::new("x", 23)];
        let row: Row = HashMap::new();
        assert!(encode_data_row(&fields, &row).is_err());
    }
}
