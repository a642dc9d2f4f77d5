/// Structured backend error/notice records and their ErrorResponse /
/// NoticeResponse wire encoding.
use bytes::Bytes;

use crate::codec::BufferWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
    Panic,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Fatal => "FATAL",
            Severity::Panic => "PANIC",
        }
    }
}

/// A structured ErrorResponse/NoticeResponse payload. Only `severity`,
/// `code`, and `message` are required; every other field is an optional
/// cstring tag.
#[derive(Debug, Clone)]
pub struct BackendError {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl BackendError {
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError {
            severity,
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            internal_position: None,
            internal_query: None,
            where_: None,
            schema: None,
            table: None,
            column: None,
            data_type: None,
            constraint: None,
            file: None,
            line: None,
            routine: None,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, code, message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Encodes this record as an ErrorResponse (`E`) frame.
    pub fn encode(&self) -> Bytes {
        self.encode_as(b'E')
    }

    /// Encodes this record as a NoticeResponse (`N`) frame.
    pub fn encode_notice(&self) -> Bytes {
        self.encode_as(b'N')
    }

    fn encode_as(&self, code: u8) -> Bytes {
        let mut w = BufferWriter::new();

        w.add(b"S").add_cstring(self.severity.as_str());
        w.add(b"V").add_cstring(self.severity.as_str());
        w.add(b"C").add_cstring(&self.code);
        w.add(b"M").add_cstring(&self.message);

        if let Some(v) = &self.detail {
            w.add(b"D").add_cstring(v);
        }
        if let Some(v) = &self.hint {
            w.add(b"H").add_cstring(v);
        }
        if let Some(v) = &self.position {
            w.add(b"P").add_cstring(v);
        }
        if let Some(v) = &self.internal_position {
            w.add(b"p").add_cstring(v);
        }
        if let Some(v) = &self.internal_query {
            w.add(b"q").add_cstring(v);
        }
        if let Some(v) = &self.where_ {
            w.add(b"W").add_cstring(v);
        }
        if let Some(v) = &self.schema {
            w.add(b"s").add_cstring(v);
        }
        if let Some(v) = &self.table {
            w.add(b"t").add_cstring(v);
        }
        if let Some(v) = &self.column {
            w.add(b"c").add_cstring(v);
        }
        if let Some(v) = &self.data_type {
            w.add(b"d").add_cstring(v);
        }
        if let Some(v) = &self.constraint {
            w.add(b"n").add_cstring(v);
        }
        if let Some(v) = &self.file {
            w.add(b"F").add_cstring(v);
        }
        if let Some(v) = &self.line {
            w.add(b"L").add_cstring(v);
        }
        if let Some(v) = &self.routine {
            w.add(b"R").add_cstring(v);
        }

        w.add(&[0u8]); // terminating empty tag

        w.flush(Some(code))
    }

    /// Parses a previously encoded ErrorResponse/NoticeResponse payload
    /// (frame body, i.e. everything after the 1-byte code and 4-byte
    /// length). Used by the round-trip test and by consumers that want to
    /// inspect frames they captured off the wire.
    pub fn decode(payload: &[u8]) -> Option<BackendError> {
        let mut severity = None;
        let mut code = None;
        let mut message = None;
        let mut err = BackendError::new(Severity::Error, "", "");

        let mut i = 0;
        while i < payload.len() {
            let tag = payload[i];
            if tag == 0 {
                break;
            }
            i += 1;

            let start = i;
            while i < payload.len() && payload[i] != 0 {
                i += 1;
            }
            let value = String::from_utf8(payload[start..i].to_vec()).ok()?;
            i += 1; // skip terminator

            match tag {
                b'S' => {
                    severity = Some(match value.as_str() {
                        "FATAL" => Severity::Fatal,
                        "PANIC" => Severity::Panic,
                        _ => Severity::Error,
                    })
                }
                b'C' => code = Some(value),
                b'M' => message = Some(value),
                b'D' => err.detail = Some(value),
                b'H' => err.hint = Some(value),
                b'P' => err.position = Some(value),
                b'p' => err.internal_position = Some(value),
                b'q' => err.internal_query = Some(value),
                b'W' => err.where_ = Some(value),
                b's' => err.schema = Some(value),
                b't' => err.table = Some(value),
                b'c' => err.column = Some(value),
                b'd' => err.data_type = Some(value),
                b'n' => err.constraint = Some(value),
                b'F' => err.file = Some(value),
                b'L' => err.line = Some(value),
                b'R' => err.routine = Some(value),
                _ => {}
            }
        }

        err.severity = severity?;
        err.code = code?;
        err.message = message?;

        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_all_fields() {
        let err = BackendError::new(Severity::Fatal, "28P01", "password authentication failed")
            .with_detail("detail")
            .with_hint("hint");

        let frame = err.encode();
        // payload starts after 1-byte code + 4-byte length
        let decoded = BackendError::decode(&frame[5..]).unwrap();

        assert_eq!(decoded.severity, Severity::Fatal);
        assert_eq!(decoded.code, "28P01");
        assert_eq!(decoded.message, "password authentication failed");
        assert_eq!(decoded.detail.as_deref(), Some("detail"));
        assert_eq!(decoded.hint.as_deref(), Some("hint"));
    }
}
