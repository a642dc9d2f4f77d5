/// Low-level helpers for the handful of messages that don't belong to the
/// codec, error encoder, or query modules: StartupMessage/SSLRequest
/// parsing and the small fixed-shape backend replies (AuthenticationOk,
/// ParameterStatus, ReadyForQuery).
use std::collections::HashMap;

use bytes::Bytes;

use crate::codec::{BufferReader, BufferWriter};
use crate::error::{Error, Result};

pub const PROTOCOL_MAJOR: i16 = 3;
pub const PROTOCOL_MINOR: i16 = 0;

/// `(1234, 5679)`, aka `80877103` as a single int32. The SSLRequest magic.
pub const SSL_REQUEST_CODE: i32 = 80877103;

#[derive(Debug)]
pub struct StartupRequest {
    pub major: i16,
    pub minor: i16,
    pub params: HashMap<String, String>,
}

impl StartupRequest {
    pub fn user(&self) -> Option<&str> {
        self.params.get("user").map(|s| s.as_str())
    }
}

/// The very first codeless frame is either an 8-byte SSLRequest or a
/// StartupMessage; both start with `<major><minor>` as two int16s once you
/// peel off the length the framing layer already consumed. SSLRequest's
/// "major/minor" pair, read as one int32, equals [`SSL_REQUEST_CODE`].
pub fn is_ssl_request(payload: &[u8]) -> bool {
    payload.len() == 4
        && i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) == SSL_REQUEST_CODE
}

/// Parses a StartupMessage body (after the initial 4-byte length the
/// framing layer already stripped): `<int16 major><int16 minor>` then
/// repeating `<cstring key><cstring value>` terminated by an empty key.
pub fn parse_startup(payload: &[u8]) -> Result<StartupRequest> {
    let mut r = BufferReader::new(payload);
    let major = r.int16()?;
    let minor = r.int16()?;

    let mut params = HashMap::new();
    loop {
        let key = r.cstring()?;
        if key.is_empty() {
            break;
        }
        let value = r.cstring()?;
        params.insert(key, value);
    }

    if !params.contains_key("user") {
        return Err(Error::Protocol("StartupMessage missing `user`".into()));
    }

    Ok(StartupRequest {
        major,
        minor,
        params,
    })
}

/// AuthenticationOk: `R` + Int32(0).
pub fn encode_auth_ok() -> Bytes {
    let mut w = BufferWriter::new();
    w.add_int32(0);
    w.flush(Some(b'R'))
}

/// ParameterStatus: `S` + cstring name + cstring value.
pub fn encode_parameter_status(name: &str, value: &str) -> Bytes {
    let mut w = BufferWriter::new();
    w.add_cstring(name);
    w.add_cstring(value);
    w.flush(Some(b'S'))
}

/// ReadyForQuery: `Z` + one status byte (`I`/`T`/`E`).
pub fn encode_ready_for_query(status: u8) -> Bytes {
    let mut w = BufferWriter::new();
    w.add(&[status]);
    w.flush(Some(b'Z'))
}

/// The single-byte SSL negotiation reply (`S` accepts, `N` declines). Has no
/// length prefix at all, hence `flush(None)`.
pub fn encode_ssl_response(accept: bool) -> Bytes {
    let mut w = BufferWriter::new();
    w.add(if accept { b"S" } else { b"N" });
    w.flush(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_ssl_request_magic() {
        let payload = SSL_REQUEST_CODE.to_be_bytes();
        assert!(is_ssl_request(&payload));
        assert!(!is_ssl_request(&[0, 0, 0, 0]));
    }

    #[test]
    fn parses_startup_params_and_requires_user() {
        let mut body = Vec::new();
        body.extend_from_slice(&3i16.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(b"user\0postgres\0");
        body.push(0);

        let req = parse_startup(&body).unwrap();
        assert_eq!(req.user(), Some("postgres"));
    }

    #[test]
    fn rejects_startup_without_user() {
        let mut body = Vec::new();
        body.extend_from_slice(&3i16.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.push(0);

        assert!(parse_startup(&body).is_err());
    }
}
