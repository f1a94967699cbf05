//! Sandbox boundary codec.
//!
//! Arguments cross the sandbox as length-prefixed little-endian fields in
//! one request buffer; results come back as a status byte followed by a
//! payload (raw bytes, a JSON `FileInfo`, a JSON `FileInfo` list, or a JSON
//! `{kind, message}` error). The same encoding serves guest entry points
//! and host imports.
//!
//! Field encoding:
//! - string / byte field: `u32` length, then the bytes
//! - `i64` / `u32`: fixed-width little-endian
//!
//! Per-operation request layouts are documented on
//! [`crate::sandbox`].

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::vfs::{ErrorKind, FsError, FsResult};

/// Largest single field accepted from a guest (64 MiB).
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

/// Builds a request buffer field by field.
#[derive(Default)]
pub struct RequestBuilder {
    buf: Vec<u8>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn i64(mut self, value: i64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads a request buffer field by field.
pub struct RequestReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> RequestReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(buf) }
    }

    pub fn bytes(&mut self) -> FsResult<Vec<u8>> {
        let len = self
            .cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| FsError::invalid_argument("truncated request buffer"))?;
        if len > MAX_FIELD_LEN {
            return Err(FsError::invalid_argument("request field exceeds the size limit"));
        }
        let mut out = vec![0u8; len as usize];
        self.cursor
            .read_exact(&mut out)
            .map_err(|_| FsError::invalid_argument("truncated request buffer"))?;
        Ok(out)
    }

    pub fn str(&mut self) -> FsResult<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|_| FsError::invalid_argument("request field is not valid UTF-8"))
    }

    pub fn i64(&mut self) -> FsResult<i64> {
        self.cursor
            .read_i64::<LittleEndian>()
            .map_err(|_| FsError::invalid_argument("truncated request buffer"))
    }

    pub fn u32(&mut self) -> FsResult<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| FsError::invalid_argument("truncated request buffer"))
    }
}

/// Error shape crossing the sandbox boundary. The kind set is the closed
/// sandbox subset; host-side kinds outside it collapse to `Other`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

fn wire_kind(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "NotFound",
        ErrorKind::PermissionDenied => "PermissionDenied",
        ErrorKind::AlreadyExists => "AlreadyExists",
        ErrorKind::InvalidArgument => "InvalidArgument",
        _ => "Other",
    }
}

fn kind_from_wire(kind: &str) -> ErrorKind {
    match kind {
        "NotFound" => ErrorKind::NotFound,
        "PermissionDenied" => ErrorKind::PermissionDenied,
        "AlreadyExists" => ErrorKind::AlreadyExists,
        "InvalidArgument" => ErrorKind::InvalidArgument,
        _ => ErrorKind::Other,
    }
}

/// Successful response: status byte 1 followed by the payload.
pub fn ok_response(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(1);
    buf.extend_from_slice(payload);
    buf
}

/// Failed response: status byte 0 followed by the serialized error.
pub fn err_response(err: &FsError) -> Vec<u8> {
    let wire = WireError { kind: wire_kind(err.kind).to_owned(), message: err.message.clone() };
    let json = serde_json::to_vec(&wire).unwrap_or_default();
    let mut buf = Vec::with_capacity(json.len() + 1);
    buf.push(0);
    buf.extend_from_slice(&json);
    buf
}

/// Split a response buffer into its payload, or the carried error.
pub fn decode_response(buf: &[u8]) -> FsResult<Vec<u8>> {
    match buf.first() {
        Some(1) => Ok(buf[1..].to_vec()),
        Some(0) => {
            let wire: WireError = serde_json::from_slice(&buf[1..]).map_err(|_| {
                FsError::other("sandbox returned a malformed error payload")
            })?;
            Err(FsError::new(kind_from_wire(&wire.kind), wire.message))
        }
        _ => Err(FsError::other("sandbox returned a malformed response buffer")),
    }
}

/// Payload of `read` responses: eof byte, then the data.
pub fn encode_read_payload(data: &[u8], eof: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 1);
    buf.push(u8::from(eof));
    buf.extend_from_slice(data);
    buf
}

pub fn decode_read_payload(payload: &[u8]) -> FsResult<(Vec<u8>, bool)> {
    match payload.first() {
        Some(flag) => Ok((payload[1..].to_vec(), *flag != 0)),
        None => Err(FsError::other("sandbox returned an empty read payload")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_fields_round_trip() {
        let buf = RequestBuilder::new()
            .str("/a/b")
            .i64(-1)
            .u32(0o755)
            .bytes(b"\x00\x01payload")
            .finish();

        let mut reader = RequestReader::new(&buf);
        assert_eq!(reader.str().unwrap(), "/a/b");
        assert_eq!(reader.i64().unwrap(), -1);
        assert_eq!(reader.u32().unwrap(), 0o755);
        assert_eq!(reader.bytes().unwrap(), b"\x00\x01payload");
    }

    #[test]
    fn truncated_requests_are_rejected() {
        let buf = RequestBuilder::new().str("/path").finish();
        let mut reader = RequestReader::new(&buf[..2]);
        assert_eq!(reader.str().unwrap_err().kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn oversized_fields_are_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut reader = RequestReader::new(&buf);
        assert_eq!(reader.bytes().unwrap_err().kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn responses_round_trip() {
        let payload = decode_response(&ok_response(b"data")).expect("ok");
        assert_eq!(payload, b"data");

        let err = decode_response(&err_response(&FsError::not_found("/x"))).expect_err("err");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("/x"));

        // Kinds outside the sandbox subset collapse to Other.
        let err =
            decode_response(&err_response(&FsError::no_mount("/y"))).expect_err("collapsed");
        assert_eq!(err.kind, ErrorKind::Other);
    }

    #[test]
    fn read_payload_round_trips() {
        let (data, eof) = decode_read_payload(&encode_read_payload(b"abc", true)).expect("decode");
        assert_eq!(data, b"abc");
        assert!(eof);

        let (data, eof) = decode_read_payload(&encode_read_payload(b"", false)).expect("decode");
        assert!(data.is_empty());
        assert!(!eof);
    }
}
