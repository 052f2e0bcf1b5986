//! Length/value encoded record stream.
//!
//! Each record is a sequence of fields, each prefixed by its byte length as a
//! little-endian `i32`: `key`, optionally `subkey`, then `value`. Source
//! endpoints serve ranges in this encoding and the destination accepts it
//! unchanged for appends.
//!
//! [`LenvalParser`] accepts arbitrary chunks of a stream and hands out
//! complete records as raw frames, so a transfer can validate framing without
//! re-encoding the payload.

use crate::error::{ImportError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::json;

/// Wire layout of records on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFormat {
    /// Whether every record carries a subkey field between key and value.
    pub has_subkey: bool,
}

impl RecordFormat {
    /// Key, subkey and value; the layout the legacy cluster serves.
    pub const fn with_subkey() -> Self {
        Self { has_subkey: true }
    }

    fn field_count(&self) -> usize {
        if self.has_subkey {
            3
        } else {
            2
        }
    }

    /// Format descriptor understood by the destination HTTP proxy.
    pub fn to_format_spec(&self) -> serde_json::Value {
        json!({
            "$value": "yamr",
            "$attributes": {
                "lenval": true,
                "has_subkey": self.has_subkey,
            }
        })
    }
}

impl Default for RecordFormat {
    fn default() -> Self {
        Self::with_subkey()
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub subkey: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(
        key: impl Into<Bytes>,
        subkey: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            subkey: subkey.into(),
            value: value.into(),
        }
    }

    /// Append the encoded record to `buf`. The subkey is dropped when the
    /// format has none.
    pub fn encode(&self, format: RecordFormat, buf: &mut BytesMut) {
        put_field(buf, &self.key);
        if format.has_subkey {
            put_field(buf, &self.subkey);
        }
        put_field(buf, &self.value);
    }

    /// Decode exactly one record from a complete frame.
    pub fn decode(format: RecordFormat, mut frame: Bytes) -> Result<Self> {
        let key = take_field(&mut frame)?;
        let subkey = if format.has_subkey {
            take_field(&mut frame)?
        } else {
            Bytes::new()
        };
        let value = take_field(&mut frame)?;
        if frame.has_remaining() {
            return Err(ImportError::Record(format!(
                "record frame has {} trailing bytes",
                frame.remaining()
            )));
        }
        Ok(Self { key, subkey, value })
    }
}

/// Encode a batch of records.
pub fn encode_records<'a>(format: RecordFormat, records: impl IntoIterator<Item = &'a Record>) -> Bytes {
    let mut buf = BytesMut::new();
    for record in records {
        record.encode(format, &mut buf);
    }
    buf.freeze()
}

fn put_field(buf: &mut BytesMut, field: &[u8]) {
    buf.put_i32_le(field.len() as i32);
    buf.put_slice(field);
}

fn take_field(frame: &mut Bytes) -> Result<Bytes> {
    if frame.remaining() < 4 {
        return Err(ImportError::Record("record frame truncated".into()));
    }
    let len = frame.get_i32_le();
    if len < 0 || frame.remaining() < len as usize {
        return Err(ImportError::Record(format!(
            "record field length {} out of bounds",
            len
        )));
    }
    Ok(frame.split_to(len as usize))
}

/// Incremental parser over a length/value stream.
///
/// Feed chunks with [`extend`](Self::extend) and drain complete records with
/// [`next_frame`](Self::next_frame). A stream that ends with
/// [`buffered_len`](Self::buffered_len) > 0 was truncated.
pub struct LenvalParser {
    buffer: BytesMut,
    format: RecordFormat,
}

impl LenvalParser {
    pub fn new(format: RecordFormat) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            format,
        }
    }

    /// Append more data from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Split off the next complete record as raw bytes.
    ///
    /// Returns `Ok(None)` when more data is needed and an error on a negative
    /// field length, which the stream uses for control records this importer
    /// does not understand.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let mut offset = 0usize;
        for _ in 0..self.format.field_count() {
            let Some(header) = self.buffer.get(offset..offset + 4) else {
                return Ok(None);
            };
            let len = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if len < 0 {
                return Err(ImportError::Record(format!(
                    "unsupported control record (length {}) in record stream",
                    len
                )));
            }
            offset += 4 + len as usize;
        }

        if self.buffer.len() < offset {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(offset).freeze()))
    }

    /// Parse the next complete record.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        match self.next_frame()? {
            Some(frame) => Record::decode(self.format, frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Decode a complete stream, failing if it ends mid-record.
pub fn decode_all(format: RecordFormat, data: &[u8]) -> Result<Vec<Record>> {
    let mut parser = LenvalParser::new(format);
    parser.extend(data);
    let mut records = Vec::new();
    while let Some(record) = parser.next_record()? {
        records.push(record);
    }
    if parser.buffered_len() > 0 {
        return Err(ImportError::Record(format!(
            "record stream truncated: {} bytes left over",
            parser.buffered_len()
        )));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Record> {
        vec![
            Record::new("user1", "20130601", "clicks=3"),
            Record::new("user2", "", "clicks=0"),
            Record::new("", "", ""),
        ]
    }

    #[test]
    fn test_encoding_layout() {
        let bytes = encode_records(RecordFormat::with_subkey(), &[Record::new("k", "s", "vv")]);
        assert_eq!(
            &bytes[..],
            &[1, 0, 0, 0, b'k', 1, 0, 0, 0, b's', 2, 0, 0, 0, b'v', b'v']
        );
    }

    #[test]
    fn test_without_subkey_drops_field() {
        let format = RecordFormat { has_subkey: false };
        let bytes = encode_records(format, &[Record::new("k", "ignored", "v")]);
        assert_eq!(bytes.len(), 4 + 1 + 4 + 1);
        let decoded = decode_all(format, &bytes).unwrap();
        assert_eq!(decoded, vec![Record::new("k", "", "v")]);
    }

    #[test]
    fn test_parser_handles_arbitrary_chunking() {
        let format = RecordFormat::with_subkey();
        let records = sample();
        let bytes = encode_records(format, &records);

        let mut parser = LenvalParser::new(format);
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(3) {
            parser.extend(chunk);
            while let Some(record) = parser.next_record().unwrap() {
                decoded.push(record);
            }
        }
        assert_eq!(decoded, records);
        assert_eq!(parser.buffered_len(), 0);
    }

    #[test]
    fn test_truncated_stream_detected() {
        let format = RecordFormat::with_subkey();
        let bytes = encode_records(format, &sample());
        let err = decode_all(format, &bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, ImportError::Record(_)));
        assert!(err.to_string().contains("truncated"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut parser = LenvalParser::new(RecordFormat::with_subkey());
        parser.extend(&(-1i32).to_le_bytes());
        parser.extend(&[0, 0, 0, 0]);
        assert!(matches!(parser.next_frame(), Err(ImportError::Record(_))));
    }

    #[test]
    fn test_format_spec() {
        let spec = RecordFormat::with_subkey().to_format_spec();
        assert_eq!(spec["$value"], "yamr");
        assert_eq!(spec["$attributes"]["lenval"], true);
        assert_eq!(spec["$attributes"]["has_subkey"], true);
    }
}
