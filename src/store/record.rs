//! On-disk record format for queue logs.
//!
//! ```text
//! offset+0   u32  frame length (bytes after this field)
//! offset+4   u8   valid flag (1 = live, 0 = invalidated)
//! offset+5   u8   format version
//! offset+6   u16  reserved
//! offset+8   u32  crc32 of payload
//! offset+12  ...  payload (properties + body)
//! ```
//!
//! The valid flag sits at a fixed offset so removing a message rewrites a
//! single byte and never touches the variable-length payload.

use std::collections::HashMap;

use crate::message::{BasicProperties, DeliveryMode, RecordLocation};
use crate::{Error, Result};

pub const RECORD_HEADER_SIZE: usize = 12;
pub const VALID_FLAG_OFFSET: u64 = 4;
pub const RECORD_VERSION: u8 = 1;
/// Upper bound on a single record, guards recovery against garbage lengths.
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub payload_len: u32,
    pub valid: bool,
    pub version: u8,
    pub checksum: u32,
}

impl RecordHeader {
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            payload_len: payload.len() as u32,
            valid: true,
            version: RECORD_VERSION,
            checksum: crc32(payload),
        }
    }

    /// Total record length including the header.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload_len as usize
    }

    pub fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        let frame_len = self.record_len() as u32 - 4;
        buf[0..4].copy_from_slice(&frame_len.to_le_bytes());
        buf[4] = u8::from(self.valid);
        buf[5] = self.version;
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Reads only the length field. Enough to find the next record even
    /// when the rest of the header is damaged.
    pub fn frame_len(bytes: &[u8; RECORD_HEADER_SIZE]) -> Result<usize> {
        let frame_len = read_u32(&bytes[0..4]) as usize;
        check_record_len(frame_len + 4)?;
        Ok(frame_len)
    }

    pub fn from_bytes(bytes: &[u8; RECORD_HEADER_SIZE]) -> Result<Self> {
        let frame_len = Self::frame_len(bytes)?;
        let version = bytes[5];
        if version != RECORD_VERSION {
            return Err(Error::Corrupt("unknown record version"));
        }
        let valid = match bytes[4] {
            0 => false,
            1 => true,
            _ => return Err(Error::Corrupt("bad valid flag")),
        };
        Ok(Self {
            payload_len: (frame_len + 4 - RECORD_HEADER_SIZE) as u32,
            valid,
            version,
            checksum: read_u32(&bytes[8..12]),
        })
    }

    pub fn validate_crc(&self, payload: &[u8]) -> Result<()> {
        if crc32(payload) == self.checksum {
            Ok(())
        } else {
            Err(Error::Corrupt("crc mismatch"))
        }
    }
}

pub fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Rejects record lengths recovery could not frame.
pub fn check_record_len(record_len: usize) -> Result<()> {
    if record_len < RECORD_HEADER_SIZE {
        return Err(Error::Corrupt("record frame shorter than header"));
    }
    if record_len > MAX_RECORD_LEN {
        return Err(Error::RecordTooLarge {
            len: record_len,
            max: MAX_RECORD_LEN,
        });
    }
    Ok(())
}

/// Builds a complete record (header + payload) for a message. Fails with
/// [`Error::RecordTooLarge`] past [`MAX_RECORD_LEN`].
pub fn encode_record(properties: &BasicProperties, body: &[u8]) -> Result<Vec<u8>> {
    let payload = encode_payload(properties, body);
    check_record_len(RECORD_HEADER_SIZE + payload.len())?;
    let header = RecordHeader::for_payload(&payload);
    let mut record = Vec::with_capacity(header.record_len());
    record.extend_from_slice(&header.to_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

pub fn encode_payload(properties: &BasicProperties, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + body.len());
    put_str(&mut out, &properties.id);
    put_str(&mut out, &properties.routing_key);
    out.push(properties.delivery_mode.as_u8());
    out.push(properties.priority);
    out.extend_from_slice(&properties.timestamp_ns.to_le_bytes());
    put_str(&mut out, &properties.correlation_id);
    put_str(&mut out, &properties.reply_to);
    put_str(&mut out, &properties.content_type);

    let mut headers: Vec<_> = properties.headers.iter().collect();
    headers.sort();
    out.extend_from_slice(&(headers.len() as u32).to_le_bytes());
    for (key, value) in headers {
        put_str(&mut out, key);
        put_str(&mut out, value);
    }

    put_bytes(&mut out, body);
    out
}

pub fn decode_payload(payload: &[u8]) -> Result<(BasicProperties, Vec<u8>)> {
    let mut reader = PayloadReader { buf: payload, pos: 0 };
    let id = reader.string()?;
    let routing_key = reader.string()?;
    let delivery_mode =
        DeliveryMode::from_u8(reader.u8()?).ok_or(Error::Corrupt("bad delivery mode"))?;
    let priority = reader.u8()?;
    let timestamp_ns = reader.u64()?;
    let correlation_id = reader.string()?;
    let reply_to = reader.string()?;
    let content_type = reader.string()?;

    let count = reader.u32()? as usize;
    let mut headers = HashMap::with_capacity(count.min(1024));
    for _ in 0..count {
        let key = reader.string()?;
        let value = reader.string()?;
        headers.insert(key, value);
    }

    let body = reader.bytes()?.to_vec();
    if reader.pos != payload.len() {
        return Err(Error::Corrupt("trailing bytes in record payload"));
    }

    let properties = BasicProperties {
        id,
        routing_key,
        headers,
        delivery_mode,
        priority,
        timestamp_ns,
        correlation_id,
        reply_to,
        content_type,
    };
    Ok((properties, body))
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_bytes(out, value.as_bytes());
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Error::Corrupt("record payload truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Corrupt("record string is not utf-8"))
    }
}

/// A record found while scanning a log image.
#[derive(Debug)]
pub struct ScannedRecord<'a> {
    pub location: RecordLocation,
    pub header: RecordHeader,
    pub payload: &'a [u8],
}

/// Totals gathered by [`scan_log`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub total: usize,
    pub invalid: usize,
    /// Records skipped for a bad checksum or a damaged header.
    pub corrupt: usize,
    /// Byte offset just past the last record the scan could frame.
    pub clean_end: u64,
    /// True when the image ends in a partial record.
    pub torn_tail: bool,
    /// Offset of a length field that is out of range. Nothing from there on
    /// can be framed.
    pub unframed_at: Option<u64>,
}

/// Walks a log image record by record.
///
/// `visit` sees every complete record whose header parses and whose
/// checksum verifies, live or not. A record with a damaged header or a bad
/// checksum is counted in `corrupt` and skipped using its length field. The
/// scan stops at a record that runs past the end of the image (`torn_tail`)
/// or at a length field that cannot be trusted (`unframed_at`).
pub fn scan_log<'a>(image: &'a [u8], mut visit: impl FnMut(ScannedRecord<'a>)) -> ScanSummary {
    let mut summary = ScanSummary::default();
    let mut offset = 0usize;

    while offset < image.len() {
        if offset + RECORD_HEADER_SIZE > image.len() {
            summary.torn_tail = true;
            break;
        }
        let mut header_buf = [0u8; RECORD_HEADER_SIZE];
        header_buf.copy_from_slice(&image[offset..offset + RECORD_HEADER_SIZE]);
        let frame_len = match RecordHeader::frame_len(&header_buf) {
            Ok(frame_len) => frame_len,
            Err(_) => {
                summary.unframed_at = Some(offset as u64);
                break;
            }
        };
        let end = offset + 4 + frame_len;
        if end > image.len() {
            summary.torn_tail = true;
            break;
        }

        summary.total += 1;
        match RecordHeader::from_bytes(&header_buf) {
            Ok(header) => {
                let payload = &image[offset + RECORD_HEADER_SIZE..end];
                if !header.valid {
                    summary.invalid += 1;
                }
                if header.validate_crc(payload).is_err() {
                    summary.corrupt += 1;
                } else {
                    visit(ScannedRecord {
                        location: RecordLocation {
                            offset: offset as u64,
                            len: header.record_len() as u32,
                        },
                        header,
                        payload,
                    });
                }
            }
            Err(_) => summary.corrupt += 1,
        }

        offset = end;
        summary.clean_end = end as u64;
    }

    summary
}
