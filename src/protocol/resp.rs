//! RESP2 protocol encoder and decoder.
//!
//! Commands go out as arrays of bulk strings; replies come back as
//! [`Value`]s. Decoding is streaming: a partial reply leaves the buffer
//! untouched so the caller can read more bytes and try again.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

use super::value::{Command, Value};
use crate::error::{MigrationError, Result};

/// Encode a command as a RESP2 array of bulk strings.
///
/// # Example wire format
/// ```text
/// *3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n
/// ```
pub fn encode_command(args: &[Bytes], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");

    for arg in args {
        buf.put_u8(b'$');
        buf.put_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Encode a whole pipeline into one buffer.
pub fn encode_pipeline(commands: &[Command], buf: &mut BytesMut) {
    for cmd in commands {
        encode_command(cmd.as_args(), buf);
    }
}

/// Attempt to decode a RESP2 value from the buffer.
///
/// Returns `Ok(Some(value))` if a complete frame was parsed,
/// `Ok(None)` if more data is needed, or `Err` if the data is malformed.
pub fn decode_value(buf: &mut BytesMut) -> Result<Option<Value>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&buf[..]);

    match check_complete(&mut cursor) {
        Ok(Some(len)) => {
            cursor.set_position(0);
            let value = parse_value(&mut cursor)?;
            buf.advance(len);
            Ok(Some(value))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if a complete frame is available, returning its byte length.
fn check_complete(cursor: &mut Cursor<&[u8]>) -> Result<Option<usize>> {
    let Some(byte) = peek_byte(cursor) else {
        return Ok(None);
    };
    match byte {
        b'+' | b'-' | b':' => {
            if find_line(cursor).is_none() {
                return Ok(None);
            }
            Ok(Some(cursor.position() as usize))
        }
        b'$' => {
            cursor.advance(1);
            let Some(len) = read_decimal(cursor)? else {
                return Ok(None);
            };
            if len == -1 {
                Ok(Some(cursor.position() as usize))
            } else if len < -1 {
                Err(MigrationError::Protocol("negative bulk string length".into()))
            } else {
                let total = cursor.position() as usize + len as usize + 2;
                if cursor.get_ref().len() < total {
                    Ok(None)
                } else {
                    cursor.set_position(total as u64);
                    Ok(Some(total))
                }
            }
        }
        b'*' => {
            cursor.advance(1);
            let Some(count) = read_decimal(cursor)? else {
                return Ok(None);
            };
            if count == -1 {
                Ok(Some(cursor.position() as usize))
            } else if count < -1 {
                Err(MigrationError::Protocol("negative array length".into()))
            } else {
                for _ in 0..count {
                    if check_complete(cursor)?.is_none() {
                        return Ok(None);
                    }
                }
                Ok(Some(cursor.position() as usize))
            }
        }
        byte => Err(MigrationError::Protocol(format!(
            "unexpected byte: 0x{:02x}",
            byte
        ))),
    }
}

/// Parse a RESP value from the cursor (assumes complete data).
fn parse_value(cursor: &mut Cursor<&[u8]>) -> Result<Value> {
    match get_byte(cursor)? {
        b'+' => Ok(Value::Status(utf8_line(cursor)?)),
        b'-' => Ok(Value::Error(utf8_line(cursor)?)),
        b':' => Ok(Value::Integer(complete_decimal(cursor)?)),
        b'$' => {
            let len = complete_decimal(cursor)?;
            if len == -1 {
                Ok(Value::Nil)
            } else {
                let data = read_bytes(cursor, len as usize)?;
                let val = Bytes::copy_from_slice(data);
                skip_crlf(cursor)?;
                Ok(Value::Bulk(val))
            }
        }
        b'*' => {
            let count = complete_decimal(cursor)?;
            if count == -1 {
                Ok(Value::Nil)
            } else {
                let count = count as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(parse_value(cursor)?);
                }
                Ok(Value::Array(values))
            }
        }
        byte => Err(MigrationError::Protocol(format!(
            "unexpected byte: 0x{:02x}",
            byte
        ))),
    }
}

// ── Low-level cursor helpers ────────────────────────────────────────────────

fn truncated() -> MigrationError {
    MigrationError::Protocol("truncated frame".into())
}

fn peek_byte(cursor: &Cursor<&[u8]>) -> Option<u8> {
    cursor.get_ref().get(cursor.position() as usize).copied()
}

fn get_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let byte = peek_byte(cursor).ok_or_else(truncated)?;
    cursor.advance(1);
    Ok(byte)
}

fn find_line(cursor: &mut Cursor<&[u8]>) -> Option<()> {
    read_line(cursor).map(|_| ())
}

fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Option<&'a [u8]> {
    let start = cursor.position() as usize;
    let buf: &'a [u8] = *cursor.get_ref();
    for i in start..buf.len().saturating_sub(1) {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return Some(&buf[start..i]);
        }
    }
    None
}

fn utf8_line(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let line = read_line(cursor).ok_or_else(truncated)?;
    String::from_utf8(line.to_vec())
        .map_err(|e| MigrationError::Protocol(format!("invalid UTF-8: {}", e)))
}

fn read_decimal(cursor: &mut Cursor<&[u8]>) -> Result<Option<i64>> {
    let Some(line) = read_line(cursor) else {
        return Ok(None);
    };
    let s = std::str::from_utf8(line)
        .map_err(|_| MigrationError::Protocol("invalid UTF-8 in integer".into()))?;
    s.parse::<i64>()
        .map(Some)
        .map_err(|_| MigrationError::Protocol(format!("invalid integer: {}", s)))
}

fn complete_decimal(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    read_decimal(cursor)?.ok_or_else(truncated)
}

fn read_bytes<'a>(cursor: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8]> {
    let start = cursor.position() as usize;
    let buf: &'a [u8] = *cursor.get_ref();
    if start + n > buf.len() {
        return Err(truncated());
    }
    cursor.set_position((start + n) as u64);
    Ok(&buf[start..start + n])
}

fn skip_crlf(cursor: &mut Cursor<&[u8]>) -> Result<()> {
    let pos = cursor.position() as usize;
    let buf = cursor.get_ref();
    if pos + 2 > buf.len() {
        return Err(truncated());
    }
    if buf[pos] != b'\r' || buf[pos + 1] != b'\n' {
        return Err(MigrationError::Protocol("expected CRLF".into()));
    }
    cursor.advance(2);
    Ok(())
}

/// Encode a reply. Used by the in-memory store's wire tests and by
/// anything that needs to fake a server.
pub fn encode_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Status(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s.as_bytes());
            buf.put_slice(b"\r\n");
        }
        Value::Error(s) => {
            buf.put_u8(b'-');
            buf.put_slice(s.as_bytes());
            buf.put_slice(b"\r\n");
        }
        Value::Integer(n) => {
            buf.put_u8(b':');
            buf.put_slice(n.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        Value::Bulk(data) => {
            buf.put_u8(b'$');
            buf.put_slice(data.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(data);
            buf.put_slice(b"\r\n");
        }
        Value::Nil => buf.put_slice(b"$-1\r\n"),
        Value::Array(items) => {
            buf.put_u8(b'*');
            buf.put_slice(items.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            for item in items {
                encode_value(item, buf);
            }
        }
    }
}
