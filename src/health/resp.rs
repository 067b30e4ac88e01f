/// RESP2 codec used by the instance probe

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

/// Largest bulk string accepted, same as Redis' proto-max-bulk-len
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Largest array accepted in a reply
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n), None is the null bulk string
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...), None is the null array
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Text content of string-like replies
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => Some(s.clone()),
            RespValue::BulkString(Some(data)) => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s == "OK")
    }
}

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(#[from] std::num::ParseIntError),
}

/// Decode one value from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when the frame is not
/// complete yet.
pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
    match parse_at(&buf[..], 0)? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_at(data: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespParseError> {
    let Some((line, next)) = read_line(data, pos) else {
        return Ok(None);
    };
    if line.is_empty() {
        return Err(RespParseError::InvalidFormat("empty line".to_string()));
    }

    let body = &line[1..];
    match line[0] {
        b'+' => Ok(Some((
            RespValue::SimpleString(str::from_utf8(body)?.to_string()),
            next,
        ))),
        b'-' => Ok(Some((RespValue::Error(str::from_utf8(body)?.to_string()), next))),
        b':' => Ok(Some((RespValue::Integer(str::from_utf8(body)?.parse()?), next))),
        b'$' => {
            let size: i64 = str::from_utf8(body)?.parse()?;
            if size == -1 {
                return Ok(Some((RespValue::BulkString(None), next)));
            }
            if !(0..=MAX_BULK_LEN).contains(&size) {
                return Err(RespParseError::InvalidFormat(format!(
                    "Invalid bulk string size {}",
                    size
                )));
            }

            let end = next
                .checked_add(size as usize)
                .filter(|end| end.checked_add(2).is_some())
                .ok_or_else(|| RespParseError::InvalidFormat("bulk string overflows".to_string()))?;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(RespParseError::InvalidFormat(
                    "Missing \\r\\n after bulk string".to_string(),
                ));
            }
            let content = Bytes::copy_from_slice(&data[next..end]);
            Ok(Some((RespValue::BulkString(Some(content)), end + 2)))
        }
        b'*' => {
            let size: i64 = str::from_utf8(body)?.parse()?;
            if size == -1 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            if !(0..=MAX_ARRAY_LEN).contains(&size) {
                return Err(RespParseError::InvalidFormat(format!(
                    "Invalid array size {}",
                    size
                )));
            }

            // Elements may still be in flight, grow as they arrive
            let mut elements = Vec::with_capacity(size.min(1024) as usize);
            let mut cursor = next;
            for _ in 0..size {
                match parse_at(data, cursor)? {
                    Some((element, after)) => {
                        elements.push(element);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(elements)), cursor)))
        }
        other => Err(RespParseError::InvalidFormat(format!(
            "Unknown RESP type: {}",
            other as char
        ))),
    }
}

/// Find the line starting at `pos`, returning it without \r\n and the offset after it
fn read_line(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = data.get(pos..)?;
    rest.windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| (&rest[..i], pos + i + 2))
}

/// Encode a command as an array of bulk strings
pub fn encode_command(args: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'*');
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        buf.put_u8(b'$');
        buf.extend_from_slice(arg.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.extend_from_slice(arg.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_values() {
        let mut buf = BytesMut::from("+PONG\r\n:42\r\n-ERR unknown command\r\n");
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(RespValue::SimpleString("PONG".to_string()))
        );
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::Integer(42)));
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(RespValue::Error("ERR unknown command".to_string()))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_bulk_string() {
        let mut buf = BytesMut::from("$11\r\nrole:master\r\n");
        let value = decode(&mut buf).unwrap().unwrap();
        assert_eq!(value.as_text().as_deref(), Some("role:master"));
    }

    #[test]
    fn test_incomplete_frames_are_not_consumed() {
        let mut buf = BytesMut::from("$11\r\nrole:mas");
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 13);

        buf.extend_from_slice(b"ter\r\n");
        assert!(decode(&mut buf).unwrap().is_some());

        let mut partial_array = BytesMut::from("*2\r\n$3\r\nfoo\r\n");
        assert!(decode(&mut partial_array).unwrap().is_none());
        assert_eq!(&partial_array[..], b"*2\r\n$3\r\nfoo\r\n");
    }

    #[test]
    fn test_decode_nested_array() {
        let mut buf = BytesMut::from("*2\r\n$9\r\n127.0.0.1\r\n$5\r\n63001\r\n");
        let value = decode(&mut buf).unwrap().unwrap();
        match value {
            RespValue::Array(Some(items)) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].as_text().as_deref(), Some("63001"));
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&["REPLICAOF", "NO", "ONE"]);
        assert_eq!(
            encoded,
            Bytes::from("*3\r\n$9\r\nREPLICAOF\r\n$2\r\nNO\r\n$3\r\nONE\r\n")
        );
    }

    #[test]
    fn test_oversized_headers_are_rejected() {
        let mut huge_array = BytesMut::from(&b"*99999999999999999\r\n"[..]);
        assert!(matches!(
            decode(&mut huge_array),
            Err(RespParseError::InvalidFormat(_))
        ));

        let mut huge_bulk = BytesMut::from(&b"$9223372036854775807\r\n"[..]);
        assert!(matches!(
            decode(&mut huge_bulk),
            Err(RespParseError::InvalidFormat(_))
        ));

        let mut over_limit = BytesMut::from(&b"$536870913\r\n"[..]);
        assert!(decode(&mut over_limit).is_err());

        // A large but legal array header just waits for more data
        let mut pending = BytesMut::from(&b"*1000000\r\n"[..]);
        assert!(decode(&mut pending).unwrap().is_none());
    }

    #[test]
    fn test_invalid_type_byte() {
        let mut buf = BytesMut::from("?what\r\n");
        assert!(decode(&mut buf).is_err());
    }
}
