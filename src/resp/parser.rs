//! Streaming RESP2 reply decoder.
//!
//! [`Decoder::decode`] works on the connection's accumulating receive
//! buffer. Every complete element is split off the front of the buffer as
//! soon as it is recognised, so a reply that arrives in many reads is never
//! re-scanned from the start: the decoder keeps the partially built arrays
//! and the length of a pending bulk string between calls.
//!
//! Bulk strings are extracted with `split_to().freeze()`, sharing the
//! receive buffer's allocation instead of copying.

use bytes::{Buf, BytesMut};
use memchr::memchr;

use crate::error::{Result, RsedisError};
use crate::resp::types::Reply;

/// Largest bulk string Redis itself accepts (`proto-max-bulk-len`).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Upper bound on a declared array length.
pub const MAX_ARRAY_LEN: usize = i32::MAX as usize;

/// Cap on the up-front allocation for an array; larger arrays grow as
/// elements arrive.
const PREALLOC_LIMIT: usize = 1024;

/// An array whose header has been read but not all of its elements.
#[derive(Debug)]
struct Frame {
    expected: usize,
    items: Vec<Reply>,
}

/// What one step over the buffer produced.
enum Step {
    Value(Reply),
    ArrayStart(usize),
}

/// Resumable decoder for one connection's reply stream.
#[derive(Debug)]
pub struct Decoder {
    stack: Vec<Frame>,
    pending_bulk: Option<usize>,
    max_bulk_len: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_bulk_len(DEFAULT_MAX_BULK_LEN)
    }

    /// Decoder rejecting bulk strings longer than `max_bulk_len` bytes.
    pub fn with_max_bulk_len(max_bulk_len: usize) -> Self {
        Self {
            stack: Vec::new(),
            pending_bulk: None,
            max_bulk_len,
        }
    }

    /// True while a reply has been partially consumed from the buffer.
    pub fn in_progress(&self) -> bool {
        !self.stack.is_empty() || self.pending_bulk.is_some()
    }

    /// Declared length of the bulk string whose body is still arriving.
    pub fn pending_bulk_len(&self) -> Option<usize> {
        self.pending_bulk
    }

    /// Drop any partial state. Used after the stream is torn down.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.pending_bulk = None;
    }

    /// Decode one complete reply from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; whatever was already
    /// recognised has been consumed and is kept until the next call.
    /// A `Protocol` error leaves the decoder in an unusable state: the
    /// stream cannot be resynchronised and must be discarded.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Reply>> {
        loop {
            let step = match self.step(buf)? {
                Some(step) => step,
                None => return Ok(None),
            };
            let value = match step {
                Step::Value(v) => v,
                Step::ArrayStart(0) => Reply::Array(Some(Vec::new())),
                Step::ArrayStart(n) => {
                    self.stack.push(Frame {
                        expected: n,
                        items: Vec::with_capacity(n.min(PREALLOC_LIMIT)),
                    });
                    continue;
                }
            };
            if let Some(done) = self.complete(value) {
                return Ok(Some(done));
            }
        }
    }

    /// Attach a finished value to the innermost open array, closing every
    /// array that becomes full. Returns the top-level reply once there is one.
    fn complete(&mut self, mut value: Reply) -> Option<Reply> {
        while let Some(frame) = self.stack.last_mut() {
            frame.items.push(value);
            if frame.items.len() < frame.expected {
                return None;
            }
            let items = std::mem::take(&mut frame.items);
            self.stack.pop();
            value = Reply::Array(Some(items));
        }
        Some(value)
    }

    fn step(&mut self, buf: &mut BytesMut) -> Result<Option<Step>> {
        if let Some(len) = self.pending_bulk {
            return self.bulk_body(buf, len);
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let cr = match find_crlf(buf, 1)? {
            Some(cr) => cr,
            None => return Ok(None),
        };
        let kind = buf[0];
        let step = {
            let line = &buf[1..cr];
            match kind {
                b'+' => Some(Step::Value(Reply::Status(line_to_string(line, "status")?))),
                b'-' => Some(Step::Value(Reply::Error(line_to_string(line, "error")?))),
                b':' => Some(Step::Value(Reply::Integer(parse_int_from_bytes(line)?))),
                b'$' => match parse_int_from_bytes(line)? {
                    -1 => Some(Step::Value(Reply::BulkString(None))),
                    len if len < 0 => {
                        return Err(RsedisError::Protocol(format!(
                            "invalid bulk string length: {len}"
                        )))
                    }
                    len => {
                        let len = len as usize;
                        if len > self.max_bulk_len {
                            return Err(RsedisError::Protocol(format!(
                                "bulk string of {len} bytes exceeds limit of {}",
                                self.max_bulk_len
                            )));
                        }
                        self.pending_bulk = Some(len);
                        None
                    }
                },
                b'*' => match parse_int_from_bytes(line)? {
                    -1 => Some(Step::Value(Reply::Array(None))),
                    n if n < 0 => {
                        return Err(RsedisError::Protocol(format!(
                            "invalid array length: {n}"
                        )))
                    }
                    n if n as u64 > MAX_ARRAY_LEN as u64 => {
                        return Err(RsedisError::Protocol(format!(
                            "array of {n} elements exceeds limit"
                        )))
                    }
                    n => Some(Step::ArrayStart(n as usize)),
                },
                other => {
                    return Err(RsedisError::Protocol(format!(
                        "unknown RESP type byte: 0x{other:02x}"
                    )))
                }
            }
        };
        buf.advance(cr + 2);
        match (step, self.pending_bulk) {
            (Some(step), _) => Ok(Some(step)),
            (None, Some(len)) => self.bulk_body(buf, len),
            (None, None) => Ok(None),
        }
    }

    /// `<len bytes>\r\n` after a bulk string header.
    fn bulk_body(&mut self, buf: &mut BytesMut, len: usize) -> Result<Option<Step>> {
        if buf.len() < len + 2 {
            return Ok(None);
        }
        if buf[len] != b'\r' || buf[len + 1] != b'\n' {
            return Err(RsedisError::Protocol(
                "bulk string not terminated by \\r\\n".into(),
            ));
        }
        let data = buf.split_to(len).freeze();
        buf.advance(2);
        self.pending_bulk = None;
        Ok(Some(Step::Value(Reply::BulkString(Some(data)))))
    }
}

/// Decode one reply from a byte slice.
///
/// Returns the reply and the number of bytes it occupied, or `None` if the
/// slice holds only part of a reply.
pub fn decode_slice(input: &[u8]) -> Result<Option<(Reply, usize)>> {
    let mut buf = BytesMut::from(input);
    let mut decoder = Decoder::new();
    Ok(decoder
        .decode(&mut buf)?
        .map(|reply| (reply, input.len() - buf.len())))
}

// ── Helpers ────────────────────────────────────────────────────────

/// Find the next `\r\n` in `buf` starting at `offset`.
/// Returns the index of `\r`, or `None` if the line is not complete yet.
#[inline]
fn find_crlf(buf: &[u8], offset: usize) -> Result<Option<usize>> {
    let search = match buf.get(offset..) {
        Some(s) => s,
        None => return Ok(None),
    };
    match memchr(b'\r', search) {
        Some(pos) => {
            let abs = offset + pos;
            match buf.get(abs + 1) {
                Some(b'\n') => Ok(Some(abs)),
                Some(_) => Err(RsedisError::Protocol("expected \\n after \\r".into())),
                None => Ok(None),
            }
        }
        None => Ok(None),
    }
}

fn line_to_string(line: &[u8], what: &str) -> Result<String> {
    match line {
        b"OK" => Ok("OK".to_string()),
        b"PONG" => Ok("PONG".to_string()),
        _ => std::str::from_utf8(line)
            .map(str::to_string)
            .map_err(|e| RsedisError::Protocol(format!("invalid UTF-8 in {what}: {e}"))),
    }
}

/// Parse an integer from a byte slice (no allocations).
fn parse_int_from_bytes(bytes: &[u8]) -> Result<i64> {
    let (negative, digits) = match bytes.first() {
        None => return Err(RsedisError::Protocol("empty integer".into())),
        Some(b'-') => (true, &bytes[1..]),
        Some(b'+') => (false, &bytes[1..]),
        Some(_) => (false, bytes),
    };

    if digits.is_empty() {
        return Err(RsedisError::Protocol("integer has no digits".into()));
    }

    // Accumulate as negative so i64::MIN parses without overflow.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RsedisError::Protocol(format!(
                "invalid byte in integer: 0x{b:02x}"
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| RsedisError::Protocol("integer overflow".into()))?;
    }

    if negative {
        Ok(n)
    } else {
        n.checked_neg()
            .ok_or_else(|| RsedisError::Protocol("integer overflow".into()))
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn one(input: &[u8]) -> Reply {
        let (val, len) = decode_slice(input).unwrap().expect("complete reply");
        assert_eq!(len, input.len());
        val
    }

    fn is_protocol(input: &[u8]) -> bool {
        matches!(decode_slice(input), Err(RsedisError::Protocol(_)))
    }

    /// Feed `input` one byte at a time and return the first reply.
    fn trickle(input: &[u8]) -> Reply {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::new();
        for (i, b) in input.iter().enumerate() {
            buf.extend_from_slice(&[*b]);
            if let Some(reply) = decoder.decode(&mut buf).unwrap() {
                assert_eq!(i, input.len() - 1, "reply completed early");
                assert!(buf.is_empty());
                assert!(!decoder.in_progress());
                return reply;
            }
        }
        panic!("no reply after {} bytes", input.len());
    }

    // ── Status / Error ──

    #[test]
    fn status() {
        assert_eq!(one(b"+OK\r\n"), Reply::Status("OK".into()));
        assert_eq!(one(b"+\r\n"), Reply::Status("".into()));
        assert_eq!(one(b"+hello world\r\n"), Reply::Status("hello world".into()));
    }

    #[test]
    fn error_reply_is_data() {
        assert_eq!(
            one(b"-WRONGTYPE Operation against wrong type\r\n"),
            Reply::Error("WRONGTYPE Operation against wrong type".into())
        );
        assert_eq!(
            one(b"-MOVED 5000 127.0.0.1:7001\r\n"),
            Reply::Error("MOVED 5000 127.0.0.1:7001".into())
        );
    }

    // ── Integer ──

    #[test]
    fn integers() {
        assert_eq!(one(b":1000\r\n"), Reply::Integer(1000));
        assert_eq!(one(b":-42\r\n"), Reply::Integer(-42));
        assert_eq!(one(b":0\r\n"), Reply::Integer(0));
        assert_eq!(one(b":+99\r\n"), Reply::Integer(99));
        assert_eq!(
            one(b":-9223372036854775808\r\n"),
            Reply::Integer(i64::MIN)
        );
        assert_eq!(one(b":9223372036854775807\r\n"), Reply::Integer(i64::MAX));
    }

    #[test]
    fn integer_malformed() {
        assert!(is_protocol(b":9223372036854775808\r\n"));
        assert!(is_protocol(b":\r\n"));
        assert!(is_protocol(b":-\r\n"));
        assert!(is_protocol(b":12a3\r\n"));
    }

    // ── Bulk String ──

    #[test]
    fn bulk_string() {
        assert_eq!(one(b"$5\r\nhello\r\n"), Reply::bulk("hello"));
        assert_eq!(one(b"$0\r\n\r\n"), Reply::bulk(Bytes::new()));
        assert_eq!(one(b"$-1\r\n"), Reply::BulkString(None));
    }

    #[test]
    fn bulk_string_binary_with_crlf_inside() {
        assert_eq!(
            one(b"$8\r\n\x00\xffhe\r\nlo\r\n"),
            Reply::bulk(Bytes::from_static(b"\x00\xffhe\r\nlo"))
        );
    }

    #[test]
    fn bulk_string_malformed() {
        assert!(is_protocol(b"$5\r\nhelloXX"));
        assert!(is_protocol(b"$-2\r\n"));
        assert!(is_protocol(b"$abc\r\n"));
    }

    #[test]
    fn bulk_string_over_limit() {
        let mut decoder = Decoder::with_max_bulk_len(4);
        let mut buf = BytesMut::from(&b"$5\r\nhello\r\n"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(RsedisError::Protocol(_))
        ));
        let mut buf = BytesMut::from(&b"$4\r\nhell\r\n"[..]);
        let mut decoder = Decoder::with_max_bulk_len(4);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Reply::bulk("hell")));
    }

    // ── Array ──

    #[test]
    fn arrays() {
        assert_eq!(
            one(b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n"),
            Reply::array(vec![Reply::bulk("foo"), Reply::bulk("bar")])
        );
        assert_eq!(one(b"*0\r\n"), Reply::array(vec![]));
        assert_eq!(one(b"*-1\r\n"), Reply::Array(None));
    }

    #[test]
    fn array_mixed_and_nulls() {
        assert_eq!(
            one(b"*5\r\n:1\r\n$5\r\nhello\r\n+OK\r\n$-1\r\n-ERR no\r\n"),
            Reply::array(vec![
                Reply::Integer(1),
                Reply::bulk("hello"),
                Reply::Status("OK".into()),
                Reply::BulkString(None),
                Reply::Error("ERR no".into()),
            ])
        );
    }

    #[test]
    fn array_nested() {
        assert_eq!(
            one(b"*3\r\n*2\r\n:1\r\n:2\r\n*-1\r\n*1\r\n*0\r\n"),
            Reply::array(vec![
                Reply::array(vec![Reply::Integer(1), Reply::Integer(2)]),
                Reply::Array(None),
                Reply::array(vec![Reply::array(vec![])]),
            ])
        );
    }

    #[test]
    fn array_malformed() {
        assert!(is_protocol(b"*bogus\r\n"));
        assert!(is_protocol(b"*-5\r\n"));
        assert!(is_protocol(b"*99999999999\r\n"));
        assert!(is_protocol(b"*1\r\n?\r\n"));
    }

    // ── Framing ──

    #[test]
    fn unknown_type_byte() {
        assert!(is_protocol(b"X123\r\n"));
    }

    #[test]
    fn cr_without_lf() {
        assert!(is_protocol(b"+OK\rX"));
    }

    #[test]
    fn incomplete_input() {
        assert_eq!(decode_slice(b"").unwrap(), None);
        assert_eq!(decode_slice(b"+OK").unwrap(), None);
        assert_eq!(decode_slice(b"+OK\r").unwrap(), None);
        assert_eq!(decode_slice(b"$5\r").unwrap(), None);
        assert_eq!(decode_slice(b"$5\r\nhel").unwrap(), None);
        assert_eq!(decode_slice(b"*2\r\n:1\r\n").unwrap(), None);
    }

    #[test]
    fn multiple_replies_in_buffer() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"+OK\r\n:42\r\n$-1\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Reply::Status("OK".into()))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Reply::Integer(42)));
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Reply::BulkString(None))
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_array_consumes_finished_elements() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"*3\r\n:1\r\n$3\r\nab"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(decoder.in_progress());
        // header, first element and the bulk header are gone
        assert_eq!(&buf[..], b"ab");
        assert_eq!(decoder.pending_bulk_len(), Some(3));

        buf.extend_from_slice(b"c\r\n:3\r\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Reply::array(vec![
                Reply::Integer(1),
                Reply::bulk("abc"),
                Reply::Integer(3)
            ]))
        );
        assert!(buf.is_empty());
        assert_eq!(decoder.pending_bulk_len(), None);
    }

    #[test]
    fn byte_at_a_time_matches_whole() {
        let fixtures: &[&[u8]] = &[
            b"+OK\r\n",
            b"-ERR unknown command\r\n",
            b":-12345\r\n",
            b"$6\r\nfoo\r\nx\r\n",
            b"$-1\r\n",
            b"*-1\r\n",
            b"*0\r\n",
            b"*3\r\n$3\r\nfoo\r\n*2\r\n:1\r\n$-1\r\n+PONG\r\n",
        ];
        for input in fixtures {
            assert_eq!(trickle(input), one(input), "input {input:?}");
        }
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::from(&b"*2\r\n:1\r\n"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        decoder.reset();
        assert!(!decoder.in_progress());
        let mut buf = BytesMut::from(&b":7\r\n"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Reply::Integer(7)));
    }
}
