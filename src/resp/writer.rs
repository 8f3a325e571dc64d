//! RESP serializer.
//!
//! Requests always go out as an array of bulk strings:
//! `*<N>\r\n$<len>\r\narg1\r\n$<len>\r\narg2\r\n…`
//!
//! [`encode_reply`] writes the reply grammar and exists for servers in
//! tests and tools that need to speak the other side of the protocol.

use itoa::Buffer;

use crate::resp::command::Command;
use crate::resp::types::Reply;

/// Upper bound on the bytes needed for one command.
fn command_capacity(cmd: &Command) -> usize {
    // '*' + max_digits(usize) + \r\n, then '$' + len + \r\n + data + \r\n per arg
    let mut cap = 1 + 20 + 2;
    for arg in cmd.parts() {
        cap += 1 + 20 + 2 + arg.len() + 2;
    }
    cap
}

fn write_command(buf: &mut Vec<u8>, itoa_buf: &mut Buffer, cmd: &Command) {
    // *<N>\r\n
    buf.push(b'*');
    buf.extend_from_slice(itoa_buf.format(cmd.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");

    for arg in cmd.parts() {
        // $<len>\r\n<data>\r\n
        buf.push(b'$');
        buf.extend_from_slice(itoa_buf.format(arg.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Encode one command into RESP wire format.
///
/// # Example
/// ```ignore
/// let bytes = encode_command(&cmd!("SET", "key", "value"));
/// // → *3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n
/// ```
pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut buf = Vec::with_capacity(command_capacity(cmd));
    write_command(&mut buf, &mut Buffer::new(), cmd);
    buf
}

/// Encode several commands into one contiguous buffer, in order, so a
/// pipelined batch goes out with a single `write_all`.
pub fn encode_batch<'a, I>(cmds: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Command>,
    I::IntoIter: Clone,
{
    let iter = cmds.into_iter();
    let cap = iter.clone().map(command_capacity).sum();
    let mut buf = Vec::with_capacity(cap);
    let mut itoa_buf = Buffer::new();
    for cmd in iter {
        write_command(&mut buf, &mut itoa_buf, cmd);
    }
    buf
}

/// Append the wire form of `reply` to `buf`.
pub fn encode_reply(reply: &Reply, buf: &mut Vec<u8>) {
    let mut itoa_buf = Buffer::new();
    write_reply(reply, buf, &mut itoa_buf);
}

fn write_reply(reply: &Reply, buf: &mut Vec<u8>, itoa_buf: &mut Buffer) {
    match reply {
        Reply::Status(s) => {
            buf.push(b'+');
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Reply::Error(s) => {
            buf.push(b'-');
            buf.extend_from_slice(s.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Reply::Integer(i) => {
            buf.push(b':');
            buf.extend_from_slice(itoa_buf.format(*i).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        Reply::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
        Reply::BulkString(Some(data)) => {
            buf.push(b'$');
            buf.extend_from_slice(itoa_buf.format(data.len()).as_bytes());
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }
        Reply::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
        Reply::Array(Some(items)) => {
            buf.push(b'*');
            buf.extend_from_slice(itoa_buf.format(items.len()).as_bytes());
            buf.extend_from_slice(b"\r\n");
            for item in items {
                write_reply(item, buf, itoa_buf);
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
