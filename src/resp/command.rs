//! Request values.
//!
//! A [`Command`] is an ordered list of binary-safe arguments, name first.
//! It is built once and never mutated after it is handed to a connection.

use bytes::Bytes;
use itoa::Buffer;

/// A Redis command: name followed by its arguments, all binary-safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Start a command with its name.
    pub fn new(name: impl IntoArg) -> Self {
        Self {
            args: vec![name.into_arg()],
        }
    }

    /// Build a command from an already collected argument list.
    ///
    /// Returns `None` for an empty list: a command always has a name.
    pub fn from_args<I, A>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        let args: Vec<Bytes> = args.into_iter().map(IntoArg::into_arg).collect();
        if args.is_empty() {
            None
        } else {
            Some(Self { args })
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }

    /// Append several arguments.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// The command name as sent (first element).
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    /// All elements, name included.
    pub fn parts(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of elements, name included.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Never true for a constructed command.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Case-insensitive comparison of the command name.
    pub fn is(&self, name: &str) -> bool {
        self.name().eq_ignore_ascii_case(name.as_bytes())
    }

    /// The key used to pick a cluster slot, if the command has one.
    ///
    /// Most commands carry their key at position 1. Commands with special
    /// key positions are handled here.
    pub fn routing_key(&self) -> Option<&[u8]> {
        let args = &self.args;
        let name = args[0].to_ascii_uppercase();
        match name.as_slice() {
            // Key-less commands
            b"PING" | b"ECHO" | b"INFO" | b"DBSIZE" | b"CLUSTER" | b"CONFIG" | b"CLIENT"
            | b"COMMAND" | b"TIME" | b"RANDOMKEY" | b"WAIT" | b"SAVE" | b"BGSAVE"
            | b"BGREWRITEAOF" | b"FLUSHALL" | b"FLUSHDB" | b"LASTSAVE" | b"SLOWLOG"
            | b"DEBUG" | b"MULTI" | b"EXEC" | b"DISCARD" | b"SCRIPT" | b"SUBSCRIBE"
            | b"UNSUBSCRIBE" | b"PSUBSCRIBE" | b"PUNSUBSCRIBE" | b"PUBLISH" | b"QUIT"
            | b"AUTH" | b"SELECT" | b"HELLO" | b"ASKING" | b"READONLY" | b"READWRITE" => None,
            // EVAL/EVALSHA: first key follows numkeys
            b"EVAL" | b"EVALSHA" | b"EVAL_RO" | b"EVALSHA_RO" | b"FCALL" | b"FCALL_RO" => {
                let numkeys = std::str::from_utf8(args.get(2)?).ok()?.parse::<usize>().ok()?;
                if numkeys > 0 {
                    args.get(3).map(|k| &k[..])
                } else {
                    None
                }
            }
            // XREAD/XREADGROUP: key follows the STREAMS keyword
            b"XREAD" | b"XREADGROUP" => args
                .iter()
                .position(|a| a.eq_ignore_ascii_case(b"STREAMS"))
                .and_then(|i| args.get(i + 1))
                .map(|k| &k[..]),
            // Subcommand first, key second
            b"OBJECT" | b"MEMORY" | b"XINFO" => args.get(2).map(|k| &k[..]),
            _ => args.get(1).map(|k| &k[..]),
        }
    }
}

/// Conversion of a value into one binary-safe command argument.
pub trait IntoArg {
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for &Bytes {
    fn into_arg(self) -> Bytes {
        self.clone()
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> IntoArg for &[u8; N] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

macro_rules! int_into_arg {
    ($($t:ty),*) => {
        $(
            impl IntoArg for $t {
                fn into_arg(self) -> Bytes {
                    Bytes::copy_from_slice(Buffer::new().format(self).as_bytes())
                }
            }
        )*
    };
}

int_into_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl IntoArg for f64 {
    fn into_arg(self) -> Bytes {
        if self.is_infinite() {
            Bytes::from_static(if self > 0.0 { b"+inf" } else { b"-inf" })
        } else {
            Bytes::from(self.to_string())
        }
    }
}

/// Helper macro for building commands ergonomically.
///
/// Usage:
/// ```ignore
/// let c = cmd!("SET", "mykey", "myvalue");
/// let c = cmd!("EXPIRE", key_var, 60);
/// ```
#[macro_export]
macro_rules! cmd {
    ($name:expr $(, $arg:expr)* $(,)?) => {{
        $crate::resp::command::Command::new($name)$(.arg($arg))*
    }};
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: &Command) -> Option<&str> {
        c.routing_key().map(|k| std::str::from_utf8(k).unwrap())
    }

    #[test]
    fn builder() {
        let c = Command::new("SET").arg("k").arg(42).arg(&b"v\r\n"[..]);
        assert_eq!(c.len(), 4);
        assert_eq!(c.name(), b"SET");
        assert_eq!(c.parts()[2].as_ref(), b"42");
        assert_eq!(c.parts()[3].as_ref(), b"v\r\n");
    }

    #[test]
    fn from_args_rejects_empty() {
        assert!(Command::from_args(Vec::<String>::new()).is_none());
        let c = Command::from_args(["GET", "k"]).unwrap();
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn integer_and_float_args() {
        let c = Command::new("X").arg(-7i64).arg(0u16).arg(1.5f64).arg(f64::NEG_INFINITY);
        assert_eq!(c.parts()[1].as_ref(), b"-7");
        assert_eq!(c.parts()[2].as_ref(), b"0");
        assert_eq!(c.parts()[3].as_ref(), b"1.5");
        assert_eq!(c.parts()[4].as_ref(), b"-inf");
    }

    #[test]
    fn cmd_macro() {
        let c = cmd!("SET", "foo", "bar");
        assert_eq!(c, Command::new("SET").arg("foo").arg("bar"));
        let single = cmd!("PING");
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn is_case_insensitive() {
        assert!(cmd!("get", "k").is("GET"));
        assert!(!cmd!("GET", "k").is("SET"));
    }

    #[test]
    fn routing_key_default_position() {
        assert_eq!(key(&cmd!("GET", "mykey")), Some("mykey"));
        assert_eq!(key(&cmd!("set", "mykey", "v")), Some("mykey"));
    }

    #[test]
    fn routing_key_keyless() {
        assert_eq!(key(&cmd!("PING")), None);
        assert_eq!(key(&cmd!("INFO", "server")), None);
        assert_eq!(key(&cmd!("CLUSTER", "SLOTS")), None);
        assert_eq!(key(&cmd!("ASKING")), None);
    }

    #[test]
    fn routing_key_eval() {
        assert_eq!(key(&cmd!("EVAL", "return 1", "1", "k")), Some("k"));
        assert_eq!(key(&cmd!("EVAL", "return 1", "0")), None);
        assert_eq!(key(&cmd!("EVALSHA", "abc", "x")), None);
    }

    #[test]
    fn routing_key_xread() {
        assert_eq!(
            key(&cmd!("XREAD", "COUNT", "2", "streams", "s1", "0")),
            Some("s1")
        );
        assert_eq!(key(&cmd!("XREAD", "COUNT", "2")), None);
    }

    #[test]
    fn routing_key_subcommand_first() {
        assert_eq!(key(&cmd!("OBJECT", "ENCODING", "k")), Some("k"));
    }

    #[test]
    fn routing_key_missing() {
        assert_eq!(key(&cmd!("GET")), None);
    }
}
