//! IRC line grammar.
//!
//!   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
//!
//! Lines are byte strings: servers relay whatever their clients send, and
//! plenty of that is not UTF-8. Parsing operates on a single frame with
//! the CR-LF terminator already removed by the framing layer.
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// A decoded IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Origin (`server.name` or `nick!user@host`), without the leading `:`.
    pub prefix: Option<Bytes>,
    /// Command word or three-digit numeric.
    pub command: Bytes,
    /// Arguments in order. A `:`-trailing argument is always last.
    pub args: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("prefix sigil with no prefix")]
    EmptyPrefix,
    #[error("trailing argument sigil with no content")]
    EmptyTrailing,
    #[error("missing command")]
    MissingCommand,
}

/// Cursor over one line.
struct Reader<'a> {
    line: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn eol(&self) -> bool {
        self.pos >= self.line.len()
    }

    fn peek(&self) -> Option<u8> {
        self.line.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn until_space(&mut self) -> &'a [u8] {
        let line = self.line;
        let rest = &line[self.pos..];
        let len = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn rest(&mut self) -> &'a [u8] {
        let line = self.line;
        let rest = &line[self.pos..];
        self.pos = self.line.len();
        rest
    }
}

impl Line {
    pub fn new<C, A>(command: C, args: impl IntoIterator<Item = A>) -> Self
    where
        C: Into<Bytes>,
        A: Into<Bytes>,
    {
        Self {
            prefix: None,
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Parse one line (without `\r\n`).
    pub fn parse(input: &[u8]) -> Result<Self, ParseError> {
        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut r = Reader { line: input, pos: 0 };

        let prefix = if r.peek() == Some(b':') {
            r.pos += 1;
            if r.eol() {
                return Err(ParseError::EmptyPrefix);
            }
            Some(Bytes::copy_from_slice(r.until_space()))
        } else {
            None
        };

        r.skip_spaces();
        if r.eol() {
            return Err(ParseError::MissingCommand);
        }
        let command = Bytes::copy_from_slice(r.until_space());
        r.skip_spaces();

        let mut args = Vec::new();
        while !r.eol() {
            if r.peek() == Some(b':') {
                r.pos += 1;
                if r.eol() {
                    return Err(ParseError::EmptyTrailing);
                }
                args.push(Bytes::copy_from_slice(r.rest()));
            } else {
                args.push(Bytes::copy_from_slice(r.until_space()));
            }
            r.skip_spaces();
        }

        Ok(Line {
            prefix,
            command,
            args,
        })
    }

    /// ASCII case-insensitive command comparison.
    pub fn is_command(&self, command: &str) -> bool {
        self.command.eq_ignore_ascii_case(command.as_bytes())
    }

    /// Serialize to wire form (no terminator, no length limit applied).
    ///
    /// The last argument is always sent as a `:`-trailing argument.
    pub fn to_wire(&self) -> Bytes {
        let mut out = BytesMut::new();

        if let Some(prefix) = &self.prefix {
            out.put_u8(b':');
            out.put_slice(prefix);
            out.put_u8(b' ');
        }

        out.put_slice(&self.command);

        if let Some((last, middle)) = self.args.split_last() {
            for arg in middle {
                out.put_u8(b' ');
                out.put_slice(arg);
            }
            out.put_slice(b" :");
            out.put_slice(last);
        }

        out.freeze()
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_wire()))
    }
}
