//! Messages exchanged with a running connection engine.
//!
//! [`ControlMessage`] is everything the engine accepts on its control
//! mailbox; [`LogMessage`] is everything it reports on its log mailbox.
//! There is no other way in or out.
use std::fmt;

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Say goodbye and close the connection.
    Quit,
    /// Send one raw line (rate limited, sanitized on the way out).
    SendLine(Bytes),
    /// Idle interval elapsed: probe the server.
    PingProbe,
    /// The server never answered the probe.
    PingTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    Sent(Bytes),
    Received(Bytes),
    Internal(Internal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Internal {
    /// The connection is closed.
    Quit,
    Error(String),
}

impl LogMessage {
    pub fn error(detail: impl Into<String>) -> Self {
        LogMessage::Internal(Internal::Error(detail.into()))
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogMessage::Sent(line) => write!(f, "> {}", String::from_utf8_lossy(line)),
            LogMessage::Received(line) => write!(f, "< {}", String::from_utf8_lossy(line)),
            LogMessage::Internal(Internal::Quit) => f.write_str("-- connection closed"),
            LogMessage::Internal(Internal::Error(detail)) => write!(f, "!! {detail}"),
        }
    }
}
