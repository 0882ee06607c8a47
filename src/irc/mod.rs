pub mod codec;
pub mod control;
pub mod dispatch;
pub mod engine;
pub mod limiter;
pub mod message;

pub use control::{ControlMessage, Internal, LogMessage};
pub use dispatch::{ChatMessage, Handler, Irc};
pub use engine::{ConnectionState, EngineHandle};
pub use message::{Line, ParseError};
