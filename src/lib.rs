//! relaybot: the concurrent core of a long-lived IRC client.
//!
//! [`mailbox`] carries every message between tasks, [`timer`] schedules
//! deferred deliveries into mailboxes, and [`irc`] holds the wire format
//! and the per-connection engine built on both.
pub mod config;
pub mod irc;
pub mod mailbox;
pub mod timer;
