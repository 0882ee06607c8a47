//! Runtime configuration, read from `RELAYBOT_*` environment variables.
use std::str::FromStr;
use std::time::Duration;

use crate::irc::limiter::DEFAULT_SEND_INTERVAL;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Keepalive and flood-control intervals for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Quiet time before probing the server.
    pub idle: Duration,
    /// How long a probe may go unanswered.
    pub timeout: Duration,
    /// Minimum spacing between outbound lines.
    pub send_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(3 * 60),
            send_interval: DEFAULT_SEND_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub nick: String,
    pub realname: String,
    /// Rooms joined right after registration.
    pub rooms: Vec<String>,
    pub quit_message: String,
    pub timing: Timing,
    /// Cap on concurrently running handler invocations.
    pub max_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "irc.libera.chat".into(),
            port: 6667,
            nick: "relaybot".into(),
            realname: "relaybot IRC client".into(),
            rooms: Vec::new(),
            quit_message: "relaybot exiting normally".into(),
            timing: Timing::default(),
            max_workers: 8,
        }
    }
}

impl Config {
    /// `host:port` for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build from the process environment; unset variables keep defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(host) = get("RELAYBOT_SERVER") {
            config.host = host;
        }
        if let Some(port) = get("RELAYBOT_PORT") {
            config.port = parse("RELAYBOT_PORT", port)?;
        }
        if let Some(nick) = get("RELAYBOT_NICK") {
            config.nick = nick;
        }
        if let Some(realname) = get("RELAYBOT_REALNAME") {
            config.realname = realname;
        }
        if let Some(rooms) = get("RELAYBOT_ROOMS") {
            config.rooms = rooms
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(msg) = get("RELAYBOT_QUIT_MESSAGE") {
            config.quit_message = msg;
        }
        if let Some(secs) = get("RELAYBOT_IDLE_SECS") {
            config.timing.idle = Duration::from_secs(parse("RELAYBOT_IDLE_SECS", secs)?);
        }
        if let Some(secs) = get("RELAYBOT_TIMEOUT_SECS") {
            config.timing.timeout = Duration::from_secs(parse("RELAYBOT_TIMEOUT_SECS", secs)?);
        }
        if let Some(ms) = get("RELAYBOT_SEND_INTERVAL_MS") {
            config.timing.send_interval =
                Duration::from_millis(parse("RELAYBOT_SEND_INTERVAL_MS", ms)?);
        }
        if let Some(n) = get("RELAYBOT_WORKERS") {
            config.max_workers = parse("RELAYBOT_WORKERS", n)?;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}
