//! Hand-off from the connection engine to bot logic.
//!
//! Decoded lines go through a bounded queue to a dispatcher task, which
//! runs each one on a blocking worker under a concurrency cap. Handlers
//! talk back to the connection only through the [`Irc`] capability, which
//! turns every request into a control or log mailbox message.
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::control::{ControlMessage, LogMessage};
use super::message::Line;
use crate::mailbox::Sender;

/// Lines waiting for a worker before the engine is made to wait.
pub const DISPATCH_QUEUE: usize = 64;

/// Bot logic plugged into a connection. All hooks default to no-ops.
///
/// Hooks run on blocking worker threads, so they may block.
pub trait Handler: Send + Sync + 'static {
    /// Runs once after registration and the initial joins.
    fn on_connect(&self, _irc: &Irc) {}

    /// A PRIVMSG, once per recipient.
    fn handle_message(&self, _msg: &ChatMessage, _irc: &Irc) {}

    /// Every other line except server PINGs, which the engine answers itself.
    fn handle_other(&self, _line: &Line, _irc: &Irc) {}
}

/// One PRIVMSG as seen by a single recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Full origin, `nick!user@host`.
    pub prefix: Bytes,
    /// Nick part of the prefix.
    pub sender: Bytes,
    /// Where a reply should go: the room, or the sender for a query.
    pub reply_to: Bytes,
    pub text: Bytes,
}

impl ChatMessage {
    /// Split a PRIVMSG into one message per comma-separated recipient.
    pub fn from_privmsg(line: &Line) -> Result<Vec<ChatMessage>, String> {
        let prefix = line
            .prefix
            .clone()
            .ok_or_else(|| format!("PRIVMSG without origin: {line}"))?;
        let [recipients, text] = line.args.as_slice() else {
            return Err(format!("PRIVMSG with {} arguments: {line}", line.args.len()));
        };

        let nick_len = prefix.iter().position(|&b| b == b'!').unwrap_or(prefix.len());
        let sender = prefix.slice(..nick_len);

        Ok(recipients
            .split(|&b| b == b',')
            .filter(|r| !r.is_empty())
            .map(|recipient| {
                let reply_to = if recipient.starts_with(b"#") {
                    recipients.slice_ref(recipient)
                } else {
                    sender.clone()
                };
                ChatMessage {
                    prefix: prefix.clone(),
                    sender: sender.clone(),
                    reply_to,
                    text: text.clone(),
                }
            })
            .collect())
    }
}

/// What a handler may do to the connection.
#[derive(Debug, Clone)]
pub struct Irc {
    control: Sender<ControlMessage>,
    log: Sender<LogMessage>,
    nick: Arc<Mutex<String>>,
    rooms: Arc<Mutex<BTreeSet<String>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Irc {
    pub fn new(control: Sender<ControlMessage>, log: Sender<LogMessage>, nick: String) -> Self {
        Self {
            control,
            log,
            nick: Arc::new(Mutex::new(nick)),
            rooms: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Queue a raw line for sending.
    pub fn send_raw(&self, line: impl Into<Bytes>) {
        let _ = self.control.send(ControlMessage::SendLine(line.into()));
    }

    /// PRIVMSG a room or nick.
    pub fn message(&self, target: &[u8], text: &[u8]) {
        let line = Line::new(
            "PRIVMSG",
            [Bytes::copy_from_slice(target), Bytes::copy_from_slice(text)],
        );
        self.send_raw(line.to_wire());
    }

    /// Ask for a new nick and start tracking it.
    pub fn set_nick(&self, nick: &str) {
        let mut current = lock(&self.nick);
        self.send_raw(Line::new("NICK", [nick.to_owned()]).to_wire());
        *current = nick.to_owned();
    }

    pub fn nick(&self) -> String {
        lock(&self.nick).clone()
    }

    /// Join a room and record the membership.
    pub fn join(&self, room: &str) {
        let mut rooms = lock(&self.rooms);
        self.send_raw(Line::new("JOIN", [room.to_owned()]).to_wire());
        rooms.insert(room.to_owned());
    }

    /// Rooms joined so far.
    pub fn rooms(&self) -> BTreeSet<String> {
        lock(&self.rooms).clone()
    }

    /// Surface a problem on the log mailbox.
    pub fn report_error(&self, detail: impl Into<String>) {
        let _ = self.log.send(LogMessage::error(detail));
    }
}

/// Engine side of the dispatch queue.
#[derive(Debug)]
pub struct Dispatcher {
    queue: mpsc::Sender<Line>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn spawn(handler: Arc<dyn Handler>, irc: Irc, max_workers: usize) -> Self {
        let (queue, rx) = mpsc::channel(DISPATCH_QUEUE);
        let task = tokio::spawn(dispatch_loop(rx, handler, irc, max_workers.max(1)));
        Self { queue, task }
    }

    /// Hand a line to the workers, waiting while the queue is full.
    pub async fn dispatch(&self, line: Line) {
        if self.queue.send(line).await.is_err() {
            warn!("dispatch: worker loop is gone, dropping line");
        }
    }

    /// Stop accepting lines. Lines already queued still run.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.queue);
        self.task
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<Line>,
    handler: Arc<dyn Handler>,
    irc: Irc,
    max_workers: usize,
) {
    let permits = Arc::new(Semaphore::new(max_workers));
    while let Some(line) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let handler = Arc::clone(&handler);
        let irc = irc.clone();
        tokio::task::spawn_blocking(move || {
            handle_line(handler.as_ref(), &line, &irc);
            drop(permit);
        });
    }
    debug!("dispatch: queue closed");
}

fn handle_line(handler: &dyn Handler, line: &Line, irc: &Irc) {
    if line.is_command("PRIVMSG") {
        match ChatMessage::from_privmsg(line) {
            Ok(messages) => {
                for msg in &messages {
                    handler.handle_message(msg, irc);
                }
            }
            Err(detail) => irc.report_error(detail),
        }
    } else {
        handler.handle_other(line, irc);
    }
}
