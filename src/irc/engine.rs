//! Connection engine, one task per server connection.
//!
//! The engine connects, registers, joins the configured rooms and then
//! multiplexes three sources in a single `select!`: lines from the server,
//! commands on its control mailbox, and keepalive timers (which arrive as
//! ordinary control messages scheduled through the timer service).
//!
//! Outbound lines are written by a companion writer task that owns the
//! write half of the socket and paces every line through the
//! [`RateLimiter`]. Anything worth telling the outside world goes out on
//! the log mailbox; the engine never fails in any other way.
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::codec::{sanitize, LineCodec};
use super::control::{ControlMessage, Internal, LogMessage};
use super::dispatch::{Dispatcher, Handler, Irc};
use super::limiter::RateLimiter;
use super::message::Line;
use crate::config::{Config, Timing};
use crate::mailbox::{self, Mailbox, Sender};
use crate::timer::Timers;

/// Slack on top of the paced drain time before the farewell is abandoned.
const FAREWELL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registering,
    Running,
    Quitting,
    Closed,
    /// Never got a socket.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Registering => "registering",
            ConnectionState::Running => "running",
            ConnectionState::Quitting => "quitting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Controller's view of a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    control: Sender<ControlMessage>,
    irc: Irc,
    task: JoinHandle<ConnectionState>,
}

impl EngineHandle {
    /// The engine's control mailbox.
    pub fn control(&self) -> &Sender<ControlMessage> {
        &self.control
    }

    /// The same capability handed to line handlers.
    pub fn irc(&self) -> &Irc {
        &self.irc
    }

    pub fn send_line(&self, line: impl Into<Bytes>) {
        let _ = self.control.send(ControlMessage::SendLine(line.into()));
    }

    pub fn quit(&self) {
        let _ = self.control.send(ControlMessage::Quit);
    }

    /// Wait for the engine to stop; yields `Closed` or `Failed`.
    ///
    /// `Failed` only ever means the connect itself failed. An engine task
    /// that panicked or was cancelled had a socket, so it counts as `Closed`.
    pub async fn join(self) -> ConnectionState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!("engine task ended abnormally: {e}");
                ConnectionState::Closed
            }
        }
    }
}

/// Everything an engine needs besides its socket.
struct Parts {
    config: Config,
    handler: Arc<dyn Handler>,
    timers: Timers<ControlMessage>,
    log: Sender<LogMessage>,
    control_tx: Sender<ControlMessage>,
    control: Mailbox<ControlMessage>,
    irc: Irc,
}

fn prepare(
    config: Config,
    handler: Arc<dyn Handler>,
    timers: Timers<ControlMessage>,
    log: Sender<LogMessage>,
) -> (Parts, Sender<ControlMessage>, Irc) {
    let (control_tx, control) = mailbox::channel();
    let irc = Irc::new(control_tx.clone(), log.clone(), config.nick.clone());
    let parts = Parts {
        config,
        handler,
        timers,
        log,
        control_tx: control_tx.clone(),
        control,
        irc: irc.clone(),
    };
    (parts, control_tx, irc)
}

/// Connect to `config.address()` over TCP and run the connection.
pub fn spawn(
    config: Config,
    handler: Arc<dyn Handler>,
    timers: Timers<ControlMessage>,
    log: Sender<LogMessage>,
) -> EngineHandle {
    let (parts, control, irc) = prepare(config, handler, timers, log);
    let task = tokio::spawn(async move {
        let addr = parts.config.address();
        info!(host = %parts.config.host, state = %ConnectionState::Connecting, "connecting to {addr}");
        match TcpStream::connect(&addr).await {
            Ok(stream) => run(stream, parts).await,
            Err(e) => {
                warn!(host = %parts.config.host, state = %ConnectionState::Failed, "connect failed: {e}");
                let _ = parts.log.send(LogMessage::error(format!("cannot connect to {addr}: {e}")));
                ConnectionState::Failed
            }
        }
    });
    EngineHandle { control, irc, task }
}

/// Run a connection over an already established stream.
pub fn spawn_on<S>(
    stream: S,
    config: Config,
    handler: Arc<dyn Handler>,
    timers: Timers<ControlMessage>,
    log: Sender<LogMessage>,
) -> EngineHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (parts, control, irc) = prepare(config, handler, timers, log);
    let task = tokio::spawn(run(stream, parts));
    EngineHandle { control, irc, task }
}

async fn run<S>(stream: S, parts: Parts) -> ConnectionState
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut conn = Connection::new(stream, parts);
    conn.register();
    conn.setup().await;
    conn.event_loop().await;
    conn.shutdown().await
}

struct Connection<S> {
    host: String,
    nick: String,
    realname: String,
    rooms: Vec<String>,
    quit_message: String,
    timing: Timing,
    state: ConnectionState,
    reader: FramedRead<ReadHalf<S>, LineCodec>,
    outbound: Sender<Bytes>,
    /// Lines handed to the writer and not yet written.
    backlog: Arc<AtomicUsize>,
    writer: JoinHandle<()>,
    control_tx: Sender<ControlMessage>,
    control: Mailbox<ControlMessage>,
    timers: Timers<ControlMessage>,
    log: Sender<LogMessage>,
    handler: Arc<dyn Handler>,
    irc: Irc,
    dispatcher: Dispatcher,
    /// A PING went out and nothing has arrived since.
    probe_outstanding: bool,
    last_activity: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn new(stream: S, parts: Parts) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mailbox::channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, LineCodec),
            queue,
            Arc::clone(&backlog),
            RateLimiter::new(parts.config.timing.send_interval),
            parts.log.clone(),
        ));
        let dispatcher = Dispatcher::spawn(
            Arc::clone(&parts.handler),
            parts.irc.clone(),
            parts.config.max_workers,
        );

        let mut conn = Connection {
            host: parts.config.host,
            nick: parts.config.nick,
            realname: parts.config.realname,
            rooms: parts.config.rooms,
            quit_message: parts.config.quit_message,
            timing: parts.config.timing,
            state: ConnectionState::Connecting,
            reader: FramedRead::new(read_half, LineCodec),
            outbound,
            backlog,
            writer,
            control_tx: parts.control_tx,
            control: parts.control,
            timers: parts.timers,
            log: parts.log,
            handler: parts.handler,
            irc: parts.irc,
            dispatcher,
            probe_outstanding: false,
            last_activity: Instant::now(),
        };
        conn.set_state(ConnectionState::Registering);
        conn
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        info!(host = %self.host, state = %state, "connection state");
    }

    fn send(&self, line: Bytes) {
        self.backlog.fetch_add(1, Ordering::SeqCst);
        if self.outbound.send(line).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Log a failure to the outside world.
    fn report(&self, detail: String) {
        warn!(host = %self.host, "{detail}");
        let _ = self.log.send(LogMessage::error(detail));
    }

    fn register(&mut self) {
        self.send(Line::new("NICK", [self.nick.clone()]).to_wire());
        self.send(
            Line::new(
                "USER",
                [
                    self.nick.clone(),
                    "0".to_owned(),
                    "*".to_owned(),
                    self.realname.clone(),
                ],
            )
            .to_wire(),
        );
    }

    async fn setup(&mut self) {
        for room in &self.rooms {
            self.irc.join(room);
        }

        let handler = Arc::clone(&self.handler);
        let irc = self.irc.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || handler.on_connect(&irc)).await {
            self.report(format!("on-connect hook failed: {e}"));
        }

        self.set_state(ConnectionState::Running);
    }

    async fn event_loop(&mut self) {
        self.touch();

        loop {
            tokio::select! {
                frame = self.reader.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await,
                    Some(Err(e)) => {
                        self.report(format!("connection lost: {e}"));
                        break;
                    }
                    None => {
                        self.report("connection lost: server closed the connection".into());
                        break;
                    }
                },
                msg = self.control.recv() => match msg {
                    Some(ControlMessage::SendLine(line)) => self.send(line),
                    Some(ControlMessage::PingProbe) => self.on_idle(),
                    Some(ControlMessage::PingTimeout) if self.probe_outstanding => {
                        self.report(format!(
                            "ping timeout: no reply within {}s",
                            self.timing.timeout.as_secs()
                        ));
                        break;
                    }
                    Some(ControlMessage::PingTimeout) => {
                        debug!(host = %self.host, "stale ping timeout ignored");
                    }
                    Some(ControlMessage::Quit) | None => break,
                },
            }
        }
    }

    /// Inbound activity: push the idle probe back and call off any timeout.
    fn touch(&mut self) {
        self.probe_outstanding = false;
        self.last_activity = Instant::now();
        self.timers
            .reschedule(self.timing.idle, &self.control_tx, ControlMessage::PingProbe);
        self.timers.cancel(&self.control_tx, ControlMessage::PingTimeout);
    }

    /// The idle timer fired. It may have been queued before the latest
    /// activity pushed it back; only probe once the full idle span has passed.
    fn on_idle(&mut self) {
        if Instant::now() < self.last_activity + self.timing.idle {
            debug!(host = %self.host, "stale idle probe ignored");
            return;
        }
        self.probe();
    }

    fn probe(&mut self) {
        debug!(host = %self.host, "idle, probing server");
        self.send(Line::new("PING", [self.host.clone()]).to_wire());
        self.probe_outstanding = true;
        self.timers
            .reschedule(self.timing.timeout, &self.control_tx, ControlMessage::PingTimeout);
    }

    async fn on_frame(&mut self, frame: Bytes) {
        let _ = self.log.send(LogMessage::Received(frame.clone()));
        self.touch();

        let line = match Line::parse(&frame) {
            Ok(line) => line,
            Err(e) => {
                self.report(format!(
                    "cannot parse line {:?}: {e}",
                    String::from_utf8_lossy(&frame)
                ));
                return;
            }
        };

        if line.is_command("PING") {
            self.send(pong(&line));
            return;
        }

        self.dispatcher.dispatch(line).await;
    }

    async fn shutdown(mut self) -> ConnectionState {
        self.set_state(ConnectionState::Quitting);

        self.timers.cancel(&self.control_tx, ControlMessage::PingProbe);
        self.timers.cancel(&self.control_tx, ControlMessage::PingTimeout);

        self.send(Line::new("QUIT", [self.quit_message.clone()]).to_wire());
        drop(self.outbound);
        drop(self.dispatcher.close());

        // Every queued line still goes out at the paced rate.
        let queued = self.backlog.load(Ordering::SeqCst);
        let drain = self.timing.send_interval.saturating_mul(saturating_u32(queued));
        let mut writer = self.writer;
        let grace = drain.saturating_add(FAREWELL_GRACE);
        if tokio::time::timeout(grace, &mut writer).await.is_err() {
            writer.abort();
            let detail = format!(
                "farewell not flushed in time, {} queued lines dropped",
                self.backlog.load(Ordering::SeqCst)
            );
            warn!(host = %self.host, "{detail}");
            let _ = self.log.send(LogMessage::error(detail));
        }
        drop(self.reader);

        let _ = self.log.send(LogMessage::Internal(Internal::Quit));
        self.state = ConnectionState::Closed;
        info!(host = %self.host, state = %self.state, "connection state");
        self.state
    }
}

/// Answer a server probe, echoing its token.
fn pong(ping: &Line) -> Bytes {
    let mut out = BytesMut::from(&b"PONG"[..]);
    if let Some(token) = ping.args.first() {
        out.put_u8(b' ');
        if token.contains(&b' ') || token.starts_with(b":") {
            out.put_u8(b':');
        }
        out.put_slice(token);
    }
    out.freeze()
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Pace, write and log every outbound line until the queue closes.
async fn write_loop<W>(
    mut sink: FramedWrite<WriteHalf<W>, LineCodec>,
    mut queue: Mailbox<Bytes>,
    backlog: Arc<AtomicUsize>,
    mut limiter: RateLimiter,
    log: Sender<LogMessage>,
) where
    W: AsyncWrite,
{
    while let Some(line) = queue.recv().await {
        limiter.until_ready().await;
        let line = sanitize(&line);
        if let Err(e) = sink.send(line.clone()).await {
            warn!("write failed: {e}");
            let _ = log.send(LogMessage::error(format!("write failed: {e}")));
            return;
        }
        backlog.fetch_sub(1, Ordering::SeqCst);
        let _ = log.send(LogMessage::Sent(line));
    }
    if let Err(e) = sink.close().await {
        debug!("closing socket: {e}");
    }
}
