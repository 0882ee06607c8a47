use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};

use relaybot::config::{Config, Timing};
use relaybot::irc::{
    engine, ChatMessage, ConnectionState, ControlMessage, EngineHandle, Handler, Internal, Irc,
    Line, LogMessage,
};
use relaybot::mailbox::{self, Mailbox, Sender};
use relaybot::timer::{TimerService, Timers};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    Config {
        host: "irc.test".into(),
        nick: "flip".into(),
        realname: "Flip Test".into(),
        quit_message: "bye".into(),
        timing: Timing {
            send_interval: Duration::from_millis(10),
            ..Timing::default()
        },
        max_workers: 1,
        ..Config::default()
    }
}

/// Records every hook call as a line of text.
struct Recorder(Sender<String>);

impl Handler for Recorder {
    fn on_connect(&self, _irc: &Irc) {
        let _ = self.0.send("connect".into());
    }

    fn handle_message(&self, msg: &ChatMessage, _irc: &Irc) {
        let _ = self.0.send(format!(
            "msg {} {}",
            String::from_utf8_lossy(&msg.reply_to),
            String::from_utf8_lossy(&msg.text)
        ));
    }

    fn handle_other(&self, line: &Line, _irc: &Irc) {
        let _ = self.0.send(format!("other {line}"));
    }
}

/// Greets the first configured room once registered.
struct Greeter;

impl Handler for Greeter {
    fn on_connect(&self, irc: &Irc) {
        if let Some(room) = irc.rooms().into_iter().next() {
            irc.message(room.as_bytes(), b"hello");
        }
    }
}

struct FakeServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    async fn read(&mut self) -> Option<String> {
        self.lines.next_line().await.unwrap()
    }

    async fn read_soon(&mut self) -> Option<String> {
        timeout(WAIT, self.read()).await.expect("server read timed out")
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn expect_registration(&mut self) {
        assert_eq!(self.read().await.as_deref(), Some("NICK :flip"));
        assert_eq!(self.read().await.as_deref(), Some("USER flip 0 * :Flip Test"));
    }
}

struct Harness {
    engine: EngineHandle,
    server: FakeServer,
    log: Mailbox<LogMessage>,
    _timers: Timers<ControlMessage>,
}

fn start(config: Config, handler: Arc<dyn Handler>) -> Harness {
    let (timers, _task) = TimerService::spawn();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (log_tx, log) = mailbox::channel();
    let engine = engine::spawn_on(client, config, handler, timers.clone(), log_tx);
    let (read, writer) = tokio::io::split(server);
    Harness {
        engine,
        server: FakeServer {
            lines: BufReader::new(read).lines(),
            writer,
        },
        log,
        _timers: timers,
    }
}

fn drain(log: &mut Mailbox<LogMessage>) -> Vec<LogMessage> {
    std::iter::from_fn(|| log.try_recv()).collect()
}

fn errors(entries: &[LogMessage]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|entry| match entry {
            LogMessage::Internal(Internal::Error(detail)) => Some(detail.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn answers_ping_without_dispatching_it() {
    let (seen, mut seen_rx) = mailbox::channel();
    let mut h = start(test_config(), Arc::new(Recorder(seen)));
    h.server.expect_registration().await;

    h.server.send("PING :abc123").await;
    assert_eq!(h.server.read_soon().await.as_deref(), Some("PONG abc123"));

    h.server.send(":alice!a@h PRIVMSG #room :hi").await;
    assert_eq!(seen_rx.recv().await.as_deref(), Some("connect"));
    assert_eq!(seen_rx.recv().await.as_deref(), Some("msg #room hi"));

    h.server.send(":srv 001 flip :welcome").await;
    assert_eq!(
        seen_rx.recv().await.as_deref(),
        Some("other :srv 001 flip :welcome")
    );

    h.engine.quit();
    assert_eq!(h.server.read_soon().await.as_deref(), Some("QUIT :bye"));
    assert_eq!(h.engine.join().await, ConnectionState::Closed);
}

#[tokio::test]
async fn joins_rooms_before_on_connect() {
    let config = Config {
        rooms: vec!["#a".into(), "#b".into()],
        ..test_config()
    };
    let mut h = start(config, Arc::new(Greeter));
    h.server.expect_registration().await;

    assert_eq!(h.server.read_soon().await.as_deref(), Some("JOIN :#a"));
    assert_eq!(h.server.read_soon().await.as_deref(), Some("JOIN :#b"));
    assert_eq!(h.server.read_soon().await.as_deref(), Some("PRIVMSG #a :hello"));

    let rooms: Vec<String> = h.engine.irc().rooms().into_iter().collect();
    assert_eq!(rooms, vec!["#a", "#b"]);

    h.engine.quit();
    assert_eq!(h.engine.join().await, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn outbound_lines_are_spaced_one_second_apart() {
    let config = Config {
        timing: Timing::default(),
        ..test_config()
    };
    let mut h = start(config, Arc::new(Greeter));
    for text in ["one", "two", "three"] {
        h.engine.send_line(format!("PRIVMSG #room :{text}"));
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        let line = h.server.read().await.unwrap();
        received.push((Instant::now(), line));
    }

    let lines: Vec<&str> = received.iter().map(|(_, l)| l.as_str()).collect();
    assert_eq!(
        lines,
        vec![
            "NICK :flip",
            "USER flip 0 * :Flip Test",
            "PRIVMSG #room :one",
            "PRIVMSG #room :two",
            "PRIVMSG #room :three",
        ]
    );
    for pair in received.windows(2) {
        let gap = pair[1].0 - pair[0].0;
        assert!(gap >= Duration::from_secs(1), "lines only {gap:?} apart");
    }

    h.engine.quit();
    assert_eq!(h.engine.join().await, ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn quit_waits_for_a_long_backlog() {
    let config = Config {
        timing: Timing::default(),
        ..test_config()
    };
    let mut h = start(config, Arc::new(Greeter));
    let expected: Vec<String> = (0..15).map(|i| format!("PRIVMSG #room :{i}")).collect();
    for line in &expected {
        h.engine.send_line(line.clone());
    }
    h.engine.quit();

    let mut received = Vec::new();
    while let Some(line) = h.server.read().await {
        received.push(line);
    }

    assert_eq!(received.len(), 18, "{received:?}");
    assert_eq!(received[2..17].to_vec(), expected);
    assert_eq!(received.last().map(String::as_str), Some("QUIT :bye"));
    assert_eq!(h.engine.join().await, ConnectionState::Closed);
    assert!(errors(&drain(&mut h.log)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_server_gets_one_probe_then_times_out() {
    let config = Config {
        timing: Timing {
            idle: Duration::from_secs(300),
            timeout: Duration::from_secs(180),
            send_interval: Duration::from_secs(1),
        },
        ..test_config()
    };
    let started = Instant::now();
    let mut h = start(config, Arc::new(Greeter));
    h.server.expect_registration().await;

    assert_eq!(h.server.read().await.as_deref(), Some("PING :irc.test"));
    let probed = Instant::now();
    assert!(probed - started >= Duration::from_secs(300));

    assert_eq!(h.server.read().await.as_deref(), Some("QUIT :bye"));
    assert!(Instant::now() - probed >= Duration::from_secs(180));
    assert_eq!(h.server.read().await, None);

    assert_eq!(h.engine.join().await, ConnectionState::Closed);

    let entries = drain(&mut h.log);
    let errors = errors(&entries);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("ping timeout"));
    let pings = entries
        .iter()
        .filter(|e| matches!(e, LogMessage::Sent(line) if line.starts_with(b"PING")))
        .count();
    assert_eq!(pings, 1);
    assert_eq!(entries.last(), Some(&LogMessage::Internal(Internal::Quit)));
}

#[tokio::test(start_paused = true)]
async fn inbound_traffic_postpones_the_probe() {
    let config = Config {
        timing: Timing {
            idle: Duration::from_secs(300),
            timeout: Duration::from_secs(180),
            send_interval: Duration::from_secs(1),
        },
        ..test_config()
    };
    let mut h = start(config, Arc::new(Greeter));
    h.server.expect_registration().await;

    tokio::time::sleep(Duration::from_secs(200)).await;
    h.server.send(":srv NOTICE flip :still here").await;
    let spoke = Instant::now();

    assert_eq!(h.server.read().await.as_deref(), Some("PING :irc.test"));
    assert!(Instant::now() - spoke >= Duration::from_secs(300));

    // The reply clears the outstanding probe, so no timeout follows.
    h.server.send("PONG :irc.test").await;
    tokio::time::sleep(Duration::from_secs(250)).await;
    h.engine.quit();
    assert_eq!(h.server.read().await.as_deref(), Some("QUIT :bye"));
    assert_eq!(h.engine.join().await, ConnectionState::Closed);
    assert_eq!(errors(&drain(&mut h.log)), Vec::<String>::new());
}

#[tokio::test]
async fn unparsable_line_is_logged_and_skipped() {
    let mut h = start(test_config(), Arc::new(Greeter));
    h.server.expect_registration().await;

    h.server.send(":").await;
    h.server.send("PING :still-alive").await;
    assert_eq!(h.server.read_soon().await.as_deref(), Some("PONG still-alive"));

    h.engine.quit();
    assert_eq!(h.engine.join().await, ConnectionState::Closed);

    let entries = drain(&mut h.log);
    assert!(entries.contains(&LogMessage::Received(":".into())));
    let errors = errors(&entries);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].starts_with("cannot parse line"));
}

#[tokio::test]
async fn quit_sends_farewell_and_closes() {
    let mut h = start(test_config(), Arc::new(Greeter));
    h.server.expect_registration().await;

    h.engine.quit();
    assert_eq!(h.server.read_soon().await.as_deref(), Some("QUIT :bye"));
    assert_eq!(h.server.read_soon().await, None);
    assert_eq!(h.engine.join().await, ConnectionState::Closed);

    let entries = drain(&mut h.log);
    assert!(entries.contains(&LogMessage::Sent("QUIT :bye".into())));
    assert_eq!(entries.last(), Some(&LogMessage::Internal(Internal::Quit)));
    assert!(errors(&entries).is_empty());
}

#[tokio::test]
async fn server_hangup_is_reported() {
    let mut h = start(test_config(), Arc::new(Greeter));
    h.server.expect_registration().await;

    h.server.writer.shutdown().await.unwrap();

    // The farewell still goes out on the half that is open.
    assert_eq!(h.server.read_soon().await.as_deref(), Some("QUIT :bye"));
    assert_eq!(h.engine.join().await, ConnectionState::Closed);

    let entries = drain(&mut h.log);
    let errors = errors(&entries);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("server closed the connection"));
    assert_eq!(entries.last(), Some(&LogMessage::Internal(Internal::Quit)));
}

#[tokio::test]
async fn runaway_line_drops_the_connection() {
    let mut h = start(test_config(), Arc::new(Greeter));
    h.server.expect_registration().await;

    h.server.writer.write_all(&[b'x'; 9000]).await.unwrap();

    assert_eq!(h.engine.join().await, ConnectionState::Closed);
    let errors = errors(&drain(&mut h.log));
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].starts_with("connection lost"));
}

#[tokio::test]
async fn connects_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = Config {
        host: "127.0.0.1".into(),
        port,
        ..test_config()
    };

    let (timers, _task) = TimerService::spawn();
    let (log_tx, _log) = mailbox::channel();
    let engine = engine::spawn(config, Arc::new(Greeter), timers, log_tx);

    let (socket, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut lines = BufReader::new(socket).lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("NICK :flip"));

    engine.quit();
    assert_eq!(engine.join().await, ConnectionState::Closed);
}

#[tokio::test]
async fn refused_connection_fails() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = Config {
        host: "127.0.0.1".into(),
        port,
        ..test_config()
    };

    let (timers, _task) = TimerService::spawn();
    let (log_tx, mut log) = mailbox::channel();
    let engine = engine::spawn(config, Arc::new(Greeter), timers, log_tx);

    assert_eq!(engine.join().await, ConnectionState::Failed);
    let entries = drain(&mut log);
    let errors = errors(&entries);
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].starts_with("cannot connect to 127.0.0.1:"));
    assert!(!entries.contains(&LogMessage::Internal(Internal::Quit)));
}
