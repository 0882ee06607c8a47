use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use relaybot::config::Config;
use relaybot::irc::{engine, ChatMessage, ControlMessage, Handler, Irc, LogMessage};
use relaybot::mailbox::{self, Sender};
use relaybot::timer::TimerService;

/// Bot commands plug in here; for now just trace what arrives.
struct TraceHandler;

impl Handler for TraceHandler {
    fn on_connect(&self, irc: &Irc) {
        info!(nick = %irc.nick(), rooms = ?irc.rooms(), "registered");
    }

    fn handle_message(&self, msg: &ChatMessage, _irc: &Irc) {
        debug!(
            from = %String::from_utf8_lossy(&msg.sender),
            to = %String::from_utf8_lossy(&msg.reply_to),
            "{}",
            String::from_utf8_lossy(&msg.text)
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("relaybot: {} as {}", config.address(), config.nick);

    let (timers, timer_task) = TimerService::spawn();
    let (log_tx, mut log_rx) = mailbox::channel::<LogMessage>();

    // Observer: print the connection log as it happens.
    let printer = tokio::task::spawn_blocking(move || {
        while let Some(entry) = log_rx.blocking_recv() {
            println!("{entry}");
        }
    });

    let engine = engine::spawn(config, Arc::new(TraceHandler), timers.clone(), log_tx);

    // Operator console on a plain thread; it never holds up shutdown.
    let console = engine.control().clone();
    std::thread::spawn(move || read_console(console));

    let interrupt = engine.control().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupt.send(ControlMessage::Quit);
        }
    });

    let state = engine.join().await;
    info!(%state, "engine stopped");

    timers.quit();
    let _ = timer_task.await;
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    Ok(())
}

/// `/quit` closes the connection; any other line goes to the server verbatim.
fn read_console(control: Sender<ControlMessage>) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg = if line == "/quit" {
            ControlMessage::Quit
        } else {
            ControlMessage::SendLine(Bytes::from(line.to_owned()))
        };
        if control.send(msg).is_err() {
            break;
        }
    }
}
