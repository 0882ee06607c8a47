//! Timer service: deferred deliveries into mailboxes.
//!
//! A single task owns a list of [`Timer`]s kept sorted by due time. When
//! the earliest one comes due its payload is sent to its target mailbox.
//! Everyone else talks to the service through a [`Timers`] handle, which
//! only ever enqueues a [`TimerCommand`] on the service's own mailbox.
//!
//! A timer is identified by `(target, payload)`, never by its due time, so
//! cancelling or rescheduling needs nothing but what was scheduled.
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::mailbox::{self, Mailbox, Sender};

/// One pending delivery.
#[derive(Debug)]
pub struct Timer<T> {
    pub due: Instant,
    pub target: Sender<T>,
    pub payload: T,
}

impl<T: PartialEq> Timer<T> {
    fn matches(&self, target: &Sender<T>, payload: &T) -> bool {
        self.target.same_mailbox(target) && self.payload == *payload
    }
}

/// Commands understood by the service loop.
#[derive(Debug)]
pub enum TimerCommand<T> {
    Schedule(Timer<T>),
    Cancel { target: Sender<T>, payload: T },
    Reschedule(Timer<T>),
    Quit,
}

/// Timers sorted ascending by due time; ties keep insertion order.
#[derive(Debug)]
pub struct TimerList<T> {
    timers: Vec<Timer<T>>,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self { timers: Vec::new() }
    }
}

impl<T: PartialEq> TimerList<T> {
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Due time of the earliest timer, if any.
    pub fn next_due(&self) -> Option<Instant> {
        self.timers.first().map(|t| t.due)
    }

    /// Insert after every timer due at or before `timer.due`.
    pub fn insert(&mut self, timer: Timer<T>) {
        let idx = self.timers.partition_point(|t| t.due <= timer.due);
        self.timers.insert(idx, timer);
    }

    /// Remove the earliest timer matching `(target, payload)`.
    /// Returns `false` and leaves the list untouched when none matches.
    pub fn cancel(&mut self, target: &Sender<T>, payload: &T) -> bool {
        match self.timers.iter().position(|t| t.matches(target, payload)) {
            Some(idx) => {
                self.timers.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn reschedule(&mut self, timer: Timer<T>) {
        self.cancel(&timer.target, &timer.payload);
        self.insert(timer);
    }

    /// Split off every timer due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Timer<T>> {
        let split = self.timers.partition_point(|t| t.due <= now);
        self.timers.drain(..split).collect()
    }
}

/// Cloneable handle for scheduling work on a running [`TimerService`].
#[derive(Debug)]
pub struct Timers<T> {
    control: Sender<TimerCommand<T>>,
}

impl<T> Clone for Timers<T> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
        }
    }
}

impl<T> Timers<T> {
    /// Deliver `payload` to `target` after `delay`.
    pub fn schedule(&self, delay: Duration, target: &Sender<T>, payload: T) {
        let timer = Timer {
            due: Instant::now() + delay,
            target: target.clone(),
            payload,
        };
        let _ = self.control.send(TimerCommand::Schedule(timer));
    }

    /// Drop the earliest timer matching `(target, payload)`. No-op if absent.
    pub fn cancel(&self, target: &Sender<T>, payload: T) {
        let _ = self.control.send(TimerCommand::Cancel {
            target: target.clone(),
            payload,
        });
    }

    /// Move an existing timer to `now + delay`, or create it if absent.
    pub fn reschedule(&self, delay: Duration, target: &Sender<T>, payload: T) {
        let timer = Timer {
            due: Instant::now() + delay,
            target: target.clone(),
            payload,
        };
        let _ = self.control.send(TimerCommand::Reschedule(timer));
    }

    /// Stop the service. Timers still pending are discarded.
    pub fn quit(&self) {
        let _ = self.control.send(TimerCommand::Quit);
    }
}

/// The service loop state. Only this task ever touches the list.
#[derive(Debug)]
pub struct TimerService<T> {
    control: Mailbox<TimerCommand<T>>,
    timers: TimerList<T>,
}

impl<T> TimerService<T>
where
    T: PartialEq + Send + 'static,
{
    /// Start the service on the current tokio runtime.
    pub fn spawn() -> (Timers<T>, JoinHandle<()>) {
        let (tx, rx) = mailbox::channel();
        let service = TimerService {
            control: rx,
            timers: TimerList::default(),
        };
        (Timers { control: tx }, tokio::spawn(service.run()))
    }

    async fn run(mut self) {
        loop {
            let deadline = self.timers.next_due();
            tokio::select! {
                cmd = self.control.recv() => match cmd {
                    Some(TimerCommand::Schedule(timer)) => self.timers.insert(timer),
                    Some(TimerCommand::Cancel { target, payload }) => {
                        self.timers.cancel(&target, &payload);
                    }
                    Some(TimerCommand::Reschedule(timer)) => self.timers.reschedule(timer),
                    Some(TimerCommand::Quit) | None => break,
                },
                _ = sleep_until(deadline) => self.fire_due(),
            }
        }
        debug!(pending = self.timers.len(), "timer service stopped");
    }

    fn fire_due(&mut self) {
        for timer in self.timers.pop_due(Instant::now()) {
            // A target that went away has nobody left to notify.
            let _ = timer.target.send(timer.payload);
        }
    }
}

/// Sleep until `deadline`, or forever when there is nothing scheduled.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
