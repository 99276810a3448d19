//! Drift-corrected countdown/stopwatch timer.
//!
//! The scheduler runs as its own task and talks to the page only through
//! channels: [`TimerCommand`]s in, [`TimerEvent`]s out. Elapsed time is
//! always measured from the session origin on the monotonic clock, and each
//! tick is aligned to the tick cadence relative to that origin, so scheduling
//! jitter never accumulates.
//!
//! ```text
//!            start(T)                    stop(T) / complete
//!   idle  ------------>  running(T)  -------------------------> idle
//!                         |    ^
//!                         +----+ tick
//!                        start(T2) replaces T unconditionally
//! ```

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::TimerConfig;
use crate::error::{Error, Result};
use crate::messages::{TimerCommand, TimerEvent, TimerMode};

/// Delay until the next tick, aligned to the cadence relative to the origin.
///
/// A zero `tick_ms` is treated as 1.
#[must_use]
pub const fn next_delay_ms(elapsed_ms: u64, tick_ms: u64, min_delay_ms: u64) -> u64 {
    let tick_ms = if tick_ms == 0 { 1 } else { tick_ms };
    let until_boundary = tick_ms - elapsed_ms % tick_ms;
    if until_boundary > min_delay_ms {
        until_boundary
    } else {
        min_delay_ms
    }
}

/// The single running timer session.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerSession {
    token: i64,
    mode: TimerMode,
    planned_sec: f64,
    started: Instant,
    last_emit: Option<Instant>,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Events to emit, in order.
    pub events: Vec<TimerEvent>,
    /// Delay until the next tick; `None` once the session has finished.
    pub next_delay: Option<Duration>,
}

impl TimerSession {
    /// Starts a session at `now`. The zero-elapsed progress sent at start is
    /// not counted, so the first tick always reports progress.
    #[must_use]
    pub const fn new(token: i64, mode: TimerMode, planned_sec: f64, now: Instant) -> Self {
        Self {
            token,
            mode,
            planned_sec,
            started: now,
            last_emit: None,
        }
    }

    /// Session token.
    #[must_use]
    pub const fn token(&self) -> i64 {
        self.token
    }

    /// Counting mode.
    #[must_use]
    pub const fn mode(&self) -> TimerMode {
        self.mode
    }

    /// Time since the session origin, never negative.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Advances the session to `now`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn tick(&mut self, now: Instant, config: &TimerConfig) -> Tick {
        let elapsed = self.elapsed(now);
        let elapsed_sec = elapsed.as_secs_f64();
        let mut events = Vec::new();

        let due = self
            .last_emit
            .is_none_or(|last| now.saturating_duration_since(last) >= Duration::from_millis(config.emit_interval_ms));
        if due {
            self.last_emit = Some(now);
            events.push(TimerEvent::Progress {
                token: self.token,
                elapsed_sec,
            });
        }

        if self.mode == TimerMode::Countdown && self.planned_sec > 0.0 && elapsed_sec >= self.planned_sec {
            events.push(TimerEvent::Complete { token: self.token });
            return Tick {
                events,
                next_delay: None,
            };
        }

        // u128 -> u64 only truncates after ~584 million years
        let delay = next_delay_ms(elapsed.as_millis() as u64, config.tick_ms, config.min_delay_ms);
        Tick {
            events,
            next_delay: Some(Duration::from_millis(delay)),
        }
    }
}

/// Owns at most one [`TimerSession`] and the deadline of its next tick.
pub struct TimerScheduler {
    config: TimerConfig,
    events: mpsc::UnboundedSender<TimerEvent>,
    session: Option<TimerSession>,
    deadline: Option<Instant>,
}

impl TimerScheduler {
    /// Creates an idle scheduler emitting into `events`.
    #[must_use]
    pub const fn new(config: TimerConfig, events: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            config,
            events,
            session: None,
            deadline: None,
        }
    }

    /// The running session, if any.
    #[must_use]
    pub const fn session(&self) -> Option<&TimerSession> {
        self.session.as_ref()
    }

    /// When the next tick is due.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn emit(&self, event: TimerEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Timer event for token {} dropped, receiver gone", event.token());
        }
    }

    fn clear(&mut self) {
        self.session = None;
        self.deadline = None;
    }

    /// Applies a command received at `now`.
    pub fn handle_command(&mut self, command: TimerCommand, now: Instant) {
        match command {
            TimerCommand::Start {
                token,
                mode,
                planned_sec,
            } => {
                if let Some(previous) = self.session.take() {
                    log::debug!("Timer session {} replaced by {token}", previous.token);
                }
                self.session = Some(TimerSession::new(token, mode, planned_sec, now));
                self.deadline = Some(now + Duration::from_millis(self.config.tick_ms));
                self.emit(TimerEvent::Progress {
                    token,
                    elapsed_sec: 0.0,
                });
            }
            TimerCommand::Stop { token } => match (&self.session, token) {
                (Some(session), Some(token)) if session.token != token => {
                    log::debug!("Ignoring stop for {token}, session {} is running", session.token);
                }
                (Some(_), _) => self.clear(),
                (None, _) => {}
            },
        }
    }

    /// Runs the tick that was due, at `now`.
    pub fn on_tick(&mut self, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            self.deadline = None;
            return;
        };
        let tick = session.tick(now, &self.config);
        for event in tick.events {
            self.emit(event);
        }
        match tick.next_delay {
            Some(delay) => self.deadline = Some(now + delay),
            None => self.clear(),
        }
    }

    /// Processes commands and ticks until the command channel closes or
    /// `shutdown` fires.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TimerCommand>, shutdown: CancellationToken) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command, Instant::now());
                }
                () = wait_for(deadline) => self.on_tick(Instant::now()),
            }
        }
        log::debug!("Timer scheduler stopped");
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Sending side of a spawned [`TimerScheduler`].
pub struct TimerHandle {
    commands: mpsc::UnboundedSender<TimerCommand>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Queues a command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerStopped`] if the scheduler task has exited.
    pub fn send(&self, command: TimerCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::TimerStopped)
    }

    /// Starts a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerStopped`] if the scheduler task has exited.
    pub fn start(&self, token: i64, mode: TimerMode, planned_sec: f64) -> Result<()> {
        self.send(TimerCommand::Start {
            token,
            mode,
            planned_sec,
        })
    }

    /// Stops the session with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerStopped`] if the scheduler task has exited.
    pub fn stop(&self, token: i64) -> Result<()> {
        self.send(TimerCommand::Stop { token: Some(token) })
    }

    /// Stops the scheduler and waits for its task to end.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            log::warn!("Timer task ended abnormally: {e}");
        }
    }
}

/// Spawns a scheduler task. It ends when `shutdown` fires or the handle
/// is shut down.
#[must_use]
pub fn spawn_timer(
    config: TimerConfig,
    shutdown: CancellationToken,
) -> (TimerHandle, mpsc::UnboundedReceiver<TimerEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let scheduler = TimerScheduler::new(config, event_tx);
    let task = tokio::spawn(scheduler.run(command_rx, shutdown.clone()));
    (
        TimerHandle {
            commands: command_tx,
            shutdown,
            task,
        },
        event_rx,
    )
}
