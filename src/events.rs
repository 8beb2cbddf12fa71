//! Engine events and the sink they flow through.
//!
//! The engine reports notable side effects (stale context cleared, orphans
//! swept, a stale lock broken) through an injected `EventSink` rather than
//! a process-global emitter, so hosts and tests choose what to observe.

use slog::{Drain, Logger};
use std::sync::Mutex;

use crate::clock::Millis;

/// Something the engine did that a host may want to surface.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A recovery token older than the TTL was discarded on acquire.
    StaleContextCleared { age_ms: Millis },
    /// The orphan sweeper removed this many abandoned temp worktrees.
    OrphansSwept { count: usize },
    /// A cross-process lock file was broken during acquisition.
    LockBroken { reason: LockBreakReason },
    /// A session's UI phase changed.
    SessionPhaseChanged { repo_path: String, phase: String },
}

/// Why a lock file was considered stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBreakReason {
    Corrupt,
    Expired,
    DeadOwner,
}

/// Receiver for engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Sink that drops everything. The default for embedded use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Sink that logs each event through slog.
pub struct LogSink {
    logger: Logger,
}

impl LogSink {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: EngineEvent) {
        match event {
            EngineEvent::StaleContextCleared { age_ms } => {
                slog::warn!(self.logger, "cleared stale execution context"; "age_ms" => age_ms)
            }
            EngineEvent::OrphansSwept { count } => {
                slog::info!(self.logger, "swept orphaned temp worktrees"; "count" => count)
            }
            EngineEvent::LockBroken { reason } => {
                slog::warn!(self.logger, "broke stale execution lock"; "reason" => format!("{:?}", reason))
            }
            EngineEvent::SessionPhaseChanged { repo_path, phase } => {
                slog::debug!(self.logger, "session phase changed"; "repo" => repo_path, "phase" => phase)
            }
        }
    }
}

/// Sink that records events for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Create a slog logger that outputs to the terminal.
pub fn term_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = std::sync::Mutex::new(drain).fuse();
    Logger::root(drain, slog::o!())
}

/// A logger that discards everything; the library default.
pub fn null_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}
