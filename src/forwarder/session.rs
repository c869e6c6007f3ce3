//! Forwarding session bookkeeping
//!
//! One session exists per stream. It is shared between the command side
//! (start/stop) and the worker task (count, auto-stop) behind a mutex. Every
//! start opens a new generation, so a worker left over from an earlier start
//! can never count or publish into the current one.
//!
//! ```text
//! Idle ──begin──► Forwarding ──limit──► StoppedByLimit
//!  ▲                  │                      │
//!  └──────end─────────┴──────────end─────────┘
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Forwarding,
    StoppedByLimit,
}

/// What happens when a session reaches its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPolicy {
    /// Only this stream stops
    #[default]
    StopStream,
    /// The whole process is asked to shut down
    ShutdownProcess,
}

impl CompletionPolicy {
    pub fn from_exit_on_complete(exit_on_complete: bool) -> Self {
        if exit_on_complete {
            CompletionPolicy::ShutdownProcess
        } else {
            CompletionPolicy::StopStream
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingSession {
    phase: SessionPhase,
    forwarded_count: u64,
    limit: u64,
    completion: CompletionPolicy,
    generation: u64,
}

impl ForwardingSession {
    pub fn new(limit: u64, completion: CompletionPolicy) -> Self {
        Self {
            phase: SessionPhase::Idle,
            forwarded_count: 0,
            limit,
            completion,
            generation: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Forwarding
    }

    pub fn forwarded_count(&self) -> u64 {
        self.forwarded_count
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn completion(&self) -> CompletionPolicy {
        self.completion
    }

    /// Opens a new generation with a zeroed count and returns its id.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.forwarded_count = 0;
        self.phase = SessionPhase::Forwarding;
        self.generation
    }

    /// True while `generation` is the running generation.
    pub fn accepts(&self, generation: u64) -> bool {
        self.is_active() && self.generation == generation
    }

    /// Counts one forwarded frame and returns the new total.
    pub fn record_forward(&mut self) -> u64 {
        self.forwarded_count += 1;
        self.forwarded_count
    }

    pub fn limit_reached(&self) -> bool {
        self.forwarded_count >= self.limit
    }

    /// Moves `generation` to StoppedByLimit if it is still running and has
    /// reached the limit. Returns whether the transition happened.
    pub fn finish_if_complete(&mut self, generation: u64) -> bool {
        if self.accepts(generation) && self.limit_reached() {
            self.phase = SessionPhase::StoppedByLimit;
            true
        } else {
            false
        }
    }

    /// Returns to Idle from any phase and reports the phase left behind.
    pub fn end(&mut self) -> SessionPhase {
        std::mem::replace(&mut self.phase, SessionPhase::Idle)
    }
}
