//! Error types for the simulation kernel.

use crate::event_queue::EventId;
use motesim_env::{CpuFault, EnvError, MoteId, SimTime};
use std::path::PathBuf;
use thiserror::Error;

/// Event queue contract violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    /// `add_event` on an event that is still scheduled
    #[error("Event {event} is already scheduled at {scheduled_at} (requested {requested})")]
    AlreadyScheduled {
        event: EventId,
        scheduled_at: SimTime,
        requested: SimTime,
    },

    /// Handle does not refer to a live event (never registered or released)
    #[error("Unknown or released event {0}")]
    UnknownEvent(EventId),
}

/// Mote memory access errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Variable name not present in the symbol map
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// No section covers the requested range
    #[error("Unmapped memory range {address:#06x}+{len}")]
    Unmapped { address: u32, len: usize },
}

/// Configuration errors. These are validated at the API boundary and never
/// reach a running simulation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Speed limit must be a positive, finite ratio
    #[error("Invalid speed limit: {0}")]
    InvalidSpeedLimit(f64),

    /// Log output history needs room for at least one record
    #[error("Invalid log output buffer size: {0}")]
    InvalidBufferSize(usize),

    /// No CPU factory registered for the platform
    #[error("No CPU registered for platform {0}")]
    UnknownPlatform(String),

    /// No radio medium registered under the name
    #[error("Unknown radio medium: {0}")]
    UnknownRadioMedium(String),

    /// Mote type identifier not known to the simulation
    #[error("Unknown mote type: {0}")]
    UnknownMoteType(String),

    /// Config file could not be read
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Config file is not valid JSON for `SimConfig`
    #[error("Malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors that terminate (or are reported by) the simulation kernel.
#[derive(Debug, Error)]
pub enum SimError {
    /// Event queue contract violation
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    /// A running simulation ran out of events
    #[error("No more events at time {time}")]
    EmptyQueue { time: SimTime },

    /// The next event lies before the current time
    #[error("Next event {event} is in the past: {event_time} < {current}")]
    TimeWentBackward {
        event: String,
        event_time: SimTime,
        current: SimTime,
    },

    /// An event broke the queue contract while executing
    #[error("{event} at {time} failed: {source}")]
    EventFailed {
        event: String,
        time: SimTime,
        mote: Option<MoteId>,
        source: SchedulingError,
    },

    /// A mote's CPU failed while executing
    #[error("{mote} failed during {event}: {source}")]
    MoteFault {
        mote: MoteId,
        event: String,
        source: CpuFault,
    },

    /// A mote (or event) deliberately asked the simulation to stop
    #[error("Simulation stop requested by {}: {reason}", requester(.mote))]
    StopRequested { mote: Option<MoteId>, reason: String },

    /// Mote id not present in the simulation
    #[error("Unknown mote: {0}")]
    UnknownMote(MoteId),

    /// Mote id already present in the simulation
    #[error("Duplicate mote: {0}")]
    DuplicateMote(MoteId),

    /// Collaborator error
    #[error(transparent)]
    Env(#[from] EnvError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Mote memory access
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// An event panicked
    #[error("Event panicked: {0}")]
    Panicked(String),

    /// A blocking call was made from the simulation thread itself
    #[error("Operation would block the simulation thread")]
    NotOnSimulationThread,

    /// Waited too long for the simulation thread
    #[error("Timed out after {0}ms waiting for the simulation thread")]
    Timeout(u64),

    /// The simulation thread went away before replying
    #[error("Simulation thread disconnected")]
    Disconnected,

    /// The OS refused to start the simulation thread
    #[error("Cannot start simulation thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

impl SimError {
    /// Creates a kernel-level stop request.
    pub fn stop(reason: impl Into<String>) -> Self {
        Self::StopRequested {
            mote: None,
            reason: reason.into(),
        }
    }

    /// True if this is a deliberate stop, which ends a run quietly.
    pub fn is_requested_stop(&self) -> bool {
        matches!(self, SimError::StopRequested { .. })
    }

    /// Mote implicated by the error, if any.
    pub fn mote(&self) -> Option<MoteId> {
        match self {
            SimError::MoteFault { mote, .. } => Some(*mote),
            SimError::StopRequested { mote, .. } | SimError::EventFailed { mote, .. } => *mote,
            SimError::UnknownMote(mote) | SimError::DuplicateMote(mote) => Some(*mote),
            _ => None,
        }
    }
}

fn requester(mote: &Option<MoteId>) -> String {
    match mote {
        Some(mote) => mote.to_string(),
        None => "kernel".to_string(),
    }
}

/// Convenience alias for kernel results.
pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_stop_classification() {
        let stop = SimError::StopRequested {
            mote: Some(MoteId(2)),
            reason: "breakpoint".into(),
        };
        assert!(stop.is_requested_stop());
        assert_eq!(stop.mote(), Some(MoteId(2)));
        assert!(stop.to_string().contains("mote #2"));

        let fault = SimError::MoteFault {
            mote: MoteId(4),
            event: "mote tick".into(),
            source: CpuFault::MemoryAccess { address: 0x1100 },
        };
        assert!(!fault.is_requested_stop());
        assert_eq!(fault.mote(), Some(MoteId(4)));
        assert!(fault.to_string().contains("0x1100"));
    }

    #[test]
    fn test_kernel_stop_display() {
        assert!(SimError::stop("done").to_string().contains("kernel"));
    }

    #[test]
    fn test_time_backward_display() {
        let e = SimError::TimeWentBackward {
            event: "delay".into(),
            event_time: 3,
            current: 10,
        };
        assert_eq!(e.to_string(), "Next event delay is in the past: 3 < 10");
    }
}
