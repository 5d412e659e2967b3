//! Error types for the motesim environment abstraction.

use crate::types::{MoteId, SimTime};
use thiserror::Error;

/// Faults raised by a CPU interpreter while executing firmware.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CpuFault {
    /// The interpreter deliberately asks the simulation to stop
    /// (breakpoint, watchpoint, explicit stop instruction).
    #[error("Simulation stop requested: {reason}")]
    StopRequested { reason: String },

    /// Undecodable instruction
    #[error("Illegal instruction {opcode:#06x} at pc={pc:#06x}")]
    IllegalInstruction { pc: u32, opcode: u32 },

    /// Read or write outside mapped memory
    #[error("Memory access violation at {address:#06x}")]
    MemoryAccess { address: u32 },

    /// The CPU asked to be woken before the current time
    #[error("Requested early wakeup: {requested} < {now}")]
    EarlyWakeup { requested: SimTime, now: SimTime },

    /// Anything else the interpreter reports
    #[error("Interpreter error: {0}")]
    Interpreter(String),
}

impl CpuFault {
    /// Creates a stop request.
    pub fn stop(reason: impl Into<String>) -> Self {
        Self::StopRequested { reason: reason.into() }
    }

    /// True if this fault is a deliberate stop request rather than a failure.
    pub fn is_stop_request(&self) -> bool {
        matches!(self, CpuFault::StopRequested { .. })
    }
}

/// Errors reported by environment collaborators.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Radio medium refused or failed a registration change
    #[error("Radio medium error: {0}")]
    RadioError(String),

    /// The referenced mote is not known to the collaborator
    #[error("Unknown mote: {0}")]
    UnknownMote(MoteId),
}

impl EnvError {
    /// Creates a radio error.
    pub fn radio(msg: impl Into<String>) -> Self {
        Self::RadioError(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_request_classification() {
        assert!(CpuFault::stop("breakpoint").is_stop_request());
        assert!(!CpuFault::IllegalInstruction { pc: 0x4000, opcode: 0xffff }.is_stop_request());
    }

    #[test]
    fn test_fault_display() {
        let fault = CpuFault::IllegalInstruction { pc: 0x4000, opcode: 0x12 };
        assert_eq!(fault.to_string(), "Illegal instruction 0x0012 at pc=0x4000");
        let err = EnvError::UnknownMote(MoteId(3));
        assert!(err.to_string().contains("mote #3"));
    }
}
