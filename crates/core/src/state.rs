//! Plugin identity and execution lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a plugin instance, stable across updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginId(u64);

impl PluginId {
    /// Wraps a raw identifier.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Execution state of a plugin instance.
///
/// `Completed`, `Failed` and `Cancelled` are resting states: like `Idle`
/// they accept a new call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionState {
    #[default]
    Idle,
    Running,
    CancelRequested,
    Cancelled,
    Completed,
    Failed,
}

impl ExecutionState {
    /// Returns true while a guest call is in flight.
    pub fn is_busy(self) -> bool {
        matches!(self, ExecutionState::Running | ExecutionState::CancelRequested)
    }

    /// Returns true if a new call may start from this state.
    pub fn accepts_call(self) -> bool {
        !self.is_busy()
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Running => "running",
            ExecutionState::CancelRequested => "cancel requested",
            ExecutionState::Cancelled => "cancelled",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a call was stopped at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// A caller cancelled the call's token.
    Requested,
    /// The call's deadline passed.
    Timeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancellation requested"),
            CancelReason::Timeout => f.write_str("deadline exceeded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resting_states_accept_calls() {
        for state in [
            ExecutionState::Idle,
            ExecutionState::Completed,
            ExecutionState::Failed,
            ExecutionState::Cancelled,
        ] {
            assert!(state.accepts_call(), "{state} should accept a call");
        }
        assert!(!ExecutionState::Running.accepts_call());
        assert!(!ExecutionState::CancelRequested.accepts_call());
    }
}
