//! Kernel lifecycle state machine.

use std::fmt::{Display, Formatter};

/// Lifecycle of the kernel owned by one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelState {
    /// No kernel has been launched yet.
    NotStarted,
    /// The subprocess is being spawned.
    Launching,
    /// Spawned; waiting for the connection descriptor and readiness.
    AwaitingConnection,
    /// The client reported ready.
    Ready,
    /// Relay traffic is being served.
    Serving,
    /// A deliberate stop is in progress.
    Stopping,
    /// Cleanly stopped.
    Stopped,
    /// The subprocess exited without being asked to.
    Crashed,
}

impl KernelState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Crashed | Self::Stopping => self != Self::Stopping || next == Self::Crashed,
            Self::Launching => self == Self::NotStarted,
            Self::AwaitingConnection => self == Self::Launching,
            Self::Ready => self == Self::AwaitingConnection,
            Self::Serving => self == Self::Ready,
            Self::Stopped => self == Self::Stopping,
            Self::NotStarted => false,
        }
    }

    /// Lower-case name used in status replies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Launching => "launching",
            Self::AwaitingConnection => "awaiting_connection",
            Self::Ready => "ready",
            Self::Serving => "serving",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }
}

impl Display for KernelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
