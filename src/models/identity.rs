//! Relay participant identities.

use std::fmt::{Display, Formatter};

/// One of the two fixed relay participants.
///
/// Identities are transport-level addresses and never negotiated at
/// runtime; the wire token for each variant is stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    /// The chat-facing process.
    FrontEnd,
    /// The process that supervises the kernel.
    KernelManager,
}

impl Identity {
    /// Wire token for this identity.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::FrontEnd => "main",
            Self::KernelManager => "kernel_manager",
        }
    }

    /// Resolve a wire token; unknown tokens yield `None`.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "main" => Some(Self::FrontEnd),
            "kernel_manager" => Some(Self::KernelManager),
            _ => None,
        }
    }

    /// The participant on the other end of the relay.
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::FrontEnd => Self::KernelManager,
            Self::KernelManager => Self::FrontEnd,
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}
