//! `.kernel` administrative commands and inbound text cleanup.

use std::sync::OnceLock;

use regex::Regex;

/// Prefix that marks a chat message as an administrative command.
pub const COMMAND_PREFIX: &str = ".kernel";

const COMMAND_NAMES: [&str; 4] = ["help", "restart", "version", "status"];

/// Administrative command typed into the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// Stop and start the kernel-manager child.
    Restart,
    /// Reply with the command listing.
    Help,
    /// Run the interpreter version probe in the kernel.
    Version,
    /// Ask the kernel-manager for its lifecycle state.
    Status,
    /// Anything else after the prefix; answered with the help listing.
    Unknown(String),
}

impl AdminCommand {
    /// Parse `text`; `None` when it is not an administrative command.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.trim().strip_prefix(COMMAND_PREFIX)?;
        let command = match rest.trim() {
            "restart" if rest.starts_with(char::is_whitespace) => Self::Restart,
            "help" if rest.starts_with(char::is_whitespace) => Self::Help,
            "version" if rest.starts_with(char::is_whitespace) => Self::Version,
            "status" if rest.starts_with(char::is_whitespace) => Self::Status,
            other => Self::Unknown(other.to_owned()),
        };
        Some(command)
    }
}

/// Listing of every administrative command.
#[must_use]
pub fn generate_help() -> String {
    let mut help = String::from("The following commands are available: \n");
    for name in COMMAND_NAMES {
        help.push_str("\n ");
        help.push_str(COMMAND_PREFIX);
        help.push(' ');
        help.push_str(name);
    }
    help
}

#[allow(clippy::unwrap_used)] // literal pattern
fn autolink_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<(.*?)>").unwrap())
}

/// Undo chat auto-link decoration: `<http://x.io>` becomes `http://x.io`.
#[must_use]
pub fn strip_autolinks(text: &str) -> String {
    autolink_pattern().replace_all(text, "$1").into_owned()
}
