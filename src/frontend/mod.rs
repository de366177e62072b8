//! Front-end side: chat session, administrative commands, and the
//! kernel-manager child process.

pub mod commands;
pub mod manager_process;
pub mod session;
pub mod sink;

pub use commands::{generate_help, strip_autolinks, AdminCommand};
pub use manager_process::KernelManagerProcess;
pub use session::FrontendSession;
pub use sink::{ChatSink, SinkFuture};
