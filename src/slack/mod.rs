//! Slack bridge: Socket Mode intake and the [`ChatSink`](crate::frontend::ChatSink)
//! implementation.

pub mod blocks;
pub mod client;
pub mod events;

pub use client::SlackService;
