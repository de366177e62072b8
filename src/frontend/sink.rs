//! Outbound chat capability consumed by the front-end session.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::Result;

/// Boxed future returned by [`ChatSink`] operations.
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// The three things the session needs from a chat platform.
pub trait ChatSink: Send + Sync {
    /// Post `text` to `channel` as a plain message.
    fn post_text<'a>(&'a self, channel: &'a str, text: &'a str) -> SinkFuture<'a>;

    /// Post `text` to `channel` rendered as a fenced code block.
    fn post_code_block<'a>(&'a self, channel: &'a str, text: &'a str) -> SinkFuture<'a>;

    /// Upload the file at `path` to `channel`.
    fn upload_file<'a>(&'a self, channel: &'a str, path: &'a Path) -> SinkFuture<'a>;
}
