//! Slack push event dispatch.
//!
//! Only plain user messages reach the session. Edits, deletions, joins and
//! anything posted by a bot (including our own output) carry a subtype or
//! a bot id and are dropped here.

use std::sync::Arc;

use slack_morphism::prelude::{
    SlackClient, SlackClientEventsUserState, SlackClientHyperHttpsConnector, SlackEventCallbackBody,
    SlackMessageEvent, SlackPushEventCallback,
};
use tracing::{debug, warn};

use crate::frontend::FrontendSession;

/// Channel and text of a message the session should see.
#[must_use]
pub fn chat_message(event: &SlackMessageEvent) -> Option<(String, String)> {
    if event.subtype.is_some() || event.sender.bot_id.is_some() {
        return None;
    }
    let channel = event.origin.channel.as_ref()?;
    let text = event.content.as_ref()?.text.as_ref()?;
    Some((channel.to_string(), text.clone()))
}

/// Handle push events delivered over Socket Mode.
///
/// # Errors
///
/// Never fails; problems are logged so Socket Mode keeps acknowledging.
pub async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    state: SlackClientEventsUserState,
) -> slack_morphism::UserCallbackResult<()> {
    let SlackEventCallbackBody::Message(message) = &event.event else {
        debug!("push event ignored");
        return Ok(());
    };
    let Some((channel, text)) = chat_message(message) else {
        debug!(subtype = ?message.subtype, "message event ignored");
        return Ok(());
    };

    let session: Option<Arc<FrontendSession>> = {
        let guard = state.read().await;
        guard.get_user_state::<Arc<FrontendSession>>().cloned()
    };
    let Some(session) = session else {
        warn!("session not available; dropping chat message");
        return Ok(());
    };

    session.on_chat_message(&channel, &text).await;
    Ok(())
}
