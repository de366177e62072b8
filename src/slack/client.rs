//! Slack Socket Mode client and chat sink.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use slack_morphism::errors::SlackClientError;
use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest, SlackApiFilesComplete,
    SlackApiFilesCompleteUploadExternalRequest, SlackApiFilesGetUploadUrlExternalRequest,
    SlackApiToken, SlackApiTokenType, SlackApiTokenValue, SlackBlock, SlackChannelId, SlackClient,
    SlackClientEventsListenerEnvironment, SlackClientHyperHttpsConnector, SlackClientSession,
    SlackClientSocketModeConfig, SlackClientSocketModeListener, SlackMessageContent,
    SlackSocketModeListenerCallbacks,
};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::frontend::{ChatSink, FrontendSession, SinkFuture};
use crate::slack::{blocks, events};
use crate::{config::SlackConfig, AppError, Result};

const MAX_POST_ATTEMPTS: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Message to be delivered to Slack via chat.postMessage.
#[derive(Debug, Clone)]
pub struct SlackMessage {
    /// Destination channel.
    pub channel: SlackChannelId,
    /// Fallback and notification text.
    pub text: Option<String>,
    /// Rich layout, if any.
    pub blocks: Option<Vec<SlackBlock>>,
}

impl SlackMessage {
    /// Create a plain-text message for a channel.
    #[must_use]
    pub fn plain(channel: SlackChannelId, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: Some(text.into()),
            blocks: None,
        }
    }

    /// Create a message rendering `text` as a code block.
    #[must_use]
    pub fn code_block(channel: SlackChannelId, text: &str) -> Self {
        Self {
            channel,
            text: Some(text.to_owned()),
            blocks: Some(vec![blocks::code_section(text)]),
        }
    }

    fn into_request(self) -> SlackApiChatPostMessageRequest {
        let content = SlackMessageContent {
            text: self.text,
            blocks: self.blocks,
            attachments: None,
            upload: None,
            files: None,
            reactions: None,
            metadata: None,
            markdown_text: None,
        };

        SlackApiChatPostMessageRequest {
            channel: self.channel,
            content,
            as_user: None,
            icon_emoji: None,
            icon_url: None,
            link_names: Some(true),
            parse: None,
            thread_ts: None,
            username: None,
            reply_broadcast: None,
            unfurl_links: None,
            unfurl_media: None,
        }
    }
}

/// Slack Web API and Socket Mode wrapper.
pub struct SlackService {
    client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
    bot_token: SlackApiToken,
    app_token: SlackApiToken,
}

impl SlackService {
    /// Create the Slack client. Socket Mode is started separately once the
    /// session that consumes its events exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the HTTPS connector cannot be created.
    pub fn connect(config: &SlackConfig) -> Result<Self> {
        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| AppError::Slack(format!("failed to init slack connector: {err}")))?;
        let client = Arc::new(SlackClient::new(connector));
        let bot_token = SlackApiToken {
            token_value: SlackApiTokenValue(config.bot_token.clone()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::Bot),
        };
        let app_token = SlackApiToken {
            token_value: SlackApiTokenValue(config.app_token.clone()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::App),
        };
        Ok(Self {
            client,
            bot_token,
            app_token,
        })
    }

    /// Listen for chat messages and hand them to `session`.
    #[must_use]
    pub fn start_socket_mode(&self, session: Arc<FrontendSession>) -> JoinHandle<()> {
        let listener_env = Arc::new(
            SlackClientEventsListenerEnvironment::new(Arc::clone(&self.client))
                .with_error_handler(|err, _client, _state| {
                    error!(?err, "socket mode error");
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                })
                .with_user_state(session),
        );
        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_hello_events(|event, _client, _state| async move {
                info!(?event, "socket hello");
            })
            .with_push_events(events::handle_push_event);
        let config = SlackClientSocketModeConfig {
            max_connections_count: SlackClientSocketModeConfig::DEFAULT_CONNECTIONS_COUNT,
            debug_connections: SlackClientSocketModeConfig::DEFAULT_DEBUG_CONNECTIONS,
            initial_backoff_in_seconds:
                SlackClientSocketModeConfig::DEFAULT_INITIAL_BACKOFF_IN_SECONDS,
            reconnect_timeout_in_seconds:
                SlackClientSocketModeConfig::DEFAULT_RECONNECT_TIMEOUT_IN_SECONDS,
            ping_interval_in_seconds: SlackClientSocketModeConfig::DEFAULT_PING_INTERVAL_IN_SECONDS,
            ping_failure_threshold_times:
                SlackClientSocketModeConfig::DEFAULT_PING_FAILURE_THRESHOLD_TIMES,
        };

        let listener = SlackClientSocketModeListener::new(&config, listener_env, callbacks);
        let app_token = self.app_token.clone();
        info!("slack socket mode starting");
        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                error!(?error, "socket mode listen failed");
                return;
            }

            listener.serve().await;
            info!("socket mode listener exited");
        })
    }

    /// Create an HTTP session for direct API calls using the bot token.
    #[must_use]
    pub fn http_session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.bot_token)
    }

    /// Post a message, retrying when Slack rate-limits us.
    ///
    /// Only HTTP 429 responses are retried, at most `MAX_POST_ATTEMPTS`
    /// attempts in total. Relay envelopes are never re-sent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` once the attempts are used up or on any
    /// other API failure.
    pub async fn post(&self, message: SlackMessage) -> Result<()> {
        let request = message.into_request();
        let mut backoff = INITIAL_RETRY_DELAY;
        let mut attempt = 1;
        loop {
            match self.http_session().chat_post_message(&request).await {
                Ok(_) => {
                    debug!(channel = %request.channel, "sent slack message");
                    return Ok(());
                }
                Err(SlackClientError::RateLimitError(rate)) => {
                    let Some(delay) = rate_limit_delay(attempt, rate.retry_after, backoff) else {
                        return Err(AppError::Slack(format!(
                            "still rate limited after {attempt} attempts"
                        )));
                    };
                    warn!(delay = ?delay, attempt, "slack rate limited; retrying");
                    sleep(delay).await;
                    backoff = (backoff * 2).min(MAX_RETRY_DELAY);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(AppError::Slack(format!("failed to post message: {err}")));
                }
            }
        }
    }

    /// Upload a file to a Slack channel using the external upload flow.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read and
    /// `AppError::Slack` if any upload step fails.
    pub async fn upload(&self, channel: SlackChannelId, path: &Path) -> Result<()> {
        let content = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map_or_else(|| "image.png".to_owned(), |name| name.to_string_lossy().into_owned());
        let session = self.http_session();

        let url_request =
            SlackApiFilesGetUploadUrlExternalRequest::new(filename.clone(), content.len());
        let url_response = session
            .get_upload_url_external(&url_request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to get upload url: {err}")))?;

        let http_client = reqwest::Client::new();
        http_client
            .post(url_response.upload_url.0.to_string())
            .body(content)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| AppError::Slack(format!("failed to upload file: {err}")))?;

        let file_ref = SlackApiFilesComplete {
            id: url_response.file_id,
            title: Some(filename),
        };
        let mut complete_request =
            SlackApiFilesCompleteUploadExternalRequest::new(vec![file_ref]);
        complete_request.channel_id = Some(channel);
        session
            .files_complete_upload_external(&complete_request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to complete upload: {err}")))?;

        Ok(())
    }
}

/// Wait before the next rate-limited attempt, or `None` once `attempt`
/// was the last one allowed. Slack's `Retry-After` wins over `backoff`.
fn rate_limit_delay(
    attempt: u32,
    retry_after: Option<Duration>,
    backoff: Duration,
) -> Option<Duration> {
    (attempt < MAX_POST_ATTEMPTS).then(|| retry_after.unwrap_or(backoff).min(MAX_RETRY_DELAY))
}

impl ChatSink for SlackService {
    fn post_text<'a>(&'a self, channel: &'a str, text: &'a str) -> SinkFuture<'a> {
        Box::pin(self.post(SlackMessage::plain(SlackChannelId::new(channel.to_owned()), text)))
    }

    fn post_code_block<'a>(&'a self, channel: &'a str, text: &'a str) -> SinkFuture<'a> {
        Box::pin(self.post(SlackMessage::code_block(
            SlackChannelId::new(channel.to_owned()),
            text,
        )))
    }

    fn upload_file<'a>(&'a self, channel: &'a str, path: &'a Path) -> SinkFuture<'a> {
        Box::pin(self.upload(SlackChannelId::new(channel.to_owned()), path))
    }
}
