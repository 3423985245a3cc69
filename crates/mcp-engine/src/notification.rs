use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    error::CorrelationError,
    model::{
        CapabilitySet, JsonRpcMessage, LoggingMessageNotificationParam, ProgressNotificationParam,
        ProgressToken, ResourceUpdatedNotificationParam, method,
    },
    session::{Session, SessionStore},
};

fn notification<P: Serialize>(method: &str, params: Option<P>) -> Result<JsonRpcMessage, CorrelationError> {
    let params = params
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| CorrelationError::Encode(e.to_string()))?;
    Ok(JsonRpcMessage::notification(method, params))
}

/// Routes progress, resource and log notifications to session outbound channels.
///
/// Broadcasts are best-effort: a subscriber whose queue is full or closed is
/// skipped with a warning and never holds up the others.
///
/// Per-session notifications (progress, log messages) wait for room in the
/// outbound queue, but never longer than the send timeout.
#[derive(Debug, Clone)]
pub struct NotificationFanout {
    store: Arc<SessionStore>,
    send_timeout: Duration,
}

impl NotificationFanout {
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    async fn deliver(&self, session: &Session, message: JsonRpcMessage) -> Result<(), CorrelationError> {
        match tokio::time::timeout(self.send_timeout, session.send_server_initiated(message)).await {
            Ok(sent) => sent,
            Err(_) => {
                tracing::warn!(
                    session_id = %session.id(),
                    timeout = ?self.send_timeout,
                    "outbound queue full, notification not delivered"
                );
                Err(CorrelationError::Delivery)
            }
        }
    }

    fn check_subscriptions(session: &Session) -> Result<(), CorrelationError> {
        if !session.kind().supports_server_initiated() {
            return Err(CorrelationError::Unsupported);
        }
        if !session.capabilities().contains(CapabilitySet::SUBSCRIPTIONS) {
            return Err(CorrelationError::CapabilityMissing("subscriptions"));
        }
        Ok(())
    }

    /// Returns `false` if the session was already subscribed to `uri`.
    pub fn subscribe(&self, session: &Session, uri: &str) -> Result<bool, CorrelationError> {
        Self::check_subscriptions(session)?;
        let added = session.subscribe(uri);
        tracing::debug!(session_id = %session.id(), uri, added, "subscribe");
        Ok(added)
    }

    pub fn unsubscribe(&self, session: &Session, uri: &str) -> Result<bool, CorrelationError> {
        Self::check_subscriptions(session)?;
        let removed = session.unsubscribe(uri);
        tracing::debug!(session_id = %session.id(), uri, removed, "unsubscribe");
        Ok(removed)
    }

    /// Deliver one progress event. `message` is forwarded untouched.
    pub async fn notify_progress(
        &self,
        session: &Session,
        progress_token: ProgressToken,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), CorrelationError> {
        let message = notification(
            method::PROGRESS,
            Some(ProgressNotificationParam {
                progress_token,
                progress,
                total,
                message,
            }),
        )?;
        self.deliver(session, message).await
    }

    /// Push `notifications/resources/updated` to every session subscribed to `uri`.
    /// Returns how many sessions it reached.
    pub fn notify_resource_updated(&self, uri: &str) -> usize {
        let message = match notification(
            method::RESOURCE_UPDATED,
            Some(ResourceUpdatedNotificationParam {
                uri: uri.to_owned(),
            }),
        ) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(uri, %error, "failed to build resource update");
                return 0;
            }
        };
        self.broadcast(&message, |session| session.is_subscribed(uri))
    }

    pub fn notify_resource_list_changed(&self) -> usize {
        self.broadcast(
            &JsonRpcMessage::notification(method::RESOURCE_LIST_CHANGED, None),
            |_| true,
        )
    }

    pub fn notify_tool_list_changed(&self) -> usize {
        self.broadcast(
            &JsonRpcMessage::notification(method::TOOL_LIST_CHANGED, None),
            |_| true,
        )
    }

    pub fn notify_prompt_list_changed(&self) -> usize {
        self.broadcast(
            &JsonRpcMessage::notification(method::PROMPT_LIST_CHANGED, None),
            |_| true,
        )
    }

    /// Returns `Ok(false)` when the session's log level filtered the message out.
    pub async fn notify_logging_message(
        &self,
        session: &Session,
        params: LoggingMessageNotificationParam,
    ) -> Result<bool, CorrelationError> {
        if !session.accepts_log_level(params.level) {
            return Ok(false);
        }
        let message = notification(method::LOGGING_MESSAGE, Some(params))?;
        self.deliver(session, message).await?;
        Ok(true)
    }

    fn broadcast(&self, message: &JsonRpcMessage, filter: impl Fn(&Session) -> bool) -> usize {
        let mut delivered = 0;
        for session in self.store.sessions() {
            if !filter(&session) {
                continue;
            }
            match session.try_send_server_initiated(message.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::warn!(
                        session_id = %session.id(),
                        method = message.method().unwrap_or_default(),
                        %error,
                        "notification not delivered"
                    );
                }
            }
        }
        delivered
    }
}
