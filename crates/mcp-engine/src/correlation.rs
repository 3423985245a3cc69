//! Server-initiated requests and their correlation with client replies.
//!
//! Every pending request owns one slot in its session's [`CorrelationTable`]. The
//! slot is removed under the table lock by whichever of reply, deadline or session
//! termination gets there first, and only the remover may complete the waiting
//! future. Anything arriving later finds no slot and is dropped.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};

use crate::{
    codec::Reply,
    error::CorrelationError,
    model::{
        CancelledNotificationParam, CapabilitySet, CreateElicitationRequestParam,
        CreateElicitationResult, CreateMessageRequestParam, CreateMessageResult, ElicitationAction,
        JsonObject, JsonRpcMessage, ListRootsResult, LoggingMessageNotificationParam,
        ProgressNotificationParam, RequestId, method,
    },
    notification::NotificationFanout,
    session::{Session, lock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Sample,
    Elicit,
    ListRoots,
}

impl RequestKind {
    pub fn method(self) -> &'static str {
        match self {
            RequestKind::Sample => method::CREATE_MESSAGE,
            RequestKind::Elicit => method::CREATE_ELICITATION,
            RequestKind::ListRoots => method::LIST_ROOTS,
        }
    }

    /// The client capability a session must have negotiated for this request.
    pub fn capability(self) -> CapabilitySet {
        match self {
            RequestKind::Sample => CapabilitySet::SAMPLING,
            RequestKind::Elicit => CapabilitySet::ELICITATION,
            RequestKind::ListRoots => CapabilitySet::ROOTS,
        }
    }

    fn capability_name(self) -> &'static str {
        match self {
            RequestKind::Sample => "sampling",
            RequestKind::Elicit => "elicitation",
            RequestKind::ListRoots => "roots",
        }
    }
}

type Completion = oneshot::Sender<Result<Value, CorrelationError>>;

#[derive(Debug)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub issued_at: Instant,
    pub deadline: Instant,
    completion: Completion,
}

#[derive(Debug, Default)]
struct TableInner {
    pending: HashMap<RequestId, PendingRequest>,
    closed: bool,
}

struct Registered {
    id: RequestId,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Value, CorrelationError>>,
}

/// Outstanding server-initiated requests of one session.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    inner: Mutex<TableInner>,
    next_id: AtomicI64,
}

impl CorrelationTable {
    fn register(
        &self,
        kind: RequestKind,
        timeout: Duration,
    ) -> Result<Registered, CorrelationError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(CorrelationError::cancelled("session terminated"));
        }
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (completion, rx) = oneshot::channel();
        let issued_at = Instant::now();
        inner.pending.insert(
            id.clone(),
            PendingRequest {
                kind,
                issued_at,
                deadline: issued_at + timeout,
                completion,
            },
        );
        Ok(Registered {
            id,
            deadline: issued_at + timeout,
            rx,
        })
    }

    fn take(&self, id: &RequestId) -> Option<PendingRequest> {
        lock(&self.inner).pending.remove(id)
    }

    /// Complete the request `reply` answers. `false` if nothing was waiting for it.
    pub(crate) fn resolve(&self, reply: Reply) -> bool {
        let Some(pending) = self.take(&reply.id) else {
            return false;
        };
        // the issuing future may already be gone; the slot is consumed either way
        let _ = pending
            .completion
            .send(reply.outcome.map_err(CorrelationError::Rejected));
        true
    }

    /// Reject everything pending and refuse new registrations.
    pub(crate) fn cancel_all(&self, reason: &'static str) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            inner.pending.drain().map(|(_, pending)| pending).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.completion.send(Err(CorrelationError::cancelled(reason)));
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drops the slot if the issuing future goes away before an outcome.
struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: &'a RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.take(self.id);
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    default_timeout: Duration,
}

impl CorrelationEngine {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `kind` to the client behind `session` and wait for its reply.
    ///
    /// Resolves exactly once: with the client's result, with
    /// [`CorrelationError::Rejected`] if it answered with an error, with
    /// [`CorrelationError::Timeout`] once the deadline passes, or with
    /// [`CorrelationError::Cancelled`] when the session terminates.
    pub async fn issue(
        &self,
        session: &Session,
        kind: RequestKind,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CorrelationError> {
        if !session.kind().supports_server_initiated() {
            return Err(CorrelationError::Unsupported);
        }
        if !session.capabilities().contains(kind.capability()) {
            return Err(CorrelationError::CapabilityMissing(kind.capability_name()));
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let table = session.correlations();
        let Registered { id, deadline, mut rx } = table.register(kind, timeout)?;
        let _guard = PendingGuard { table, id: &id };

        // the deadline covers waiting for room in the outbound queue as well
        let request = JsonRpcMessage::request(id.clone(), kind.method(), params);
        match tokio::time::timeout_at(deadline, session.send_server_initiated(request)).await {
            Ok(sent) => sent?,
            Err(_) => {
                tracing::warn!(
                    session_id = %session.id(),
                    correlation_id = %id,
                    method = kind.method(),
                    ?timeout,
                    "outbound queue stayed full until the deadline"
                );
                return Err(CorrelationError::Timeout {
                    method: kind.method(),
                    timeout,
                });
            }
        }
        tracing::debug!(
            session_id = %session.id(),
            correlation_id = %id,
            method = kind.method(),
            "server-initiated request sent"
        );

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CorrelationError::cancelled("correlation dropped")),
            Err(_) => {
                if table.take(&id).is_none() {
                    // a reply or a cancellation won the race against the deadline
                    return rx
                        .try_recv()
                        .unwrap_or_else(|_| Err(CorrelationError::cancelled("correlation dropped")));
                }
                tracing::warn!(
                    session_id = %session.id(),
                    correlation_id = %id,
                    method = kind.method(),
                    ?timeout,
                    "server-initiated request timed out"
                );
                let notice = CancelledNotificationParam {
                    request_id: id.clone(),
                    reason: Some("timeout".to_owned()),
                };
                let notice = JsonRpcMessage::notification(
                    method::CANCELLED,
                    serde_json::to_value(notice).ok(),
                );
                if let Err(error) = session.try_send_server_initiated(notice) {
                    tracing::debug!(session_id = %session.id(), %error, "cancellation notice not delivered");
                }
                Err(CorrelationError::Timeout {
                    method: kind.method(),
                    timeout,
                })
            }
        }
    }

    /// Hand a client reply to the request waiting for it.
    pub fn resolve(&self, session: &Session, reply: Reply) -> bool {
        let id = reply.id.clone();
        let matched = session.correlations().resolve(reply);
        if !matched {
            tracing::debug!(
                session_id = %session.id(),
                correlation_id = %id,
                "reply matches no pending request, dropped"
            );
        }
        matched
    }

    /// Reject every pending request of `session` with `Cancelled`. The session
    /// accepts no new requests afterwards.
    pub fn cancel_all(&self, session: &Session) -> usize {
        session.correlations().cancel_all("cancelled")
    }
}

/// Errors that can occur during typed elicitation operations
#[derive(Error, Debug)]
pub enum ElicitationError {
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// User declined to provide input or cancelled the request
    #[error("User declined or cancelled the request")]
    UserDeclined,

    /// The response data could not be parsed into the requested type
    #[error("Failed to parse response data: {error}\nReceived data: {data}")]
    ParseError {
        error: serde_json::Error,
        data: serde_json::Value,
    },

    /// No response content was provided by the user
    #[error("No response content provided")]
    NoContent,
}

/// The client at the other end of a session, as seen from inside a handler.
#[derive(Debug, Clone)]
pub struct Peer {
    session: Arc<Session>,
    correlation: CorrelationEngine,
    fanout: NotificationFanout,
}

impl Peer {
    pub(crate) fn new(
        session: Arc<Session>,
        correlation: CorrelationEngine,
        fanout: NotificationFanout,
    ) -> Self {
        Self {
            session,
            correlation,
            fanout,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn send_request(
        &self,
        kind: RequestKind,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CorrelationError> {
        self.correlation
            .issue(&self.session, kind, params, timeout)
            .await
    }

    async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        kind: RequestKind,
        params: Option<P>,
        timeout: Option<Duration>,
    ) -> Result<R, CorrelationError> {
        let params = params
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| CorrelationError::Encode(e.to_string()))?;
        let result = self.send_request(kind, params, timeout).await?;
        serde_json::from_value(result).map_err(|e| CorrelationError::UnexpectedResponse(e.to_string()))
    }

    pub async fn create_message(
        &self,
        params: CreateMessageRequestParam,
    ) -> Result<CreateMessageResult, CorrelationError> {
        self.request(RequestKind::Sample, Some(params), None).await
    }

    pub async fn create_message_with_timeout(
        &self,
        params: CreateMessageRequestParam,
        timeout: Duration,
    ) -> Result<CreateMessageResult, CorrelationError> {
        self.request(RequestKind::Sample, Some(params), Some(timeout))
            .await
    }

    pub async fn create_elicitation(
        &self,
        params: CreateElicitationRequestParam,
    ) -> Result<CreateElicitationResult, CorrelationError> {
        self.request(RequestKind::Elicit, Some(params), None).await
    }

    pub async fn list_roots(&self) -> Result<ListRootsResult, CorrelationError> {
        self.request(RequestKind::ListRoots, None::<()>, None).await
    }

    /// Request structured data from the user using a custom JSON schema.
    ///
    /// Returns `Ok(Some(data))` if the user accepted, `Ok(None)` if they declined
    /// or cancelled.
    pub async fn elicit_structured_input(
        &self,
        message: impl Into<String>,
        schema: &JsonObject,
    ) -> Result<Option<Value>, CorrelationError> {
        let response = self
            .create_elicitation(CreateElicitationRequestParam {
                message: message.into(),
                requested_schema: schema.clone(),
            })
            .await?;

        match response.action {
            ElicitationAction::Accept => Ok(response.content),
            _ => Ok(None),
        }
    }

    /// Request typed data from the user with a schema generated from `T`.
    ///
    /// # Returns
    /// * `Ok(Some(data))` if the user provided data that parses as `T`
    /// * `Err(ElicitationError::UserDeclined)` if the user declined or cancelled
    /// * `Err(ElicitationError::ParseError { .. })` if the data does not parse as `T`
    /// * `Err(ElicitationError::NoContent)` if the user accepted without content
    #[cfg(feature = "schemars")]
    pub async fn elicit<T>(&self, message: impl Into<String>) -> Result<Option<T>, ElicitationError>
    where
        T: schemars::JsonSchema + for<'de> serde::Deserialize<'de>,
    {
        let schema = schema_for_type::<T>().map_err(|e| CorrelationError::Encode(e.to_string()))?;

        let response = self
            .create_elicitation(CreateElicitationRequestParam {
                message: message.into(),
                requested_schema: schema,
            })
            .await?;

        match response.action {
            ElicitationAction::Accept => {
                if let Some(value) = response.content {
                    match serde_json::from_value::<T>(value.clone()) {
                        Ok(parsed) => Ok(Some(parsed)),
                        Err(error) => Err(ElicitationError::ParseError { error, data: value }),
                    }
                } else {
                    Err(ElicitationError::NoContent)
                }
            }
            _ => Err(ElicitationError::UserDeclined),
        }
    }

    pub async fn notify_progress(
        &self,
        params: ProgressNotificationParam,
    ) -> Result<(), CorrelationError> {
        self.fanout
            .notify_progress(
                &self.session,
                params.progress_token,
                params.progress,
                params.total,
                params.message,
            )
            .await
    }

    /// Returns `false` when the session's log level filtered the message out.
    pub async fn notify_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
    ) -> Result<bool, CorrelationError> {
        self.fanout.notify_logging_message(&self.session, params).await
    }
}

/// JSON schema (draft 2020-12) for `T`, as an object.
#[cfg(feature = "schemars")]
pub fn schema_for_type<T: schemars::JsonSchema>() -> Result<JsonObject, serde_json::Error> {
    let mut settings = schemars::generate::SchemaSettings::draft2020_12();
    settings.transforms = vec![Box::new(schemars::transform::AddNullable::default())];
    let schema = settings.into_generator().into_root_schema_for::<T>();
    match serde_json::to_value(schema)? {
        Value::Object(object) => Ok(object),
        other => Err(serde::de::Error::custom(format!(
            "schema is not an object: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        session::{TransportKind, test_session},
        transport::{Outbound, outbound_channel},
    };

    fn expect_request(outbound: Option<Outbound>) -> RequestId {
        match outbound {
            Some(Outbound::Message(JsonRpcMessage::Request(request))) => request.id,
            other => panic!("expected a server-initiated request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reply_resolves_the_pending_request() {
        let (tx, mut rx) = outbound_channel(8);
        let session = Arc::new(test_session(
            TransportKind::Stdio,
            CapabilitySet::SAMPLING,
            Some(tx),
        ));
        let engine = CorrelationEngine::new(Duration::from_secs(5));

        let waiter = {
            let session = session.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .issue(&session, RequestKind::Sample, Some(json!({"q": 1})), None)
                    .await
            })
        };

        let id = expect_request(rx.recv().await);
        assert_eq!(session.pending_correlations(), 1);
        let reply = Reply {
            id: id.clone(),
            outcome: Ok(json!({"a": 1})),
        };
        assert!(engine.resolve(&session, reply.clone()));
        assert!(!engine.resolve(&session, reply), "second reply is inert");

        assert_eq!(waiter.await.unwrap().unwrap(), json!({"a": 1}));
        assert_eq!(session.pending_correlations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_and_late_reply_is_dropped() {
        let (tx, mut rx) = outbound_channel(8);
        let session = test_session(TransportKind::Stdio, CapabilitySet::ROOTS, Some(tx));
        let engine = CorrelationEngine::new(Duration::from_secs(2));

        let started = Instant::now();
        let result = engine
            .issue(&session, RequestKind::ListRoots, None, None)
            .await;
        assert!(matches!(result, Err(CorrelationError::Timeout { .. })));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2100), "fired late: {elapsed:?}");

        let id = expect_request(rx.recv().await);
        match rx.recv().await {
            Some(Outbound::Message(JsonRpcMessage::Notification(n))) => {
                assert_eq!(n.method, method::CANCELLED);
                assert_eq!(n.params.unwrap()["reason"], "timeout");
            }
            other => panic!("expected a cancellation notice, got {other:?}"),
        }
        assert!(!engine.resolve(
            &session,
            Reply {
                id,
                outcome: Ok(json!({"roots": []}))
            }
        ));
    }

    #[tokio::test]
    async fn test_termination_cancels_pending_requests() {
        let (tx, mut rx) = outbound_channel(8);
        let session = Arc::new(test_session(
            TransportKind::Stdio,
            CapabilitySet::ELICITATION,
            Some(tx),
        ));
        let engine = CorrelationEngine::new(Duration::from_secs(60));

        let waiter = {
            let session = session.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .issue(&session, RequestKind::Elicit, None, None)
                    .await
            })
        };
        expect_request(rx.recv().await);

        assert_eq!(session.close(), Some(1));
        assert!(matches!(
            waiter.await.unwrap(),
            Err(CorrelationError::Cancelled { .. })
        ));
        assert!(matches!(
            engine.issue(&session, RequestKind::Elicit, None, None).await,
            Err(CorrelationError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn test_capability_and_transport_checks() {
        let session = test_session(TransportKind::Stdio, CapabilitySet::EMPTY, None);
        let engine = CorrelationEngine::new(Duration::from_secs(1));
        assert!(matches!(
            engine.issue(&session, RequestKind::Sample, None, None).await,
            Err(CorrelationError::CapabilityMissing("sampling"))
        ));

        let stateless = test_session(
            TransportKind::HttpStateless,
            CapabilitySet::SAMPLING,
            None,
        );
        assert!(matches!(
            engine.issue(&stateless, RequestKind::Sample, None, None).await,
            Err(CorrelationError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn test_dropped_issuer_frees_its_slot() {
        let (tx, mut rx) = outbound_channel(8);
        let session = Arc::new(test_session(
            TransportKind::Stdio,
            CapabilitySet::SAMPLING,
            Some(tx),
        ));
        let engine = CorrelationEngine::new(Duration::from_secs(60));
        let task = {
            let session = session.clone();
            tokio::spawn(async move {
                engine.issue(&session, RequestKind::Sample, None, None).await
            })
        };
        expect_request(rx.recv().await);
        task.abort();
        let _ = task.await;
        assert_eq!(session.pending_correlations(), 0);
    }

    #[tokio::test]
    async fn test_client_error_reply_is_rejected() {
        let (tx, mut rx) = outbound_channel(8);
        let session = Arc::new(test_session(
            TransportKind::Stdio,
            CapabilitySet::SAMPLING,
            Some(tx),
        ));
        let engine = CorrelationEngine::new(Duration::from_secs(5));
        let waiter = {
            let session = session.clone();
            let engine = engine.clone();
            tokio::spawn(async move { engine.issue(&session, RequestKind::Sample, None, None).await })
        };
        let id = expect_request(rx.recv().await);
        engine.resolve(
            &session,
            Reply {
                id,
                outcome: Err(crate::model::ErrorData::invalid_request("user refused", None)),
            },
        );
        match waiter.await.unwrap() {
            Err(CorrelationError::Rejected(error)) => assert_eq!(error.message, "user refused"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
