use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    correlation::CorrelationTable,
    error::CorrelationError,
    handler::Principal,
    model::{CapabilitySet, JsonRpcMessage, LoggingLevel, ProtocolVersion, RequestId},
    transport::{Outbound, OutboundSender},
};

mod store;
pub use store::SessionStore;

/// Acquire a std mutex, recovering the guard if a panicking holder poisoned it.
///
/// Every critical section in this crate leaves the protected data consistent, so a
/// poisoned lock carries no broken invariant.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stdio,
    HttpStateful,
    /// One ephemeral session per request. No server-initiated traffic.
    HttpStateless,
}

impl TransportKind {
    pub fn supports_server_initiated(self) -> bool {
        !matches!(self, TransportKind::HttpStateless)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Terminating,
    Closed,
}

/// Everything fixed at handshake time.
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub kind: TransportKind,
    pub capabilities: CapabilitySet,
    pub protocol_version: ProtocolVersion,
    pub principal: Option<Principal>,
    pub outbound: Option<OutboundSender>,
}

/// One logical client connection.
pub struct Session {
    id: SessionId,
    kind: TransportKind,
    capabilities: CapabilitySet,
    protocol_version: ProtocolVersion,
    principal: Option<Principal>,
    outbound: Option<OutboundSender>,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    subscriptions: Mutex<HashSet<String>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    log_level: Mutex<Option<LoggingLevel>>,
    correlations: CorrelationTable,
    ct: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(id: SessionId, init: SessionInit) -> Self {
        Self {
            id,
            kind: init.kind,
            capabilities: init.capabilities,
            protocol_version: init.protocol_version,
            principal: init.principal,
            outbound: init.outbound,
            state: Mutex::new(SessionState::Initializing),
            last_activity: Mutex::new(Instant::now()),
            subscriptions: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            log_level: Mutex::new(None),
            correlations: CorrelationTable::default(),
            ct: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn protocol_version(&self) -> &ProtocolVersion {
        &self.protocol_version
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Terminating | SessionState::Closed
        )
    }

    /// Initializing -> Active. Any other state is left alone.
    pub(crate) fn mark_active(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == SessionState::Initializing {
            *state = SessionState::Active;
            true
        } else {
            false
        }
    }

    pub fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Cancelled when the session closes. Handler tokens are children of it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.ct
    }

    pub(crate) fn correlations(&self) -> &CorrelationTable {
        &self.correlations
    }

    pub fn pending_correlations(&self) -> usize {
        self.correlations.len()
    }

    pub(crate) fn subscribe(&self, uri: &str) -> bool {
        lock(&self.subscriptions).insert(uri.to_owned())
    }

    pub(crate) fn unsubscribe(&self, uri: &str) -> bool {
        lock(&self.subscriptions).remove(uri)
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        lock(&self.subscriptions).contains(uri)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).iter().cloned().collect()
    }

    pub(crate) fn set_log_level(&self, level: LoggingLevel) {
        *lock(&self.log_level) = Some(level);
    }

    /// Messages below the level set through `logging/setLevel` are not delivered.
    /// Everything passes until the client picks a level.
    pub fn accepts_log_level(&self, level: LoggingLevel) -> bool {
        lock(&self.log_level).is_none_or(|min| level >= min)
    }

    /// Track a client request so `notifications/cancelled` can reach it.
    pub(crate) fn begin_request(&self, id: RequestId) -> CancellationToken {
        let ct = self.ct.child_token();
        lock(&self.in_flight).insert(id, ct.clone());
        ct
    }

    pub(crate) fn end_request(&self, id: &RequestId) {
        lock(&self.in_flight).remove(id);
    }

    pub(crate) fn cancel_request(&self, id: &RequestId) -> bool {
        match lock(&self.in_flight).remove(id) {
            Some(ct) => {
                ct.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn outbound(&self) -> Result<&OutboundSender, CorrelationError> {
        if !self.kind.supports_server_initiated() {
            return Err(CorrelationError::Unsupported);
        }
        if self.is_closed() {
            return Err(CorrelationError::cancelled("session closed"));
        }
        self.outbound.as_ref().ok_or(CorrelationError::Delivery)
    }

    /// Queue a server-initiated message, waiting for room in the outbound buffer.
    ///
    /// Gives up with `Cancelled` as soon as the session closes. Callers that need a
    /// deadline wrap this in a timeout.
    pub async fn send_server_initiated(
        &self,
        message: JsonRpcMessage,
    ) -> Result<(), CorrelationError> {
        let outbound = self.outbound()?;
        tokio::select! {
            biased;
            _ = self.ct.cancelled() => Err(CorrelationError::cancelled("session terminated")),
            sent = outbound.send(Outbound::Message(message)) => {
                sent.map_err(|_| CorrelationError::Delivery)?;
                self.touch();
                Ok(())
            }
        }
    }

    /// Queue a server-initiated message without waiting. Fails when the buffer is full.
    pub fn try_send_server_initiated(
        &self,
        message: JsonRpcMessage,
    ) -> Result<(), CorrelationError> {
        self.outbound()?
            .try_send(Outbound::Message(message))
            .map_err(|_| CorrelationError::Delivery)?;
        self.touch();
        Ok(())
    }

    /// Waiting on the client: a server-initiated request or a client call is in flight.
    pub fn is_busy(&self) -> bool {
        !self.correlations.is_empty() || !lock(&self.in_flight).is_empty()
    }

    /// Tear down all per-session state. Returns the number of correlations rejected.
    ///
    /// Idempotent: only the first call does any work.
    pub(crate) fn close(&self) -> Option<usize> {
        {
            let mut state = lock(&self.state);
            if matches!(*state, SessionState::Terminating | SessionState::Closed) {
                return None;
            }
            *state = SessionState::Terminating;
        }
        let rejected = self.correlations.cancel_all("session terminated");
        lock(&self.subscriptions).clear();
        lock(&self.in_flight).clear();
        self.ct.cancel();
        *lock(&self.state) = SessionState::Closed;
        Some(rejected)
    }
}

#[cfg(test)]
pub(crate) fn test_session(
    kind: TransportKind,
    capabilities: CapabilitySet,
    outbound: Option<OutboundSender>,
) -> Session {
    Session::new(
        SessionId::random(),
        SessionInit {
            kind,
            capabilities,
            protocol_version: ProtocolVersion::LATEST,
            principal: None,
            outbound,
        },
    )
}
