use std::sync::Arc;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{self, BatchResult, Call, InboundItem},
    config::EngineConfig,
    correlation::{CorrelationEngine, Peer},
    dispatch::Dispatcher,
    error::{EngineError, SessionError},
    handler::{AllowAll, HandlerRegistry, PermissionCheck, Principal, RequestContext},
    model::{
        CancelledNotificationParam, CapabilitySet, ErrorData, Implementation,
        InitializeRequestParam, InitializeResult, JsonRpcMessage, ProtocolVersion,
        ServerCapabilities, SetLevelRequestParam, SubscribeRequestParam, method,
    },
    notification::NotificationFanout,
    session::{Session, SessionInit, SessionStore, TransportKind},
    transport::OutboundSender,
};

/// Methods answered by the engine itself. Registry entries with these names are ignored.
pub const BUILTIN_METHODS: [&str; 6] = [
    method::PING,
    method::SUBSCRIBE,
    method::UNSUBSCRIBE,
    method::SET_LEVEL,
    method::INITIALIZED,
    method::CANCELLED,
];

struct EngineInner {
    store: Arc<SessionStore>,
    dispatcher: Dispatcher,
    correlation: CorrelationEngine,
    fanout: NotificationFanout,
    config: EngineConfig,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    ct: CancellationToken,
}

/// The protocol engine: session lifecycle plus routing of inbound transmissions.
///
/// Cheap to clone; clones share sessions and handlers.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("server_info", &self.inner.server_info)
            .field("sessions", &self.inner.store.len())
            .field("dispatcher", &self.inner.dispatcher)
            .finish_non_exhaustive()
    }
}

pub struct EngineBuilder {
    registry: HandlerRegistry,
    permission: Arc<dyn PermissionCheck>,
    config: EngineConfig,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            registry: HandlerRegistry::default(),
            permission: Arc::new(AllowAll),
            config: EngineConfig::default(),
            server_info: Implementation::default(),
            capabilities: ServerCapabilities::default(),
            instructions: None,
        }
    }
}

impl EngineBuilder {
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn permission(mut self, permission: impl PermissionCheck) -> Self {
        self.permission = Arc::new(permission);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn server_info(mut self, server_info: Implementation) -> Self {
        self.server_info = server_info;
        self
    }

    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn build(self) -> Engine {
        let store = Arc::new(SessionStore::new());
        let correlation = CorrelationEngine::new(self.config.request_timeout);
        let fanout =
            NotificationFanout::new(store.clone()).with_send_timeout(self.config.request_timeout);

        let mut registry = self.registry;
        for name in BUILTIN_METHODS {
            if registry.contains(name) {
                tracing::warn!(method = name, "handler shadows a built-in method and is ignored");
            }
        }
        install_builtins(&mut registry, &fanout);

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            self.permission,
            &self.config,
            correlation.clone(),
            fanout.clone(),
        );
        Engine {
            inner: Arc::new(EngineInner {
                store,
                dispatcher,
                correlation,
                fanout,
                config: self.config,
                server_info: self.server_info,
                capabilities: self.capabilities,
                instructions: self.instructions,
                ct: CancellationToken::new(),
            }),
        }
    }
}

fn install_builtins(registry: &mut HandlerRegistry, fanout: &NotificationFanout) {
    registry.register(method::PING, |_: Option<Value>, _: RequestContext| async {
        Ok::<_, ErrorData>(json!({}))
    });

    let subscribe = fanout.clone();
    let unsubscribe = fanout.clone();
    let typed = std::mem::take(registry)
        .with_typed(
            method::SUBSCRIBE,
            move |params: SubscribeRequestParam, context: RequestContext| {
                let fanout = subscribe.clone();
                async move {
                    fanout.subscribe(context.session(), &params.uri)?;
                    Ok::<_, ErrorData>(json!({}))
                }
            },
        )
        .with_typed(
            method::UNSUBSCRIBE,
            move |params: SubscribeRequestParam, context: RequestContext| {
                let fanout = unsubscribe.clone();
                async move {
                    fanout.unsubscribe(context.session(), &params.uri)?;
                    Ok::<_, ErrorData>(json!({}))
                }
            },
        )
        .with_typed(
            method::SET_LEVEL,
            |params: SetLevelRequestParam, context: RequestContext| async move {
                context.session().set_log_level(params.level);
                Ok::<_, ErrorData>(json!({}))
            },
        )
        .with_handler(method::INITIALIZED, |_, context| async move {
            if context.session().mark_active() {
                tracing::debug!(session_id = %context.session().id(), "client initialized");
            }
            Ok::<_, ErrorData>(Value::Null)
        })
        .with_typed(
            method::CANCELLED,
            |params: CancelledNotificationParam, context: RequestContext| async move {
                let cancelled = context.session().cancel_request(&params.request_id);
                tracing::debug!(
                    session_id = %context.session().id(),
                    request_id = %params.request_id,
                    reason = ?params.reason,
                    cancelled,
                    "client cancelled request"
                );
                Ok::<_, ErrorData>(Value::Null)
            },
        );
    *registry = typed;
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    pub fn fanout(&self) -> &NotificationFanout {
        &self.inner.fanout
    }

    pub fn correlation(&self) -> &CorrelationEngine {
        &self.inner.correlation
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn server_info(&self) -> &Implementation {
        &self.inner.server_info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.inner.capabilities
    }

    /// Cancelled by [`Engine::shutdown`].
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.ct
    }

    /// Run the handshake for `call` and open a session.
    ///
    /// Stateless sessions are created but never stored.
    pub fn initialize(
        &self,
        kind: TransportKind,
        call: &Call,
        outbound: Option<OutboundSender>,
        principal: Option<Principal>,
    ) -> Result<(Arc<Session>, JsonRpcMessage), EngineError> {
        let Some(id) = call.id.clone() else {
            return Err(EngineError::InitializeFailed(ErrorData::invalid_request(
                "initialize must be a request",
                None,
            )));
        };
        let params: InitializeRequestParam =
            serde_json::from_value(call.params.clone().unwrap_or(Value::Null)).map_err(|e| {
                EngineError::InitializeFailed(ErrorData::invalid_params(e.to_string(), None))
            })?;

        let protocol_version = ProtocolVersion::negotiate(&params.protocol_version);
        let capabilities = CapabilitySet::from_client(&params.capabilities)
            | CapabilitySet::from_server(&self.inner.capabilities);
        let init = SessionInit {
            kind,
            capabilities,
            protocol_version: protocol_version.clone(),
            principal,
            outbound,
        };
        let session = match kind {
            TransportKind::HttpStateless => self.inner.store.ephemeral(init),
            _ => self.inner.store.create(init),
        };
        tracing::info!(
            session_id = %session.id(),
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol_version = protocol_version.as_str(),
            "initialize"
        );

        let result = InitializeResult {
            protocol_version,
            capabilities: self.inner.capabilities.clone(),
            server_info: self.inner.server_info.clone(),
            instructions: self.inner.instructions.clone(),
        };
        let result = serde_json::to_value(result)
            .map_err(|e| EngineError::InitializeFailed(ErrorData::internal_error(e.to_string(), None)))?;
        Ok((session, JsonRpcMessage::response(id, result)))
    }

    /// Dispatch one decoded transmission on an established session.
    pub async fn handle(
        &self,
        session: &Arc<Session>,
        envelope: codec::BatchEnvelope,
    ) -> Result<BatchResult, EngineError> {
        if session.is_closed() {
            return Err(SessionError::Closed(session.id().to_string()).into());
        }
        session.touch();
        let regular_call = envelope.items.iter().any(|item| {
            matches!(item, InboundItem::Call(call)
                if call.method != method::INITIALIZE && call.method != method::INITIALIZED)
        });
        if regular_call {
            session.mark_active();
        }
        self.inner.dispatcher.dispatch(session, envelope).await
    }

    pub async fn handle_bytes(
        &self,
        session: &Arc<Session>,
        bytes: &[u8],
    ) -> Result<BatchResult, EngineError> {
        let envelope = codec::decode(bytes)?;
        self.handle(session, envelope).await
    }

    /// A handle for talking to the client of `session` outside of any handler.
    pub fn peer(&self, session: Arc<Session>) -> Peer {
        Peer::new(
            session,
            self.inner.correlation.clone(),
            self.inner.fanout.clone(),
        )
    }

    /// Remove the session and reject its pending correlations before returning.
    pub fn terminate(&self, session_id: &str) -> bool {
        self.inner.store.terminate(session_id)
    }

    /// Start the idle reaper if an idle timeout is configured. Needs a running
    /// tokio runtime; returns `None` otherwise.
    pub fn spawn_reaper(&self) -> Option<JoinHandle<()>> {
        let idle_timeout = self.inner.config.idle_timeout?;
        tokio::runtime::Handle::try_current().ok()?;
        Some(self.inner.store.spawn_reaper(
            idle_timeout,
            self.inner.config.reap_interval,
            self.inner.ct.child_token(),
        ))
    }

    /// Terminate every session and stop background tasks.
    pub fn shutdown(&self) {
        self.inner.ct.cancel();
        for session in self.inner.store.sessions() {
            self.inner.store.terminate(session.id().as_str());
        }
    }
}

/// Encode the outcome of a transmission. Transmission-level errors become a single
/// error object with a null id.
pub fn encode_outcome(outcome: Result<BatchResult, EngineError>) -> Option<Vec<u8>> {
    let result = outcome.unwrap_or_else(|error| BatchResult::rejected(error.to_error_data()));
    match codec::encode(&result) {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::error!(%error, "failed to encode response");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        codec::decode_value,
        model::{ErrorCode, RequestId},
    };

    fn initialize_call(capabilities: Value) -> Call {
        Call {
            id: Some(RequestId::Number(0)),
            method: method::INITIALIZE.to_owned(),
            params: Some(json!({
                "protocolVersion": "2025-03-26",
                "capabilities": capabilities,
                "clientInfo": {"name": "test", "version": "0.0.1"}
            })),
        }
    }

    #[test]
    fn test_initialize_negotiates_capabilities() {
        let engine = Engine::builder()
            .capabilities(
                ServerCapabilities::builder()
                    .enable_resources_subscribe()
                    .build(),
            )
            .build();
        let (session, response) = engine
            .initialize(
                TransportKind::HttpStateful,
                &initialize_call(json!({"sampling": {}})),
                None,
                None,
            )
            .unwrap();

        assert!(session.capabilities().contains(CapabilitySet::SAMPLING));
        assert!(session.capabilities().contains(CapabilitySet::SUBSCRIPTIONS));
        assert!(!session.capabilities().contains(CapabilitySet::ROOTS));
        assert_eq!(session.protocol_version(), &ProtocolVersion::V_2025_03_26);
        assert!(engine.store().contains(session.id().as_str()));

        let JsonRpcMessage::Response(response) = response else {
            panic!("expected a response");
        };
        assert_eq!(response.result["protocolVersion"], "2025-03-26");
        assert_eq!(response.result["capabilities"]["resources"]["subscribe"], true);
    }

    #[test]
    fn test_initialize_rejects_bad_params() {
        let engine = Engine::builder().build();
        let call = Call {
            id: Some(RequestId::Number(0)),
            method: method::INITIALIZE.to_owned(),
            params: Some(json!({"capabilities": {}})),
        };
        let error = engine
            .initialize(TransportKind::Stdio, &call, None, None)
            .unwrap_err();
        assert_eq!(error.to_error_data().code, ErrorCode::INVALID_PARAMS);
        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_builtins_cannot_be_shadowed() {
        let registry = HandlerRegistry::new().with_handler(method::PING, |_, _| async {
            Ok::<_, ErrorData>(json!("shadowed"))
        });
        let engine = Engine::builder().registry(registry).build();
        let (session, _) = engine
            .initialize(TransportKind::HttpStateful, &initialize_call(json!({})), None, None)
            .unwrap();
        let result = engine
            .handle(
                &session,
                decode_value(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            result.responses,
            vec![JsonRpcMessage::response(RequestId::Number(1), json!({}))]
        );
    }

    #[tokio::test]
    async fn test_closed_session_is_unauthorized() {
        let engine = Engine::builder().build();
        let (session, _) = engine
            .initialize(TransportKind::HttpStateful, &initialize_call(json!({})), None, None)
            .unwrap();
        assert!(engine.terminate(session.id().as_str()));
        let error = engine
            .handle_bytes(&session, br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::Unauthorized(SessionError::Closed(_))));
    }

    #[test]
    fn test_encode_outcome_for_transmission_errors() {
        let bytes = encode_outcome(Err(EngineError::AdmissionRejected { size: 3, max: 2 })).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], ErrorCode::ADMISSION_REJECTED.0);
    }
}
