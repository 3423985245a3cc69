use std::{
    convert::Infallible,
    sync::{Arc, Weak},
    time::Duration,
};

use axum::{
    Router,
    extract::{DefaultBodyLimit, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use http::{HeaderValue, StatusCode, header, request::Parts};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{
    OutboundReceiver,
    http_header::{EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, HEADER_X_ACCEL_BUFFERING, JSON_MIME_TYPE},
    outbound_channel,
};
use crate::{
    codec::{self, Call, MAX_FRAME_LENGTH},
    engine::{Engine, encode_outcome},
    error::{EngineError, SessionError},
    handler::Principal,
    model::{CapabilitySet, ProtocolVersion},
    session::{Session, SessionId, SessionInit, TransportKind},
};

#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    /// The ping message duration for SSE connections.
    pub sse_keep_alive: Option<Duration>,
    /// If true, the server keeps sessions between requests and opens the `GET`
    /// event stream. Otherwise every request gets a throwaway session.
    pub stateful_mode: bool,
    pub max_body_bytes: usize,
    /// Cancel to end every open event stream.
    pub cancellation_token: CancellationToken,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            stateful_mode: true,
            max_body_bytes: MAX_FRAME_LENGTH,
            cancellation_token: CancellationToken::new(),
        }
    }
}

type StreamSlot = Arc<Mutex<OutboundReceiver>>;

struct ServiceInner {
    engine: Engine,
    config: StreamableHttpServerConfig,
    /// Outbound queue of every stateful session, drained by its `GET` stream.
    streams: DashMap<SessionId, StreamSlot>,
}

/// Streamable HTTP endpoint serving an [`Engine`] on `POST`, `GET` and `DELETE /`.
#[derive(Clone)]
pub struct StreamableHttpService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for StreamableHttpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpService")
            .field("config", &self.inner.config)
            .field("streams", &self.inner.streams.len())
            .finish_non_exhaustive()
    }
}

impl StreamableHttpService {
    pub fn new(engine: Engine, config: StreamableHttpServerConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                engine,
                config,
                streams: DashMap::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn config(&self) -> &StreamableHttpServerConfig {
        &self.inner.config
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/",
                get(handle_get).post(handle_post).delete(handle_delete),
            )
            .layer(DefaultBodyLimit::max(self.inner.config.max_body_bytes))
            .with_state(self.clone())
    }

    fn session_from(&self, parts: &Parts) -> Result<Arc<Session>, SessionError> {
        let session_id = parts
            .headers
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .ok_or(SessionError::MissingId)?;
        let session = self.inner.engine.store().get(session_id)?;
        if let Some(bound) = session.principal() {
            if parts.extensions.get::<Principal>() != Some(bound) {
                return Err(SessionError::PrincipalMismatch);
            }
        }
        Ok(session)
    }

    fn initialize(&self, call: &Call, principal: Option<Principal>) -> Response {
        let engine = &self.inner.engine;
        if !self.inner.config.stateful_mode {
            return match engine.initialize(TransportKind::HttpStateless, call, None, principal) {
                Ok((session, message)) => {
                    session.close();
                    match codec::encode_message(&message) {
                        Ok(body) => json_response(StatusCode::OK, body),
                        Err(e) => internal_error(e),
                    }
                }
                Err(error) => error_response(error),
            };
        }

        let (tx, rx) = outbound_channel(engine.config().outbound_buffer);
        let (session, message) =
            match engine.initialize(TransportKind::HttpStateful, call, Some(tx), principal) {
                Ok(established) => established,
                Err(error) => return error_response(error),
            };
        self.inner
            .streams
            .insert(session.id().clone(), Arc::new(Mutex::new(rx)));
        self.release_stream_on_close(&session);
        let body = match codec::encode_message(&message) {
            Ok(body) => body,
            Err(e) => return internal_error(e),
        };
        let mut response = json_response(StatusCode::OK, body);
        match HeaderValue::from_str(session.id().as_str()) {
            Ok(value) => {
                response.headers_mut().insert(HEADER_SESSION_ID, value);
            }
            Err(e) => {
                tracing::error!(session_id = %session.id(), error = %e, "session id is not a valid header value");
            }
        }
        response
    }

    /// Drops the session's queued outbound messages once it terminates, whether
    /// by `DELETE`, the reaper or an explicit [`Engine::terminate`].
    fn release_stream_on_close(&self, session: &Session) {
        let inner: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        let closed = session.cancellation_token().clone().cancelled_owned();
        let id = session.id().clone();
        tokio::spawn(async move {
            closed.await;
            if let Some(inner) = inner.upgrade() {
                if inner.streams.remove(&id).is_some() {
                    tracing::debug!(session_id = %id, "event stream queue released");
                }
            }
        });
    }

    /// A session for one stateless request. It is never stored and has no
    /// outbound channel.
    fn ephemeral_session(&self, principal: Option<Principal>) -> Arc<Session> {
        let engine = &self.inner.engine;
        engine.store().ephemeral(SessionInit {
            kind: TransportKind::HttpStateless,
            capabilities: CapabilitySet::from_server(engine.capabilities()),
            protocol_version: ProtocolVersion::LATEST,
            principal,
            outbound: None,
        })
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, JSON_MIME_TYPE)], body).into_response()
}

fn internal_error(error: impl std::fmt::Display) -> Response {
    tracing::error!(%error, "failed to encode response");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

fn error_response(error: EngineError) -> Response {
    let status = match &error {
        EngineError::MalformedEnvelope(_)
        | EngineError::AlreadyInitialized
        | EngineError::InitializeFailed(_) => StatusCode::BAD_REQUEST,
        EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        EngineError::AdmissionRejected { .. } => StatusCode::PAYLOAD_TOO_LARGE,
    };
    json_response(status, encode_outcome(Err(error)).unwrap_or_default())
}

async fn handle_post(
    State(service): State<StreamableHttpService>,
    parts: Parts,
    body: Bytes,
) -> Response {
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok());
    if !content_type.is_some_and(|h| h.starts_with(JSON_MIME_TYPE)) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Media Type: Content-Type must be application/json",
        )
            .into_response();
    }

    let envelope = match codec::decode(&body) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::debug!(%error, "malformed POST body");
            return error_response(error.into());
        }
    };
    let principal = parts.extensions.get::<Principal>().cloned();
    if let Some(call) = envelope.as_initialize() {
        return service.initialize(call, principal);
    }

    let stateful = service.inner.config.stateful_mode;
    let session = if stateful {
        match service.session_from(&parts) {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(%error, "POST rejected");
                return error_response(error.into());
            }
        }
    } else {
        service.ephemeral_session(principal)
    };

    let outcome = service.inner.engine.handle(&session, envelope).await;
    if !stateful {
        session.close();
    }
    let result = match outcome {
        Ok(result) => result,
        Err(error) => return error_response(error),
    };
    match codec::encode(&result) {
        Ok(Some(body)) => json_response(StatusCode::OK, body),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_get(State(service): State<StreamableHttpService>, parts: Parts) -> Response {
    if !service.inner.config.stateful_mode {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed: no event stream in stateless mode",
        )
            .into_response();
    }
    let accept = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|h| h.to_str().ok());
    if !accept.is_some_and(|h| h.contains(EVENT_STREAM_MIME_TYPE)) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: Client must accept text/event-stream",
        )
            .into_response();
    }
    let session = match service.session_from(&parts) {
        Ok(session) => session,
        Err(error) => {
            tracing::warn!(%error, "GET rejected");
            return error_response(error.into());
        }
    };
    let Some(slot) = service
        .inner
        .streams
        .get(session.id())
        .map(|entry| entry.value().clone())
    else {
        return error_response(SessionError::NotFound(session.id().to_string()).into());
    };
    tracing::debug!(session_id = %session.id(), "event stream opened");

    // a second stream on the same session waits here until the first one drops
    let stream = futures::stream::once(slot.lock_owned())
        .flat_map(|receiver| {
            futures::stream::unfold(receiver, |mut receiver| async move {
                let outbound = receiver.recv().await?;
                Some((outbound, receiver))
            })
        })
        .filter_map(|outbound| async move {
            match outbound.encode() {
                Ok(frame) => Some(Ok::<_, Infallible>(
                    Event::default().data(String::from_utf8_lossy(&frame)),
                )),
                Err(error) => {
                    tracing::error!(%error, "failed to encode outbound message");
                    None
                }
            }
        })
        .take_until(session.cancellation_token().clone().cancelled_owned())
        .take_until(service.inner.config.cancellation_token.clone().cancelled_owned());

    let mut response = match service.inner.config.sse_keep_alive {
        Some(interval) => Sse::new(stream)
            .keep_alive(KeepAlive::new().interval(interval))
            .into_response(),
        None => Sse::new(stream).into_response(),
    };
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(HEADER_X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}

async fn handle_delete(State(service): State<StreamableHttpService>, parts: Parts) -> Response {
    if !service.inner.config.stateful_mode {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method Not Allowed: no sessions in stateless mode",
        )
            .into_response();
    }
    let session = match service.session_from(&parts) {
        Ok(session) => session,
        Err(error) => {
            tracing::warn!(%error, "DELETE rejected");
            return error_response(error.into());
        }
    };
    service.inner.engine.terminate(session.id().as_str());
    service.inner.streams.remove(session.id());
    tracing::info!(session_id = %session.id(), "session deleted by client");
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{RequestId, method};

    fn initialize_call() -> Call {
        Call {
            id: Some(RequestId::Number(1)),
            method: method::INITIALIZE.to_owned(),
            params: Some(json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            })),
        }
    }

    #[tokio::test]
    async fn test_terminated_session_releases_its_stream_queue() {
        let service = StreamableHttpService::new(
            Engine::builder().build(),
            StreamableHttpServerConfig::default(),
        );
        let response = service.initialize(&initialize_call(), None);
        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_owned();
        assert_eq!(service.inner.streams.len(), 1);

        // the reaper and Engine::terminate bypass the DELETE handler
        assert!(service.engine().terminate(&session_id));
        tokio::time::timeout(Duration::from_secs(1), async {
            while !service.inner.streams.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("stream queue was not released");
    }
}
