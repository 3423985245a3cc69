//! Batch dispatch.
//!
//! Every envelope is handled as a list, even a single call. Admission is decided
//! on the whole list before anything runs; after that each item succeeds or fails
//! on its own and the response keeps input order.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    codec::{BatchEnvelope, BatchResult, Call, InboundItem},
    config::{EngineConfig, ExecutionMode, SequentialFaultPolicy},
    correlation::{CorrelationEngine, Peer},
    error::EngineError,
    handler::{HandlerRegistry, Permission, PermissionCheck, RequestContext},
    model::{ErrorCode, ErrorData, JsonRpcMessage, method, progress_token_of},
    notification::NotificationFanout,
    session::Session,
};

/// How long a handler may keep running once its session closes.
const SESSION_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// What running one call produced.
#[derive(Debug)]
struct CallOutcome {
    response: Option<JsonRpcMessage>,
    /// The handler returned an error or panicked.
    hard_fault: bool,
}

impl CallOutcome {
    fn respond(call: &Call, result: Result<serde_json::Value, ErrorData>) -> Self {
        let hard_fault = result.is_err();
        let response = call.id.clone().map(|id| match result {
            Ok(value) => JsonRpcMessage::response(id, value),
            Err(error) => JsonRpcMessage::error(Some(id), error),
        });
        Self {
            response,
            hard_fault,
        }
    }

    /// An error that does not count as a handler fault.
    fn reject(call: &Call, error: ErrorData) -> Self {
        Self {
            response: call.id.clone().map(|id| JsonRpcMessage::error(Some(id), error)),
            hard_fault: false,
        }
    }
}

enum Slot {
    Done(Option<JsonRpcMessage>),
    Run(Call),
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    permission: Arc<dyn PermissionCheck>,
    max_batch_size: usize,
    execution_mode: ExecutionMode,
    fault_policy: SequentialFaultPolicy,
    correlation: CorrelationEngine,
    fanout: NotificationFanout,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("max_batch_size", &self.max_batch_size)
            .field("execution_mode", &self.execution_mode)
            .field("fault_policy", &self.fault_policy)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        permission: Arc<dyn PermissionCheck>,
        config: &EngineConfig,
        correlation: CorrelationEngine,
        fanout: NotificationFanout,
    ) -> Self {
        Self {
            registry,
            permission,
            max_batch_size: config.max_batch_size,
            execution_mode: config.execution_mode,
            fault_policy: config.sequential_fault_policy,
            correlation,
            fanout,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn dispatch(
        &self,
        session: &Arc<Session>,
        envelope: BatchEnvelope,
    ) -> Result<BatchResult, EngineError> {
        if envelope.len() > self.max_batch_size {
            tracing::warn!(
                session_id = %session.id(),
                size = envelope.len(),
                max = self.max_batch_size,
                "batch rejected"
            );
            return Err(EngineError::AdmissionRejected {
                size: envelope.len(),
                max: self.max_batch_size,
            });
        }

        let shape = envelope.shape;
        let slots: Vec<Slot> = envelope
            .items
            .into_iter()
            .map(|item| self.classify(session, item))
            .collect();

        let responses = match self.execution_mode {
            ExecutionMode::Parallel => self.run_parallel(session, slots).await,
            ExecutionMode::Sequential => self.run_sequential(session, slots).await,
        };
        Ok(BatchResult { shape, responses })
    }

    /// Settle everything that needs no handler: replies, broken items and stray
    /// `initialize` calls.
    fn classify(&self, session: &Session, item: InboundItem) -> Slot {
        match item {
            InboundItem::Call(call) if call.method == method::INITIALIZE => {
                let error = EngineError::AlreadyInitialized.to_error_data();
                Slot::Done(call.id.map(|id| JsonRpcMessage::error(Some(id), error)))
            }
            InboundItem::Call(call) => Slot::Run(call),
            InboundItem::Reply(reply) => {
                self.correlation.resolve(session, reply);
                Slot::Done(None)
            }
            InboundItem::Invalid { id, error } => Slot::Done(Some(JsonRpcMessage::error(id, error))),
            InboundItem::Unmatched(error) => {
                tracing::debug!(session_id = %session.id(), %error, "client error without id dropped");
                Slot::Done(None)
            }
        }
    }

    async fn run_parallel(&self, session: &Arc<Session>, slots: Vec<Slot>) -> Vec<JsonRpcMessage> {
        enum Pending {
            Done(Option<JsonRpcMessage>),
            Spawned(Call, JoinHandle<CallOutcome>),
        }
        let pending: Vec<Pending> = slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Done(response) => Pending::Done(response),
                Slot::Run(call) => {
                    let handle = self.spawn_call(session, call.clone());
                    Pending::Spawned(call, handle)
                }
            })
            .collect();

        join_all(pending.into_iter().map(|pending| async move {
            match pending {
                Pending::Done(response) => response,
                Pending::Spawned(call, handle) => joined(&call, handle.await).response,
            }
        }))
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn run_sequential(
        &self,
        session: &Arc<Session>,
        slots: Vec<Slot>,
    ) -> Vec<JsonRpcMessage> {
        let mut responses = Vec::with_capacity(slots.len());
        let mut faulted = false;
        for slot in slots {
            match slot {
                Slot::Done(response) => responses.extend(response),
                Slot::Run(call) if faulted => {
                    let error = ErrorData::new(
                        ErrorCode::SKIPPED,
                        "skipped after an earlier item failed",
                        None,
                    );
                    responses.extend(CallOutcome::reject(&call, error).response);
                }
                Slot::Run(call) => {
                    let handle = self.spawn_call(session, call.clone());
                    let outcome = joined(&call, handle.await);
                    if outcome.hard_fault
                        && self.fault_policy == SequentialFaultPolicy::SkipRemaining
                    {
                        tracing::debug!(
                            session_id = %session.id(),
                            method = %call.method,
                            "sequential batch aborted, skipping remaining items"
                        );
                        faulted = true;
                    }
                    responses.extend(outcome.response);
                }
            }
        }
        responses
    }

    fn spawn_call(&self, session: &Arc<Session>, call: Call) -> JoinHandle<CallOutcome> {
        let span = tracing::debug_span!(
            "call",
            session_id = %session.id(),
            method = %call.method,
            request_id = ?call.id,
        );
        let dispatcher = self.clone();
        let session = session.clone();
        tokio::spawn(async move { dispatcher.run_call(session, call).await }.instrument(span))
    }

    async fn run_call(&self, session: Arc<Session>, call: Call) -> CallOutcome {
        if self.permission.check(&session, &call.method) == Permission::Deny {
            tracing::debug!("permission denied");
            let error = ErrorData::new(
                ErrorCode::FORBIDDEN,
                format!("permission denied for {}", call.method),
                None,
            );
            return CallOutcome::reject(&call, error);
        }
        let Some(handler) = self.registry.get(&call.method) else {
            if call.is_notification() {
                tracing::debug!("no handler for notification");
            }
            return CallOutcome::reject(&call, ErrorData::method_not_found(&call.method));
        };

        let ct = match &call.id {
            Some(id) => session.begin_request(id.clone()),
            None => session.cancellation_token().child_token(),
        };
        let context = RequestContext {
            id: call.id.clone(),
            method: call.method.clone(),
            ct: ct.clone(),
            peer: Peer::new(session.clone(), self.correlation.clone(), self.fanout.clone()),
            progress_token: progress_token_of(call.params.as_ref()),
        };
        let mut fut = handler.call(call.params.clone(), context);
        let finished = tokio::select! {
            biased;
            result = &mut fut => Some(result),
            _ = ct.cancelled() => None,
        };
        let result = match finished {
            Some(result) => result,
            // a closing session rejects the handler's pending peer requests; let
            // it observe that and answer before it is dropped
            None if session.cancellation_token().is_cancelled() => {
                tokio::time::timeout(SESSION_CLOSE_GRACE, fut)
                    .await
                    .unwrap_or_else(|_| Err(request_cancelled()))
            }
            None => Err(request_cancelled()),
        };
        if let Some(id) = &call.id {
            session.end_request(id);
        }
        if let Err(error) = &result {
            tracing::debug!(%error, "handler failed");
        }
        CallOutcome::respond(&call, result)
    }
}

fn request_cancelled() -> ErrorData {
    ErrorData::new(ErrorCode::REQUEST_CANCELLED, "request cancelled", None)
}

fn joined(call: &Call, joined: Result<CallOutcome, tokio::task::JoinError>) -> CallOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(method = %call.method, error = %e, "handler task failed");
            let message = if e.is_panic() {
                "handler panicked"
            } else {
                "handler task was cancelled"
            };
            CallOutcome::respond(call, Err(ErrorData::internal_error(message, None)))
        }
    }
}
