use std::{borrow::Cow, collections::HashMap, fmt::Display, future::Future, sync::Arc};

use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    correlation::Peer,
    error::CorrelationError,
    model::{ErrorData, ProgressNotificationParam, ProgressToken, RequestId},
    session::Session,
};

pub type HandlerFuture = BoxFuture<'static, Result<Value, ErrorData>>;

/// A method implementation.
///
/// Implemented for every `Fn(Option<Value>, RequestContext) -> impl Future<Output =
/// Result<Value, ErrorData>>`, so plain async closures can be registered directly.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, params: Option<Value>, context: RequestContext) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorData>> + Send + 'static,
{
    fn call(&self, params: Option<Value>, context: RequestContext) -> HandlerFuture {
        Box::pin(self(params, context))
    }
}

struct TypedHandler<F, P, R> {
    f: F,
    _marker: std::marker::PhantomData<fn(P) -> R>,
}

impl<F, Fut, P, R> Handler for TypedHandler<F, P, R>
where
    F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ErrorData>> + Send + 'static,
    P: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    fn call(&self, params: Option<Value>, context: RequestContext) -> HandlerFuture {
        let params = params.unwrap_or_else(|| Value::Object(Default::default()));
        let params = match serde_json::from_value::<P>(params) {
            Ok(params) => params,
            Err(e) => {
                let error = ErrorData::invalid_params(e.to_string(), None);
                return Box::pin(async move { Err(error) });
            }
        };
        let fut = (self.f)(params, context);
        Box::pin(async move {
            let result = fut.await?;
            serde_json::to_value(result)
                .map_err(|e| ErrorData::internal_error(format!("failed to encode result: {e}"), None))
        })
    }
}

/// Method name to handler table, handed to the engine at construction.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Cow<'static, str>, Arc<dyn Handler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<F, Fut>(mut self, method: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorData>> + Send + 'static,
    {
        self.register(method, f);
        self
    }

    /// Register a handler whose params and result go through serde.
    ///
    /// Params that do not deserialize into `P` are answered with `InvalidParams`
    /// without calling `f`. Missing params are read as an empty object.
    pub fn with_typed<P, R, F, Fut>(mut self, method: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorData>> + Send + 'static,
        P: DeserializeOwned + 'static,
        R: Serialize + 'static,
    {
        self.register(
            method,
            TypedHandler {
                f,
                _marker: std::marker::PhantomData,
            },
        );
        self
    }

    pub fn register(&mut self, method: impl Into<Cow<'static, str>>, handler: impl Handler) {
        self.handlers.insert(method.into(), Arc::new(handler));
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|k| k.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Per-invocation context passed to every handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// `None` for notifications.
    pub id: Option<RequestId>,
    pub method: String,
    /// Cancelled by `notifications/cancelled` or when the session closes.
    pub ct: CancellationToken,
    pub peer: Peer,
    /// Set when the caller asked for progress through `_meta.progressToken`.
    pub progress_token: Option<ProgressToken>,
}

impl RequestContext {
    pub fn session(&self) -> &Arc<Session> {
        self.peer.session()
    }

    /// Report progress against the caller's token. Does nothing when the caller
    /// did not ask for progress.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), CorrelationError> {
        let Some(progress_token) = self.progress_token.clone() else {
            return Ok(());
        };
        self.peer
            .notify_progress(ProgressNotificationParam {
                progress_token,
                progress,
                total,
                message,
            })
            .await
    }
}

/// Identity established by an upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(Arc<str>);

impl Principal {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Allow,
    Deny,
}

/// Decides whether `session` may call `method`. Consulted before every handler call.
pub trait PermissionCheck: Send + Sync + 'static {
    fn check(&self, session: &Session, method: &str) -> Permission;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionCheck for AllowAll {
    fn check(&self, _session: &Session, _method: &str) -> Permission {
        Permission::Allow
    }
}

impl<F> PermissionCheck for F
where
    F: Fn(&Session, &str) -> Permission + Send + Sync + 'static,
{
    fn check(&self, session: &Session, method: &str) -> Permission {
        self(session, method)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::{
        correlation::CorrelationEngine,
        model::{CapabilitySet, ErrorCode},
        notification::NotificationFanout,
        session::{SessionStore, TransportKind, test_session},
    };

    fn context(method: &str) -> RequestContext {
        let session = Arc::new(test_session(TransportKind::Stdio, CapabilitySet::EMPTY, None));
        let store = Arc::new(SessionStore::new());
        RequestContext {
            id: Some(RequestId::from(1)),
            method: method.to_owned(),
            ct: CancellationToken::new(),
            peer: Peer::new(
                session,
                CorrelationEngine::new(Duration::from_secs(1)),
                NotificationFanout::new(store),
            ),
            progress_token: None,
        }
    }

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_params() {
        let registry = HandlerRegistry::new().with_typed("add", |p: Add, _ctx| async move {
            Ok::<_, ErrorData>(json!({ "sum": p.a + p.b }))
        });
        let handler = registry.get("add").unwrap();

        let ok = handler
            .call(Some(json!({"a": 2, "b": 3})), context("add"))
            .await
            .unwrap();
        assert_eq!(ok, json!({"sum": 5}));

        let err = handler
            .call(Some(json!({"a": "x"})), context("add"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_closure_handler_and_lookup() {
        let registry = HandlerRegistry::new()
            .with_handler("echo", |params, _ctx| async move {
                Ok::<_, ErrorData>(params.unwrap_or(Value::Null))
            });
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        let out = registry
            .get("echo")
            .unwrap()
            .call(Some(json!({"x": 1})), context("echo"))
            .await
            .unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[test]
    fn test_permission_closure() {
        let deny_admin = |_: &Session, method: &str| {
            if method.starts_with("admin/") {
                Permission::Deny
            } else {
                Permission::Allow
            }
        };
        let session = test_session(TransportKind::Stdio, CapabilitySet::EMPTY, None);
        assert_eq!(deny_admin.check(&session, "admin/reset"), Permission::Deny);
        assert_eq!(deny_admin.check(&session, "echo"), Permission::Allow);
    }
}
