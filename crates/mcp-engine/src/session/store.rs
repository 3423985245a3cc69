use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{Session, SessionId, SessionInit};
use crate::error::SessionError;

/// Live sessions keyed by id.
///
/// A session leaves the map before its state is torn down, so once `terminate`
/// returns no lookup can observe the id again.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, init: SessionInit) -> Arc<Session> {
        let id = SessionId::random();
        let session = Arc::new(Session::new(id.clone(), init));
        self.sessions.insert(id, session.clone());
        tracing::info!(
            session_id = %session.id(),
            kind = ?session.kind(),
            capabilities = ?session.capabilities(),
            "session created"
        );
        session
    }

    /// A session that is never registered. Used for stateless HTTP requests.
    pub fn ephemeral(&self, init: SessionInit) -> Arc<Session> {
        Arc::new(Session::new(SessionId::random(), init))
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(id.to_owned()))?;
        if session.is_closed() {
            return Err(SessionError::Closed(id.to_owned()));
        }
        Ok(session)
    }

    pub fn touch(&self, id: &str) -> Result<(), SessionError> {
        self.get(id)?.touch();
        Ok(())
    }

    /// Remove the session and reject everything it still has pending.
    ///
    /// Returns `false` when the id was unknown or already terminated.
    pub fn terminate(&self, id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        if let Some(rejected) = session.close() {
            tracing::info!(session_id = %id, rejected, "session terminated");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Snapshot of the live sessions. Holding it does not block the store.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Terminate every session idle for longer than `idle_timeout` and return
    /// the ids actually terminated. Sessions with a call or server-initiated
    /// request in flight are never idle.
    pub fn reap_idle(&self, idle_timeout: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                now.duration_since(session.last_activity()) > idle_timeout && !session.is_busy()
            })
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .into_iter()
            .filter(|id| {
                let reaped = self.terminate(id.as_str());
                if reaped {
                    tracing::info!(session_id = %id, ?idle_timeout, "idle session reaped");
                }
                reaped
            })
            .collect()
    }

    pub fn spawn_reaper(
        self: &Arc<Self>,
        idle_timeout: Duration,
        interval: Duration,
        ct: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ct.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    store.reap_idle(idle_timeout);
                }
                tracing::debug!("session reaper stopped");
            }
            .instrument(tracing::debug_span!("session_reaper")),
        )
    }
}
