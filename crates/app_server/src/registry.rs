//! Session registry: primary index by session id, secondary by user id,
//! rehydrate-on-miss from the snapshot store, TTL sweeping, and the tick
//! fan-out sink feeding per-session mailboxes.

use std::sync::Arc;
use std::time::Duration;

use core_types::{BrokerTokens, SessionError, SessionId, Tick, UserId};
use dashmap::DashMap;
use feed_angel::TickSink;
use session_store::SnapshotStore;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::session::{
    empty_snapshot, spawn_session, SessionCommand, SessionDeps, SessionHandle, SessionSnapshot,
    SNAPSHOT_VERSION,
};

pub type SessionIndex = Arc<DashMap<SessionId, SessionHandle>>;

/// Non-blocking tick fan-out: overwrite each subscribed session's mailbox
/// slot. A slow session conflates; nobody queues.
pub struct RegistrySink {
    sessions: SessionIndex,
}

impl RegistrySink {
    pub fn new(sessions: SessionIndex) -> Self {
        Self { sessions }
    }
}

impl TickSink for RegistrySink {
    fn deliver(&self, sessions: &[SessionId], tick: &Tick) {
        for session_id in sessions {
            if let Some(handle) = self.sessions.get(session_id) {
                handle.mailbox.publish(tick.id(), tick.clone());
            }
        }
    }
}

pub struct SessionRegistry {
    sessions: SessionIndex,
    by_user: DashMap<UserId, SessionId>,
    store: Arc<SnapshotStore>,
    deps: SessionDeps,
}

impl SessionRegistry {
    pub fn new(sessions: SessionIndex, store: Arc<SnapshotStore>, deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            by_user: DashMap::new(),
            store,
            deps,
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&session_id).map(|h| h.value().clone())
    }

    /// Login: fresh session id, state restored from the user's snapshot when
    /// one exists. An older live session for the same user is evicted first
    /// (its snapshot survives and immediately seeds the new session).
    pub async fn login(&self, broker: BrokerTokens) -> Result<SessionHandle, SessionError> {
        let user_id = broker.client_code.clone();
        let stale = self.by_user.get(&user_id).map(|entry| *entry.value());
        if let Some(stale_id) = stale {
            self.evict(stale_id).await;
        }

        let mut snapshot = self
            .load_snapshot(&user_id)
            .unwrap_or_else(|| empty_snapshot(&user_id, broker.clone()));
        // Freshly issued credentials win over whatever the snapshot carried.
        snapshot.broker = broker.clone();

        Ok(self.start_session(snapshot).await)
    }

    /// Lookup for channel rebind and request routing: by session id first,
    /// then by user id (live session or snapshot rehydrate under a fresh id).
    pub async fn resolve(
        &self,
        session_id: SessionId,
        user_id: Option<&str>,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.get(session_id) {
            return Ok(handle);
        }
        let Some(user_id) = user_id else {
            return Err(SessionError::SessionNotFound);
        };

        let live = self.by_user.get(user_id).map(|entry| *entry.value());
        if let Some(live_id) = live {
            if let Some(handle) = self.get(live_id) {
                return Ok(handle);
            }
        }

        let snapshot = self
            .load_snapshot(user_id)
            .ok_or(SessionError::SessionNotFound)?;
        tracing::info!(user_id, "rehydrating session from snapshot");
        Ok(self.start_session(snapshot).await)
    }

    pub async fn logout(&self, session_id: SessionId) -> Result<(), SessionError> {
        let (_, handle) = self
            .sessions
            .remove(&session_id)
            .ok_or(SessionError::SessionNotFound)?;
        self.by_user
            .remove_if(&handle.user_id, |_, live| *live == session_id);
        self.stop_loop(&handle).await;
        self.deps.feed.drop_session(session_id).await;
        // Logout is explicit destruction: the durable snapshot goes too.
        self.deps.flush.delete(handle.user_id.clone());
        self.publish_gauge();
        Ok(())
    }

    /// Evict a live session but keep its snapshot (warm-TTL expiry, login
    /// replacing an old session).
    pub async fn evict(&self, session_id: SessionId) {
        let Some((_, handle)) = self.sessions.remove(&session_id) else {
            return;
        };
        self.by_user
            .remove_if(&handle.user_id, |_, live| *live == session_id);
        self.stop_loop(&handle).await;
        self.deps.feed.drop_session(session_id).await;
        self.publish_gauge();
    }

    pub async fn shutdown_all(&self, grace: Duration) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();
        self.by_user.clear();

        let _ = timeout(grace, async {
            for handle in &handles {
                self.stop_loop(handle).await;
            }
        })
        .await;
        self.deps.flush.flush_now().await;
        self.publish_gauge();
    }

    pub fn spawn_sweeper(self: &Arc<Self>, warm_ttl: Duration, cold_ttl: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = registry.deps.clock.now_wall();
                let idle: Vec<SessionId> = registry
                    .sessions
                    .iter()
                    .filter(|entry| {
                        let idle_for = now - entry.value().last_active();
                        idle_for.to_std().unwrap_or_default() >= warm_ttl
                    })
                    .map(|entry| *entry.key())
                    .collect();
                for session_id in idle {
                    tracing::info!(%session_id, "evicting idle session");
                    registry.evict(session_id).await;
                }
                match registry.store.cleanup_older_than(cold_ttl) {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "discarded cold snapshots"),
                    Err(err) => tracing::warn!(error = %err, "snapshot cleanup failed"),
                }
            }
        });
    }

    async fn start_session(&self, snapshot: SessionSnapshot) -> SessionHandle {
        let session_id = core_types::new_id();
        let broker = snapshot.broker.clone();
        let watchlist = snapshot.watchlist_ids();

        let handle = spawn_session(session_id, snapshot, self.deps.clone());
        self.sessions.insert(session_id, handle.clone());
        self.by_user.insert(handle.user_id.clone(), session_id);

        self.deps.feed.delegate_credentials(broker).await;
        if !watchlist.is_empty() {
            self.deps.feed.subscribe(session_id, watchlist).await;
        }
        self.publish_gauge();
        handle
    }

    fn load_snapshot(&self, user_id: &str) -> Option<SessionSnapshot> {
        let bytes = match self.store.load_blob(user_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(user_id, error = %err, "snapshot load failed");
                return None;
            }
        };
        match serde_json::from_slice::<SessionSnapshot>(&bytes) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Some(snapshot),
            Ok(snapshot) => {
                tracing::warn!(
                    user_id,
                    version = snapshot.version,
                    "snapshot version unsupported, quarantining"
                );
                self.quarantine(user_id);
                None
            }
            Err(err) => {
                tracing::error!(user_id, error = %err, "snapshot corrupt, quarantining");
                self.quarantine(user_id);
                None
            }
        }
    }

    fn quarantine(&self, user_id: &str) {
        match self.store.quarantine(user_id) {
            Ok(Some(path)) => {
                tracing::warn!(user_id, archive = %path.display(), "snapshot archived for diagnosis")
            }
            Ok(None) => {}
            Err(err) => tracing::error!(user_id, error = %err, "snapshot quarantine failed"),
        }
    }

    async fn stop_loop(&self, handle: &SessionHandle) {
        let (tx, rx) = oneshot::channel();
        if handle
            .try_send(SessionCommand::Shutdown { done: Some(tx) })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    fn publish_gauge(&self) {
        metrics::gauge!("sessions.active").set(self.sessions.len() as f64);
    }
}
