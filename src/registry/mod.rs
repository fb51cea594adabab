use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{DashMap, Entry};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub use self::session_ref::SessionRef;
use self::error::RegistryError;
use crate::config::SessionConfig;
use crate::lifecycle::{LifecycleEvent, LifecycleKind};
use crate::session::{CancelReason, StreamSession};
use crate::session_id::{ConnectionId, SessionId};

pub mod error;
pub mod session_ref;

/// A map of sessions identified by a [`SessionId`].
///
/// When a session is created it becomes a registry-owned resource for which only weak
/// [`SessionRef`]s can be obtained. Direct access to the strong reference is not allowed in order to
/// prevent long lived upgrades undermining lifecycle control from the registry.
///
/// Creation and removal go through the map's entry API, so they are serialized per key, while
/// lookups proceed concurrently. The session ceiling is enforced with an atomic reservation taken
/// while the vacant entry is held.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<StreamSession>, ahash::RandomState>,
    count: AtomicUsize,
    events: broadcast::Sender<LifecycleEvent>,
}

impl SessionRegistry {
    /// Construct a new empty [`SessionRegistry`] whose lifecycle channel buffers `event_capacity`
    /// events per subscriber.
    pub fn new(event_capacity: usize) -> SessionRegistry {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            sessions: DashMap::default(),
            count: AtomicUsize::new(0),
            events,
        }
    }

    /// Create a new open session tracked by `session_id`.
    ///
    /// Fails with [`RegistryError::DuplicateSession`] if the id is taken and with
    /// [`RegistryError::CapacityExceeded`] if `config.max_concurrent_sessions` sessions are already
    /// held. An existing session is never touched by a failed create.
    pub fn create(
        &self,
        session_id: SessionId,
        config: &SessionConfig,
    ) -> Result<SessionRef, RegistryError> {
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::DuplicateSession {
                session_id: entry.key().clone(),
            }),

            Entry::Vacant(slot) => {
                let limit = config.max_concurrent_sessions;
                self.count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                        (held < limit).then_some(held + 1)
                    })
                    .map_err(|_| RegistryError::CapacityExceeded { limit })?;

                let session = Arc::new(StreamSession::open_with_events(
                    session_id.clone(),
                    config.per_session_queue_capacity,
                    self.events.clone(),
                ));
                let session_ref = SessionRef::new(session_id.clone(), Arc::downgrade(&session));
                slot.insert(session);

                debug!(session_id = %session_id, "Session created");
                let _ = self
                    .events
                    .send(LifecycleEvent::now(session_id, LifecycleKind::Created));

                Ok(session_ref)
            }
        }
    }

    /// Lend the session for the provided `session_id`.
    pub fn lookup(&self, session_id: &SessionId) -> Result<SessionRef, RegistryError> {
        self.sessions
            .view(session_id, |_, session| {
                SessionRef::new(session_id.clone(), Arc::downgrade(session))
            })
            .ok_or_else(|| RegistryError::NotFound {
                session_id: session_id.clone(),
            })
    }

    /// Remove a `Closed` or `Cancelled` session.
    ///
    /// Live sessions are refused with [`RegistryError::SessionStillActive`]; callers must close
    /// or cancel first.
    pub fn remove(&self, session_id: &SessionId) -> Result<(), RegistryError> {
        if self
            .sessions
            .remove_if(session_id, |_, session| session.is_terminal())
            .is_some()
        {
            self.count.fetch_sub(1, Ordering::AcqRel);
            debug!(session_id = %session_id, "Session removed");
            return Ok(());
        }

        match self.sessions.get(session_id) {
            Some(session) => Err(RegistryError::SessionStillActive {
                session_id: session_id.clone(),
                state: session.state(),
            }),
            None => Err(RegistryError::NotFound {
                session_id: session_id.clone(),
            }),
        }
    }

    /// All sessions living on `connection`.
    pub fn sessions_for(&self, connection: ConnectionId) -> Vec<SessionRef> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().connection() == connection)
            .map(|entry| SessionRef::new(entry.key().clone(), Arc::downgrade(entry.value())))
            .collect()
    }

    /// Cancel every live session on `connection`, returning how many were cancelled.
    pub fn cancel_connection(&self, connection: ConnectionId, reason: CancelReason) -> usize {
        let cancelled = Self::cancel_each(self.sessions_for(connection), reason);
        if cancelled > 0 {
            info!(connection = %connection, cancelled, reason = %reason, "Cancelled connection sessions");
        }
        cancelled
    }

    /// Cancel every live session in the registry, returning how many were cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let sessions: Vec<SessionRef> = self
            .sessions
            .iter()
            .map(|entry| SessionRef::new(entry.key().clone(), Arc::downgrade(entry.value())))
            .collect();

        let cancelled = Self::cancel_each(sessions, reason);
        if cancelled > 0 {
            info!(cancelled, reason = %reason, "Cancelled all sessions");
        }
        cancelled
    }

    fn cancel_each(sessions: Vec<SessionRef>, reason: CancelReason) -> usize {
        // Collected first so no map shard lock is held while queues are woken.
        sessions
            .iter()
            .filter(|session| {
                session
                    .view(|session| session.cancel(reason).is_ok())
                    .unwrap_or(false)
            })
            .count()
    }

    /// Subscribe to advisory lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Number of sessions currently held, live or awaiting removal.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default().event_capacity)
    }
}
