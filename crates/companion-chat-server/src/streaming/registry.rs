use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};

/// One live duplex connection.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: Uuid,
    pub user_id: Uuid,
    pub connected_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    /// Cancelled when the connection closes or is reclaimed. Every in-flight
    /// operation runs under a child of this token.
    cancel: CancellationToken,
    /// Conversation id -> token of the incremental response streaming for it.
    streams: DashMap<Uuid, CancellationToken>,
}

impl SessionHandle {
    fn new(user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            connected_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            streams: DashMap::new(),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn operation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reserve the connection's single streaming slot for `conversation_id`.
    /// `None` while another response is still streaming for it. The slot is
    /// released when the returned claim drops.
    pub fn claim_stream(
        self: &Arc<Self>,
        conversation_id: Uuid,
        token: CancellationToken,
    ) -> Option<StreamClaim> {
        match self.streams.entry(conversation_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(token);
                Some(StreamClaim {
                    session: self.clone(),
                    conversation_id,
                })
            }
        }
    }

    pub fn is_streaming(&self, conversation_id: Uuid) -> bool {
        self.streams.contains_key(&conversation_id)
    }

    /// Conversations with a response currently streaming on this connection.
    pub fn streaming_conversations(&self) -> Vec<Uuid> {
        self.streams.iter().map(|entry| *entry.key()).collect()
    }
}

/// Held by a streaming operation for as long as it runs.
#[derive(Debug)]
pub struct StreamClaim {
    session: Arc<SessionHandle>,
    conversation_id: Uuid,
}

impl StreamClaim {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }
}

impl Drop for StreamClaim {
    fn drop(&mut self) {
        self.session.streams.remove(&self.conversation_id);
    }
}

/// Process-wide set of duplex sessions. Lookups and liveness updates are
/// per-entry; there is no lock over the whole set.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
    stale_after: Duration,
}

impl SessionRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            stale_after,
        }
    }

    pub fn register(&self, user_id: Uuid) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(user_id));
        self.sessions.insert(handle.id, handle.clone());
        debug!(session_id = %handle.id, %user_id, "Duplex session registered");
        handle
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn touch(&self, id: Uuid) -> bool {
        match self.sessions.get(&id) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Remove and cancel. Idempotent.
    pub fn remove(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        let (_, handle) = self.sessions.remove(&id)?;
        handle.cancel.cancel();
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions_for_user(&self, user_id: Uuid) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .count()
    }

    /// Reclaim sessions whose last liveness signal is older than the
    /// staleness window. Returns the reclaimed handles, already cancelled.
    pub fn reap_stale(&self) -> Vec<Arc<SessionHandle>> {
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.idle_for() > self.stale_after)
            .map(|entry| *entry.key())
            .collect();

        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Background sweep every `interval` until `shutdown` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        activity: ActivityLogger,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for handle in registry.reap_stale() {
                    info!(
                        session_id = %handle.id,
                        user_id = %handle.user_id,
                        idle_secs = handle.idle_for().as_secs(),
                        "Reclaimed stale duplex session"
                    );
                    activity.log(
                        ActivityLog::builder(ActivityType::DuplexReclaimed)
                            .user(handle.user_id)
                            .status(ActivityStatus::Warning)
                            .custom("session_id", handle.id.to_string())
                            .build(),
                    );
                }
            }
            debug!("Session reaper stopped");
        })
    }
}
