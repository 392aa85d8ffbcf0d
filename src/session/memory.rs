use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{
    AuthenticatedSession, Expiring, PendingClaim, PendingSelection, PkceExchange, SessionStore,
};
use crate::error::Error;
use crate::types::{SelectionId, SessionId, TeamName};

/// Process-local [`SessionStore`]. A restart discards everything.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    exchanges: DashMap<String, PkceExchange>,
    pending: DashMap<SelectionId, Arc<PendingSelection>>,
    sessions: DashMap<SessionId, Arc<AuthenticatedSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, expired or not.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.exchanges.len() + self.pending.len() + self.sessions.len()
    }
}

fn find_live<K, V>(map: &DashMap<K, Arc<V>>, key: &K) -> Option<Arc<V>>
where
    K: Eq + Hash,
    V: Expiring,
{
    let now = OffsetDateTime::now_utc();
    let found = map.get(key).map(|entry| Arc::clone(entry.value()))?;
    if !found.is_expired_at(now) {
        return Some(found);
    }
    map.remove_if(key, |_, v| v.is_expired_at(now));
    None
}

fn purge<K, V>(map: &DashMap<K, V>, now: OffsetDateTime) -> usize
where
    K: Eq + Hash,
    V: Expiring,
{
    let mut removed = 0;
    map.retain(|_, v| {
        let keep = !v.is_expired_at(now);
        if !keep {
            removed += 1;
        }
        keep
    });
    removed
}

impl<T: Expiring> Expiring for Arc<T> {
    fn expires_at(&self) -> OffsetDateTime {
        (**self).expires_at()
    }
}

impl SessionStore for MemorySessionStore {
    async fn insert_exchange(&self, state: String, exchange: PkceExchange) -> Result<(), Error> {
        self.exchanges.insert(state, exchange);
        Ok(())
    }

    async fn take_exchange(&self, state: &str) -> Result<Option<PkceExchange>, Error> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .exchanges
            .remove(state)
            .map(|(_, exchange)| exchange)
            .filter(|exchange| !exchange.is_expired_at(now)))
    }

    async fn insert_pending(&self, id: SelectionId, pending: PendingSelection) -> Result<(), Error> {
        self.pending.insert(id, Arc::new(pending));
        Ok(())
    }

    async fn find_pending(&self, id: &SelectionId) -> Result<Option<Arc<PendingSelection>>, Error> {
        Ok(find_live(&self.pending, id))
    }

    async fn claim_pending(&self, id: &SelectionId, team: &TeamName) -> Result<PendingClaim, Error> {
        let now = OffsetDateTime::now_utc();
        // Expired records are removed here too, so they cannot linger.
        let removed = self.pending.remove_if(id, |_, pending| {
            pending.is_expired_at(now) || pending.candidates.contains(team)
        });
        Ok(match removed {
            Some((_, pending)) if pending.is_expired_at(now) => PendingClaim::Missing,
            Some((_, pending)) => PendingClaim::Claimed(pending),
            None if self.pending.contains_key(id) => PendingClaim::NotACandidate,
            None => PendingClaim::Missing,
        })
    }

    async fn insert_session(&self, id: SessionId, session: AuthenticatedSession) -> Result<(), Error> {
        self.sessions.insert(id, Arc::new(session));
        Ok(())
    }

    async fn find_session(&self, id: &SessionId) -> Result<Option<Arc<AuthenticatedSession>>, Error> {
        Ok(find_live(&self.sessions, id))
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, Error> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn purge_expired(&self) -> Result<usize, Error> {
        let now = OffsetDateTime::now_utc();
        Ok(purge(&self.exchanges, now) + purge(&self.pending, now) + purge(&self.sessions, now))
    }
}

/// Periodically purge expired records from `store`.
///
/// The task runs until the returned handle is aborted or the runtime stops.
pub fn spawn_reaper<S: SessionStore>(store: Arc<S>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Purged expired session records"),
                Err(e) => tracing::warn!(error = %e, "Session reaper sweep failed"),
            }
        }
    })
}
