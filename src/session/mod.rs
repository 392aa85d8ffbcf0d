//! Ephemeral broker state: in-flight PKCE exchanges, pending team selections,
//! and authenticated sessions.
//!
//! Every record carries an absolute expiry. Lookups treat expired records as
//! absent and delete them; [`spawn_reaper`] sweeps the rest. Records are never
//! mutated after insertion, only removed, so per-key atomic removal is the
//! only synchronization a backend has to provide.

mod memory;

use std::future::Future;
use std::sync::Arc;

use secrecy::SecretString;
use time::{Duration, OffsetDateTime};

use crate::error::Error;
use crate::oauth::Profile;
use crate::types::{FlowOrigin, SelectionId, SessionId, TeamName, clone_secret};

pub use memory::{MemorySessionStore, spawn_reaper};

/// Lifetime of an unredeemed PKCE exchange.
pub const PKCE_WINDOW: Duration = Duration::minutes(10);
/// Lifetime of a pending team selection.
pub const SELECTION_WINDOW: Duration = Duration::minutes(10);
/// Lifetime of an authenticated session.
pub const SESSION_TTL: Duration = Duration::hours(1);

/// Records with an absolute expiry.
pub trait Expiring {
    fn expires_at(&self) -> OffsetDateTime;

    fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at() < now
    }
}

/// Tokens captured from the identity provider's token endpoint.
#[derive(Debug)]
pub struct IdentityTokens {
    pub access_token: SecretString,
    pub id_token: Option<SecretString>,
}

impl Clone for IdentityTokens {
    fn clone(&self) -> Self {
        Self {
            access_token: clone_secret(&self.access_token),
            id_token: self.id_token.as_ref().map(clone_secret),
        }
    }
}

/// Verifier for a started authorization-code flow, keyed by `state`.
#[derive(Debug)]
pub struct PkceExchange {
    pub code_verifier: String,
    pub origin: FlowOrigin,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

impl PkceExchange {
    #[must_use]
    pub fn new(code_verifier: String, origin: FlowOrigin) -> Self {
        let created_at = OffsetDateTime::now_utc();
        Self {
            code_verifier,
            origin,
            created_at,
            expires_at: created_at + PKCE_WINDOW,
        }
    }
}

impl Expiring for PkceExchange {
    fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }
}

/// A profile that mapped to more than one team and awaits a choice.
#[derive(Debug)]
pub struct PendingSelection {
    pub profile: Profile,
    pub candidates: Vec<TeamName>,
    pub tokens: IdentityTokens,
    pub origin: FlowOrigin,
    pub expires_at: OffsetDateTime,
}

impl PendingSelection {
    #[must_use]
    pub fn new(
        profile: Profile,
        candidates: Vec<TeamName>,
        tokens: IdentityTokens,
        origin: FlowOrigin,
    ) -> Self {
        Self {
            profile,
            candidates,
            tokens,
            origin,
            expires_at: OffsetDateTime::now_utc() + SELECTION_WINDOW,
        }
    }
}

impl Expiring for PendingSelection {
    fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }
}

/// A caller holding a team-scoped parent credential.
#[derive(Debug)]
pub struct AuthenticatedSession {
    pub parent_credential: SecretString,
    pub entity_id: Option<String>,
    pub profile: Profile,
    pub team: TeamName,
    pub tokens: IdentityTokens,
    pub origin: FlowOrigin,
    pub expires_at: OffsetDateTime,
}

impl Expiring for AuthenticatedSession {
    fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }
}

/// Outcome of an atomic claim on a pending selection.
#[derive(Debug)]
pub enum PendingClaim {
    /// The record existed, the team was a candidate, and the record is gone.
    Claimed(Arc<PendingSelection>),
    /// The record exists but the team is not one of its candidates. The
    /// record is left in place.
    NotACandidate,
    /// No live record under that id.
    Missing,
}

/// Storage for broker state.
///
/// Implementations must make `take_exchange`, `claim_pending`, and the
/// expiry-deletion in the `find_*` methods atomic per key, so two concurrent
/// callers can never both redeem the same record.
pub trait SessionStore: Send + Sync + 'static {
    fn insert_exchange(
        &self,
        state: String,
        exchange: PkceExchange,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove and return the exchange for `state`. Expired records are
    /// removed and reported as absent.
    fn take_exchange(
        &self,
        state: &str,
    ) -> impl Future<Output = Result<Option<PkceExchange>, Error>> + Send;

    fn insert_pending(
        &self,
        id: SelectionId,
        pending: PendingSelection,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn find_pending(
        &self,
        id: &SelectionId,
    ) -> impl Future<Output = Result<Option<Arc<PendingSelection>>, Error>> + Send;

    /// Remove the pending record only if `team` is one of its candidates.
    fn claim_pending(
        &self,
        id: &SelectionId,
        team: &TeamName,
    ) -> impl Future<Output = Result<PendingClaim, Error>> + Send;

    fn insert_session(
        &self,
        id: SessionId,
        session: AuthenticatedSession,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn find_session(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<Option<Arc<AuthenticatedSession>>, Error>> + Send;

    /// Delete a session (logout). Returns whether a record was removed.
    fn delete_session(&self, id: &SessionId) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Remove every expired record. Returns how many were removed.
    fn purge_expired(&self) -> impl Future<Output = Result<usize, Error>> + Send;
}
