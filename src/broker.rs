//! The exchange orchestrator.
//!
//! ```text
//! FlowStarted ──callback──▶ CallbackReceived ──one team──▶ Authenticated
//!                                    │
//!                                    └──several teams──▶ TeamSelectionPending ──choice──▶ Authenticated
//! ```
//!
//! Every state lives in the [`SessionStore`]; the broker itself holds no
//! per-flow state. Upstream failures are returned as-is and never retried:
//! the caller restarts the step.

use std::sync::Arc;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;
use crate::oauth::{IdpClient, Profile};
use crate::pkce::{PkceFlowManager, generate_opaque_id};
use crate::session::{
    AuthenticatedSession, IdentityTokens, PendingClaim, PendingSelection, SESSION_TTL,
    SessionStore,
};
use crate::teams::TeamTable;
use crate::token::{AssertionMinter, AssertionVerifier, SigningPosture};
use crate::types::{FlowOrigin, SelectionId, SessionId, TeamName};
use crate::vault::{
    BuildContext, ChildCredentialRequest, ConstrainedCredential, IssuanceProfile,
    SecretStoreClient,
};
use crate::well_known::JwkSet;

/// Flow states, for logging transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    FlowStarted,
    CallbackReceived,
    TeamSelectionPending,
    Authenticated,
}

/// Query parameters of the identity provider's redirect.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// A started flow: where to send the user.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct FlowStart {
    pub authorization_url: String,
    pub state: String,
    pub origin: FlowOrigin,
}

/// What an authenticated caller is told. Never carries the parent credential.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct SessionGrant {
    pub session_id: SessionId,
    pub team: TeamName,
    pub origin: FlowOrigin,
    pub user: String,
    pub name: String,
    pub groups: Vec<String>,
    pub entity_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

/// What a caller with several candidate teams is told.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
pub struct PendingGrant {
    pub temp_session_id: SelectionId,
    pub available_teams: Vec<TeamName>,
    pub origin: FlowOrigin,
    pub user: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl PendingGrant {
    fn new(id: SelectionId, pending: &PendingSelection) -> Self {
        Self {
            temp_session_id: id,
            available_teams: pending.candidates.clone(),
            origin: pending.origin,
            user: pending.profile.email_or_unknown().to_owned(),
            name: pending.profile.name_or_unknown().to_owned(),
            expires_at: pending.expires_at,
        }
    }
}

#[derive(Debug)]
pub enum CallbackOutcome {
    Authenticated(SessionGrant),
    TeamSelectionPending(PendingGrant),
}

/// Coordinates the identity provider, role mapping, assertion minting, and
/// secret store through a [`SessionStore`].
pub struct Broker<S> {
    flows: PkceFlowManager<S>,
    store: Arc<S>,
    idp: IdpClient,
    vault: SecretStoreClient,
    minter: AssertionMinter,
    verifier: Option<AssertionVerifier>,
    jwks: JwkSet,
    teams: TeamTable,
    session_profile: IssuanceProfile,
    assertion_profile: IssuanceProfile,
}

impl<S: SessionStore> Broker<S> {
    /// A broker with the built-in team table, both default issuance
    /// profiles, and the assertion exchange disabled.
    #[must_use]
    pub fn new(
        idp: IdpClient,
        vault: SecretStoreClient,
        minter: AssertionMinter,
        store: Arc<S>,
    ) -> Self {
        Self {
            flows: PkceFlowManager::new(Arc::clone(&store)),
            store,
            idp,
            vault,
            minter,
            verifier: None,
            jwks: JwkSet::default(),
            teams: TeamTable::builtin(),
            session_profile: IssuanceProfile::session(),
            assertion_profile: IssuanceProfile::assertion(),
        }
    }

    /// Replace the group-to-team table.
    #[must_use]
    pub fn with_teams(mut self, teams: TeamTable) -> Self {
        self.teams = teams;
        self
    }

    /// Enable the assertion exchange against `jwks`. The same set is served
    /// at the well-known endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if a key cannot be decoded.
    pub fn with_assertion_keys(
        mut self,
        jwks: JwkSet,
        issuer: &str,
        audience: &str,
    ) -> Result<Self, Error> {
        self.verifier = Some(AssertionVerifier::from_jwks(&jwks, issuer, audience)?);
        self.jwks = jwks;
        Ok(self)
    }

    #[must_use]
    pub fn with_issuance_profiles(
        mut self,
        session: IssuanceProfile,
        assertion: IssuanceProfile,
    ) -> Self {
        self.session_profile = session;
        self.assertion_profile = assertion;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[must_use]
    pub fn jwks(&self) -> &JwkSet {
        &self.jwks
    }

    #[must_use]
    pub fn teams(&self) -> &TeamTable {
        &self.teams
    }

    #[must_use]
    pub fn signing_posture(&self) -> SigningPosture {
        self.minter.posture()
    }

    #[must_use]
    pub fn signing_fallbacks(&self) -> u64 {
        self.minter.fallback_count()
    }

    #[must_use]
    pub fn assertion_exchange_enabled(&self) -> bool {
        self.verifier.is_some()
    }

    /// Begin a PKCE flow.
    pub async fn start(&self, origin: FlowOrigin) -> Result<FlowStart, Error> {
        let pending = self.flows.start(origin).await?;
        let authorization_url = self.idp.authorization_url(&pending);

        tracing::info!(state = ?FlowState::FlowStarted, origin = origin.label(), "Flow started");

        Ok(FlowStart {
            authorization_url,
            state: pending.state,
            origin,
        })
    }

    /// Handle the identity provider's redirect.
    ///
    /// # Errors
    ///
    /// [`Error::AuthorizationDenied`] if the provider sent `error`,
    /// [`Error::InvalidRequest`] if `code` or `state` is missing,
    /// [`Error::UnknownOrExpiredState`] if `state` cannot be redeemed, and
    /// any upstream failure from the token, profile, or login calls.
    pub async fn callback(&self, params: CallbackParams) -> Result<CallbackOutcome, Error> {
        if let Some(error) = params.error {
            let description = params
                .error_description
                .unwrap_or_else(|| "Unknown error".into());
            tracing::warn!(%error, %description, "Identity provider returned an error");
            return Err(Error::AuthorizationDenied { error, description });
        }
        let code = params
            .code
            .ok_or_else(|| Error::InvalidRequest("missing code".into()))?;
        let state = params
            .state
            .ok_or_else(|| Error::InvalidRequest("missing state".into()))?;

        let redeemed = self.flows.redeem(&state, &code).await?;

        let tokens = self
            .idp
            .exchange_code(&redeemed.code, &redeemed.code_verifier)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Token exchange failed"))?;
        let profile = self
            .idp
            .fetch_profile(tokens.access_token.expose_secret())
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Profile fetch failed"))?;
        let tokens = tokens.into_identity_tokens();

        let candidates = self.teams.resolve_teams(&profile.groups);
        tracing::info!(
            state = ?FlowState::CallbackReceived,
            user = profile.email_or_unknown(),
            candidates = candidates.len(),
            "Callback redeemed"
        );

        if candidates.len() > 1 {
            let id = SelectionId(generate_opaque_id());
            let pending = PendingSelection::new(profile, candidates, tokens, redeemed.origin);
            let grant = PendingGrant::new(id.clone(), &pending);
            self.store.insert_pending(id, pending).await?;

            tracing::info!(
                state = ?FlowState::TeamSelectionPending,
                user = %grant.user,
                teams = ?grant.available_teams,
                "Awaiting team selection"
            );
            return Ok(CallbackOutcome::TeamSelectionPending(grant));
        }

        let primary = self.teams.resolve_primary(&profile.groups);
        let (team, role) = (primary.team.clone(), primary.role.clone());
        let grant = self
            .authenticate(profile, team, &role, tokens, redeemed.origin)
            .await?;
        Ok(CallbackOutcome::Authenticated(grant))
    }

    /// The candidates of a pending selection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExpiredOrUnknown`] if no live selection exists.
    pub async fn pending_selection(&self, id: &SelectionId) -> Result<PendingGrant, Error> {
        let pending = self
            .store
            .find_pending(id)
            .await?
            .ok_or(Error::SessionExpiredOrUnknown)?;
        Ok(PendingGrant::new(id.clone(), &pending))
    }

    /// Confirm one of the offered teams.
    ///
    /// The pending record is claimed before the secret-store login, so two
    /// concurrent confirmations cannot both authenticate. A failed login
    /// consumes the selection.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTeamSelection`] if `team` was not offered (the
    /// selection stays open), [`Error::SessionExpiredOrUnknown`] if the
    /// selection is gone, and any signing or login failure.
    pub async fn select_team(
        &self,
        id: &SelectionId,
        team: TeamName,
    ) -> Result<SessionGrant, Error> {
        let pending = match self.store.claim_pending(id, &team).await? {
            PendingClaim::Claimed(pending) => pending,
            PendingClaim::NotACandidate => {
                tracing::warn!(%team, "Team selection outside the offered list");
                return Err(Error::InvalidTeamSelection(format!(
                    "{team} is not one of the offered teams"
                )));
            }
            PendingClaim::Missing => return Err(Error::SessionExpiredOrUnknown),
        };

        let role = self.teams.resolve_role(&pending.profile.groups, Some(&team));
        self.authenticate(
            pending.profile.clone(),
            team,
            &role,
            pending.tokens.clone(),
            pending.origin,
        )
        .await
    }

    async fn authenticate(
        &self,
        profile: Profile,
        team: TeamName,
        role: &str,
        tokens: IdentityTokens,
        origin: FlowOrigin,
    ) -> Result<SessionGrant, Error> {
        let assertion = self.minter.mint(&profile, &team)?;
        let parent = self
            .vault
            .login(assertion.token.expose_secret(), role)
            .await
            .inspect_err(|e| tracing::error!(error = %e, %team, role, "Federated login failed"))?;

        let session_id = SessionId(generate_opaque_id());
        let expires_at = OffsetDateTime::now_utc() + SESSION_TTL;
        let grant = SessionGrant {
            session_id: session_id.clone(),
            team: team.clone(),
            origin,
            user: profile.email_or_unknown().to_owned(),
            name: profile.name_or_unknown().to_owned(),
            groups: profile.groups.clone(),
            entity_id: parent.entity_id.clone(),
            expires_at,
        };

        self.store
            .insert_session(
                session_id,
                AuthenticatedSession {
                    parent_credential: parent.token,
                    entity_id: parent.entity_id,
                    profile,
                    team,
                    tokens,
                    origin,
                    expires_at,
                },
            )
            .await?;

        tracing::info!(
            state = ?FlowState::Authenticated,
            session_id = %grant.session_id,
            team = %grant.team,
            user = %grant.user,
            degraded_signing = assertion.degraded,
            "Session authenticated"
        );
        Ok(grant)
    }

    /// Issue a child credential for an authenticated session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionExpiredOrUnknown`] if the session is absent or
    /// expired (an expired one is deleted), or the issuance failure.
    pub async fn exchange(
        &self,
        session_id: &SessionId,
        context: &BuildContext,
    ) -> Result<ConstrainedCredential, Error> {
        let session = self
            .store
            .find_session(session_id)
            .await?
            .ok_or(Error::SessionExpiredOrUnknown)?;

        let issuance = &self.session_profile;
        let request = ChildCredentialRequest {
            profile: &session.profile,
            team: &session.team,
            context,
            issuance,
            policies: issuance.policies_for(&self.teams, &session.team),
        };
        self.vault
            .issue_child_credential(&session.parent_credential, request)
            .await
            .inspect_err(|e| tracing::error!(error = %e, %session_id, "Child credential creation failed"))
    }

    /// Verify a caller-signed assertion and issue a child credential for the
    /// team it names, without a prior session.
    ///
    /// # Errors
    ///
    /// [`Error::AssertionInvalid`] if the exchange is not configured or the
    /// assertion fails verification; otherwise signing, login, or issuance
    /// failures.
    pub async fn exchange_assertion(
        &self,
        assertion: &str,
        context: &BuildContext,
    ) -> Result<ConstrainedCredential, Error> {
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| Error::AssertionInvalid("assertion exchange is not configured".into()))?;
        let claims = verifier
            .verify(assertion)
            .inspect_err(|e| tracing::warn!(error = %e, "Rejected caller assertion"))?;

        let profile = claims.profile();
        let team = match claims.team {
            Some(team) => TeamName(team),
            None => self.teams.resolve_primary(&profile.groups).team.clone(),
        };
        let role = self.teams.role_for(&team);

        let minted = self.minter.mint(&profile, &team)?;
        let parent = self
            .vault
            .login(minted.token.expose_secret(), &role)
            .await
            .inspect_err(|e| tracing::error!(error = %e, %team, "Federated login failed"))?;

        let issuance = &self.assertion_profile;
        let request = ChildCredentialRequest {
            profile: &profile,
            team: &team,
            context,
            issuance,
            policies: issuance.policies_for(&self.teams, &team),
        };
        self.vault
            .issue_child_credential(&parent.token, request)
            .await
    }

    /// End a session. Unknown ids are not an error.
    pub async fn logout(&self, session_id: &SessionId) -> Result<bool, Error> {
        let removed = self.store.delete_session(session_id).await?;
        tracing::info!(%session_id, removed, "Logout");
        Ok(removed)
    }
}
