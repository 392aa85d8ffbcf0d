use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::PrivateCookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::config::ServerSettings;
use super::cookies;
use super::error::ApiError;
use super::extractor::JsonOrForm;
use super::state::AppState;
use crate::broker::{Broker, CallbackOutcome, CallbackParams, PendingGrant, SessionGrant};
use crate::error::Error;
use crate::session::SessionStore;
use crate::types::{FlowOrigin, SelectionId, SessionId, TeamName};
use crate::vault::{BuildContext, ConstrainedCredential};
use crate::well_known::JwkSet;

/// Create the broker router.
pub fn broker_routes<S: SessionStore>(broker: Arc<Broker<S>>, settings: ServerSettings) -> Router {
    let state = AppState { broker, settings };

    Router::new()
        .route("/health", get(health::<S>))
        .route("/.well-known/jwks.json", get(jwks::<S>))
        .route("/auth/login", get(login::<S>))
        .route("/cli/start", post(cli_start::<S>))
        .route("/auth/callback", get(callback::<S>))
        .route(
            "/auth/select-team",
            get(pending_selection::<S>).post(select_team::<S>),
        )
        .route("/exchange", post(exchange::<S>))
        .route("/auth/logout", post(logout::<S>))
        .with_state(state)
}

// ── Status ─────────────────────────────────────────────────────────

async fn health<S: SessionStore>(State(state): State<AppState<S>>) -> Json<serde_json::Value> {
    let mut flows = vec!["authorization_code", "cli_pkce"];
    if state.broker.assertion_exchange_enabled() {
        flows.push("assertion");
    }
    Json(json!({
        "status": "healthy",
        "auth_method": "okta_oidc",
        "flows": flows,
        "signing": state.broker.signing_posture(),
        "signing_fallbacks": state.broker.signing_fallbacks(),
    }))
}

async fn jwks<S: SessionStore>(State(state): State<AppState<S>>) -> Json<JwkSet> {
    Json(state.broker.jwks().clone())
}

// ── Flow start ─────────────────────────────────────────────────────

async fn login<S: SessionStore>(State(state): State<AppState<S>>) -> Result<Redirect, ApiError> {
    let started = state.broker.start(FlowOrigin::Interactive).await?;
    Ok(Redirect::to(&started.authorization_url))
}

async fn cli_start<S: SessionStore>(
    State(state): State<AppState<S>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = state.broker.start(FlowOrigin::Headless).await?;
    Ok(Json(json!({
        "auth_url": started.authorization_url,
        "state": started.state,
        "instructions": {
            "step_1": "Open the auth_url in your browser",
            "step_2": "Complete the identity provider login",
            "step_3": "Copy the session_id from the callback response",
            "step_4": "POST {\"session_id\": ...} to /exchange for a credential",
        },
        "note": "The callback returns a session_id directly; no code copying is needed",
    })))
}

// ── Callback ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct AuthenticatedBody {
    status: &'static str,
    flow: &'static str,
    #[serde(flatten)]
    grant: SessionGrant,
    instructions: &'static str,
}

impl AuthenticatedBody {
    fn new(grant: SessionGrant) -> Self {
        Self {
            status: "authenticated",
            flow: grant.origin.label(),
            grant,
            instructions: "POST {\"session_id\": ...} to /exchange to obtain a credential",
        }
    }
}

#[derive(Serialize)]
struct SelectionBody {
    status: &'static str,
    flow: &'static str,
    #[serde(flatten)]
    pending: PendingGrant,
    instructions: &'static str,
}

impl SelectionBody {
    fn new(pending: PendingGrant) -> Self {
        Self {
            status: "team_selection_required",
            flow: pending.origin.label(),
            pending,
            instructions: "POST {\"temp_session_id\": ..., \"selected_team\": ...} to /auth/select-team",
        }
    }
}

fn authenticated_response(
    settings: &ServerSettings,
    jar: PrivateCookieJar,
    grant: SessionGrant,
) -> Response {
    match grant.origin {
        FlowOrigin::Interactive => {
            let cookie = cookies::session_cookie(
                &settings.session_cookie_name,
                &grant.session_id,
                settings.secure_cookies,
            );
            (jar.add(cookie), Json(AuthenticatedBody::new(grant))).into_response()
        }
        FlowOrigin::Headless => Json(AuthenticatedBody::new(grant)).into_response(),
    }
}

async fn callback<S: SessionStore>(
    State(state): State<AppState<S>>,
    jar: PrivateCookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<Response, ApiError> {
    match state.broker.callback(params).await? {
        CallbackOutcome::Authenticated(grant) => {
            Ok(authenticated_response(&state.settings, jar, grant))
        }
        CallbackOutcome::TeamSelectionPending(pending) => match pending.origin {
            FlowOrigin::Interactive => {
                let encoded = urlencoding::encode(&pending.temp_session_id.0);
                Ok(Redirect::to(&format!("/auth/select-team?temp_session_id={encoded}"))
                    .into_response())
            }
            FlowOrigin::Headless => Ok(Json(SelectionBody::new(pending)).into_response()),
        },
    }
}

// ── Team selection ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct SelectionQuery {
    temp_session_id: SelectionId,
}

async fn pending_selection<S: SessionStore>(
    State(state): State<AppState<S>>,
    Query(query): Query<SelectionQuery>,
) -> Result<Json<SelectionBody>, ApiError> {
    let pending = state.broker.pending_selection(&query.temp_session_id).await?;
    Ok(Json(SelectionBody::new(pending)))
}

#[derive(Deserialize)]
struct SelectTeamRequest {
    temp_session_id: SelectionId,
    selected_team: TeamName,
}

async fn select_team<S: SessionStore>(
    State(state): State<AppState<S>>,
    jar: PrivateCookieJar,
    JsonOrForm(body): JsonOrForm<SelectTeamRequest>,
) -> Result<Response, ApiError> {
    let grant = state
        .broker
        .select_team(&body.temp_session_id, body.selected_team)
        .await?;
    Ok(authenticated_response(&state.settings, jar, grant))
}

// ── Exchange ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ExchangeRequest {
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(default)]
    assertion: Option<String>,
    #[serde(flatten)]
    context: BuildContext,
}

async fn exchange<S: SessionStore>(
    State(state): State<AppState<S>>,
    jar: PrivateCookieJar,
    JsonOrForm(body): JsonOrForm<ExchangeRequest>,
) -> Result<Json<ConstrainedCredential>, ApiError> {
    if let Some(assertion) = &body.assertion {
        let credential = state
            .broker
            .exchange_assertion(assertion, &body.context)
            .await?;
        return Ok(Json(credential));
    }

    let session_id = body
        .session_id
        .or_else(|| cookies::get_session_id(&jar, &state.settings.session_cookie_name))
        .ok_or_else(|| Error::InvalidRequest("session_id or assertion is required".into()))?;

    let credential = state.broker.exchange(&session_id, &body.context).await?;
    Ok(Json(credential))
}

// ── Logout ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LogoutRequest {
    session_id: SessionId,
}

async fn logout<S: SessionStore>(
    State(state): State<AppState<S>>,
    jar: PrivateCookieJar,
    body: Bytes,
) -> Result<(PrivateCookieJar, Json<serde_json::Value>), ApiError> {
    let from_body = if body.is_empty() {
        None
    } else {
        let request: LogoutRequest = serde_json::from_slice(&body)
            .map_err(|e| Error::InvalidRequest(format!("logout body: {e}")))?;
        Some(request.session_id)
    };
    let session_id = from_body
        .or_else(|| cookies::get_session_id(&jar, &state.settings.session_cookie_name));

    if let Some(session_id) = &session_id {
        state.broker.logout(session_id).await?;
    }

    let clear_cookie = cookies::clear_session_cookie(&state.settings.session_cookie_name);
    Ok((jar.remove(clear_cookie), Json(json!({"status": "logged_out"}))))
}
