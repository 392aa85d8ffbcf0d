use std::fmt;

/// Diagnostic from a failed upstream call (identity provider or secret store).
///
/// `status` is `None` when the request never produced a response
/// (connect failure, timeout, unreadable body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    pub status: Option<u16>,
    pub detail: String,
}

impl UpstreamFailure {
    #[must_use]
    pub fn status(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn transport(err: &reqwest::Error) -> Self {
        let detail = if err.is_timeout() {
            format!("request timed out: {err}")
        } else {
            err.to_string()
        };
        Self {
            status: None,
            detail,
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {status}: {}", self.detail),
            None => f.write_str(&self.detail),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Invalid or expired PKCE state")]
    UnknownOrExpiredState,

    #[error("Identity provider returned an error: {error}: {description}")]
    AuthorizationDenied { error: String, description: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(UpstreamFailure),

    #[error("Profile fetch failed: {0}")]
    ProfileFetchFailed(UpstreamFailure),

    #[error("Federated login failed: {0}")]
    FederatedLoginFailed(UpstreamFailure),

    #[error("Child credential creation failed: {0}")]
    ChildCredentialCreationFailed(UpstreamFailure),

    #[error("Invalid team selection: {0}")]
    InvalidTeamSelection(String),

    #[error("Invalid or expired session")]
    SessionExpiredOrUnknown,

    #[error("Assertion invalid: {0}")]
    AssertionInvalid(String),

    #[error("Signing key unavailable: {0}")]
    SigningKeyUnavailable(String),

    #[error("Session store error: {0}")]
    Store(String),
}

impl Error {
    /// Stable machine-readable code for this error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::UnknownOrExpiredState => "unknown_or_expired_state",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::InvalidRequest(_) => "invalid_request",
            Self::TokenExchangeFailed(_) => "token_exchange_failed",
            Self::ProfileFetchFailed(_) => "profile_fetch_failed",
            Self::FederatedLoginFailed(_) => "federated_login_failed",
            Self::ChildCredentialCreationFailed(_) => "child_credential_creation_failed",
            Self::InvalidTeamSelection(_) => "invalid_team_selection",
            Self::SessionExpiredOrUnknown => "session_expired_or_unknown",
            Self::AssertionInvalid(_) => "assertion_invalid",
            Self::SigningKeyUnavailable(_) => "signing_key_unavailable",
            Self::Store(_) => "store_error",
        }
    }

    /// The upstream diagnostic, if this error came from an upstream call.
    #[must_use]
    pub fn upstream(&self) -> Option<&UpstreamFailure> {
        match self {
            Self::TokenExchangeFailed(u)
            | Self::ProfileFetchFailed(u)
            | Self::FederatedLoginFailed(u)
            | Self::ChildCredentialCreationFailed(u) => Some(u),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_display_includes_status_and_body() {
        let err = Error::TokenExchangeFailed(UpstreamFailure::status(400, "invalid_grant"));
        assert_eq!(
            err.to_string(),
            "Token exchange failed: status 400: invalid_grant"
        );
        assert_eq!(err.code(), "token_exchange_failed");
        assert_eq!(err.upstream().and_then(|u| u.status), Some(400));
    }

    #[test]
    fn non_upstream_errors_have_no_diagnostic() {
        assert!(Error::UnknownOrExpiredState.upstream().is_none());
        assert!(Error::SessionExpiredOrUnknown.upstream().is_none());
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            Error::ConfigurationMissing(String::new()),
            Error::UnknownOrExpiredState,
            Error::TokenExchangeFailed(UpstreamFailure::status(500, "")),
            Error::ProfileFetchFailed(UpstreamFailure::status(500, "")),
            Error::FederatedLoginFailed(UpstreamFailure::status(500, "")),
            Error::ChildCredentialCreationFailed(UpstreamFailure::status(500, "")),
            Error::InvalidTeamSelection(String::new()),
            Error::SessionExpiredOrUnknown,
            Error::AssertionInvalid(String::new()),
        ];
        let mut codes: Vec<_> = errors.iter().map(Error::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
