use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::Error;

/// HTTP rendering of a broker [`Error`].
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    upstream_status: Option<u16>,
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::UnknownOrExpiredState
            | Error::AuthorizationDenied { .. }
            | Error::InvalidRequest(_)
            | Error::InvalidTeamSelection(_) => StatusCode::BAD_REQUEST,
            Error::SessionExpiredOrUnknown | Error::AssertionInvalid(_) => {
                StatusCode::UNAUTHORIZED
            }
            Error::TokenExchangeFailed(_)
            | Error::ProfileFetchFailed(_)
            | Error::FederatedLoginFailed(_)
            | Error::ChildCredentialCreationFailed(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "Request failed");
        }
        let body = ErrorBody {
            error: self.0.code(),
            message: self.0.to_string(),
            upstream_status: self.0.upstream().and_then(|u| u.status),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamFailure;

    #[test]
    fn caller_errors_are_bad_request() {
        assert_eq!(
            ApiError(Error::UnknownOrExpiredState).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(Error::InvalidTeamSelection("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn session_and_assertion_errors_are_unauthorized() {
        assert_eq!(
            ApiError(Error::SessionExpiredOrUnknown).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError(Error::AssertionInvalid("bad".into())).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn upstream_errors_are_bad_gateway() {
        let e = Error::FederatedLoginFailed(UpstreamFailure::status(400, "role"));
        assert_eq!(ApiError(e).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_errors_are_server_errors() {
        assert_eq!(
            ApiError(Error::SigningKeyUnavailable("k".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError(Error::Store("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
