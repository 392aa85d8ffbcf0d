use axum::extract::{FromRequest, Request};
use axum::http::header::CONTENT_TYPE;
use axum::{Form, Json};
use serde::de::DeserializeOwned;

use super::error::ApiError;
use crate::error::Error;

/// Request body accepted as either JSON or an urlencoded form.
///
/// The team-selection endpoint is posted to by both scripts (JSON) and the
/// selection page (form). Any other body, including one without a content
/// type, is read as JSON and rejected as [`Error::InvalidRequest`].
///
/// ```rust,ignore
/// async fn select(JsonOrForm(body): JsonOrForm<SelectTeamRequest>) -> impl IntoResponse {
///     // ...
/// }
/// ```
#[derive(Debug)]
pub struct JsonOrForm<T>(pub T);

impl<T, S> FromRequest<S> for JsonOrForm<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            let Form(value) = Form::<T>::from_request(req, state)
                .await
                .map_err(|e| ApiError(Error::InvalidRequest(e.body_text())))?;
            Ok(Self(value))
        } else {
            let Json(value) = Json::<T>::from_request(req, state)
                .await
                .map_err(|e| ApiError(Error::InvalidRequest(e.body_text())))?;
            Ok(Self(value))
        }
    }
}
