use crate::state::AppState;
use axum::{
    extract::FromRequestParts,
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};

/// Where unauthenticated staff requests are sent.
pub const LOGIN_PATH: &str = "/admin/login/";

/// A request authenticated as staff via `Authorization: Bearer <token>`.
///
/// Add this as a handler parameter to require staff access. Anything else is
/// answered with `302 Found` pointing at the login page, carrying the
/// requested path in `next`.
pub struct StaffUser;

impl FromRequestParts<AppState> for StaffUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match (presented, state.staff_token.as_deref()) {
            (Some(token), Some(expected)) if token == expected => Ok(StaffUser),
            _ => {
                tracing::debug!("redirecting unauthenticated request for {}", parts.uri.path());
                Err(login_redirect(parts.uri.path()))
            }
        }
    }
}

fn login_redirect(next: &str) -> Response {
    let location = format!("{}?next={}", LOGIN_PATH, next);
    let value = HeaderValue::from_str(&location)
        .unwrap_or_else(|_| HeaderValue::from_static(LOGIN_PATH));
    (StatusCode::FOUND, [(header::LOCATION, value)]).into_response()
}
