use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use tracing::debug;

use super::ApiError;
use crate::state::AppState;

/// Bearer credential presented by a runner, checked against the shared secret.
#[derive(Clone, Debug)]
pub struct RunnerAuth;

#[async_trait]
impl FromRequestParts<AppState> for RunnerAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.config.auth_bypass {
            return Ok(RunnerAuth);
        }
        let presented = extract_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        match state.config.runner_shared_secret.as_deref() {
            Some(secret) if secret == presented => Ok(RunnerAuth),
            Some(_) => {
                debug!("runner presented a wrong secret");
                Err(ApiError::Unauthorized)
            }
            None => Err(ApiError::Unauthorized),
        }
    }
}

fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
