//! Bearer-token auth layer: when `AppConfig::token` is set, every
//! request — `/health` included — must present an `Authorization`
//! header equal to it, literally. No token configured means no check.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use super::AppState;
use crate::error::JarvisError;

pub async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, JarvisError> {
    let Some(expected) = state.config.token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match presented {
        Some(value) if value == expected => Ok(next.run(request).await),
        _ => Err(JarvisError::Unauthorized),
    }
}
