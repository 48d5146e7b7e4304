//! Bearer-token guard for the admin routes

use crate::admin::AdminState;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use lanbridge_core::auth::verify_bearer;
use tracing::warn;

/// Rejects requests without the configured bearer token. A relay started
/// without `--admin-token` lets every request through.
pub async fn require_bearer(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.token.as_deref() {
        let header = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !verify_bearer(header, expected) {
            warn!(path = %request.uri().path(), "Admin request rejected: bad or missing token");
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
            )
                .into_response();
        }
    }
    next.run(request).await
}
