use crate::state::AppState;
use apix_core::CoreError;
use apix_protocol::Principal;
use axum::http::HeaderMap;
use std::collections::HashMap;

/// Extract a bearer token from an `authorization` header per §4.1/§6
/// credential source (a). Accepts both `Bearer {token}` and a bare token.
pub fn extract_bearer(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ").or_else(|| header_value.strip_prefix("bearer "))
}

/// Resolve a `Principal` from a request's headers and query parameters,
/// honoring the three credential sources named in §6: an `authorization`
/// header, a `token` query parameter, or (for service callers)
/// `organizationId`/`userId` query parameters.
pub fn resolve_principal(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Principal, CoreError> {
    if let Some(token) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer)
    {
        return state.policy.build_context(token);
    }
    if let Some(token) = query.get("token") {
        return state.policy.build_context(token);
    }
    if let Some(org_id) = query.get("organizationId") {
        let org_slug = query.get("orgSlug").cloned().unwrap_or_else(|| org_id.clone());
        let user_id = query.get("userId").map(String::as_str);
        return Ok(state.policy.build_service_context(org_id, &org_slug, user_id));
    }
    Err(CoreError::Auth("no credentials supplied".into()))
}
