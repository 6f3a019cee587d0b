use crate::auth::resolve_principal;
use crate::http::response::{bad_request, core_error_response, forbidden, unauthorized};
use crate::state::AppState;
use apix_core::LogEventInput;
use apix_protocol::http::{AcknowledgeRequest, CreateEndpointRequest, DeliverRequest, UpdateEndpointRequest};
use apix_protocol::DeliveryEndpoint;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use uuid::Uuid;

pub async fn create_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<CreateEndpointRequest>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "create", "endpoint") {
        return forbidden("create", "endpoint");
    }

    let endpoint = DeliveryEndpoint {
        endpoint_id: Uuid::new_v4().to_string(),
        org_id: principal.org_id.clone(),
        url: body.url,
        method: body.method,
        headers: body.headers,
        timeout_ms: body.timeout_ms,
        retry_policy: body.retry_policy,
        semantics: body.semantics,
        active: true,
        dlq_enabled: body.dlq_enabled,
        signing_secret: body.signing_secret,
    };

    let audit_resource_id = endpoint.endpoint_id.clone();
    match state.delivery.register_endpoint(endpoint).await {
        Ok(endpoint_id) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "create",
                        resource_type: "endpoint",
                        resource_id: Some(&endpoint_id),
                        old_values: None,
                        new_values: None,
                        success: true,
                        ip_address: None,
                        user_agent: None,
                    },
                )
                .await;
            (axum::http::StatusCode::CREATED, Json(serde_json::json!({ "endpointId": endpoint_id }))).into_response()
        }
        Err(e) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "create",
                        resource_type: "endpoint",
                        resource_id: Some(&audit_resource_id),
                        old_values: None,
                        new_values: None,
                        success: false,
                        ip_address: None,
                        user_agent: None,
                    },
                )
                .await;
            core_error_response(e)
        }
    }
}

pub async fn list_endpoints(State(state): State<AppState>, headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "read", "endpoint") {
        return forbidden("read", "endpoint");
    }
    match state.delivery.list_endpoints(&principal.org_id).await {
        Ok(endpoints) => Json(serde_json::json!({ "endpoints": endpoints })).into_response(),
        Err(e) => core_error_response(e),
    }
}

pub async fn get_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(endpoint_id): Path<String>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "read", "endpoint") {
        return forbidden("read", "endpoint");
    }
    match state.delivery.get_endpoint(&principal.org_id, &endpoint_id).await {
        Ok(endpoint) => Json(endpoint).into_response(),
        Err(e) => core_error_response(e),
    }
}

pub async fn update_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(endpoint_id): Path<String>,
    Json(body): Json<UpdateEndpointRequest>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "update", "endpoint") {
        return forbidden("update", "endpoint");
    }
    let old = state.delivery.get_endpoint(&principal.org_id, &endpoint_id).await.ok();
    match state
        .delivery
        .update_endpoint(
            &principal.org_id,
            &endpoint_id,
            body.url,
            body.headers,
            body.timeout_ms,
            body.retry_policy,
            body.active,
        )
        .await
    {
        Ok(endpoint) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "update",
                        resource_type: "endpoint",
                        resource_id: Some(&endpoint_id),
                        old_values: old.and_then(|e| serde_json::to_value(e).ok()),
                        new_values: serde_json::to_value(&endpoint).ok(),
                        success: true,
                        ip_address: None,
                        user_agent: None,
                    },
                )
                .await;
            Json(endpoint).into_response()
        }
        Err(e) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "update",
                        resource_type: "endpoint",
                        resource_id: Some(&endpoint_id),
                        old_values: None,
                        new_values: None,
                        success: false,
                        ip_address: None,
                        user_agent: None,
                    },
                )
                .await;
            core_error_response(e)
        }
    }
}

pub async fn delete_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(endpoint_id): Path<String>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "delete", "endpoint") {
        return forbidden("delete", "endpoint");
    }
    match state.delivery.delete_endpoint(&principal.org_id, &endpoint_id).await {
        Ok(()) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "delete",
                        resource_type: "endpoint",
                        resource_id: Some(&endpoint_id),
                        old_values: None,
                        new_values: None,
                        success: true,
                        ip_address: None,
                        user_agent: None,
                    },
                )
                .await;
            axum::http::StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "delete",
                        resource_type: "endpoint",
                        resource_id: Some(&endpoint_id),
                        old_values: None,
                        new_values: None,
                        success: false,
                        ip_address: None,
                        user_agent: None,
                    },
                )
                .await;
            core_error_response(e)
        }
    }
}

/// `POST /events/{id}/deliver` -- deliver an already-logged event to one
/// or all of the tenant's registered endpoints.
pub async fn deliver_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(event_id): Path<String>,
    Json(body): Json<DeliverRequest>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "deliver", "event") {
        return forbidden("deliver", "event");
    }

    let event = match state.log.get_by_id(&principal.org_id, &event_id).await {
        Ok(event) => event,
        Err(e) => return core_error_response(e),
    };

    let endpoints = match &body.endpoint_ids {
        Some(ids) => {
            let mut endpoints = Vec::with_capacity(ids.len());
            for id in ids {
                match state.delivery.get_endpoint(&principal.org_id, id).await {
                    Ok(endpoint) => endpoints.push(endpoint),
                    Err(e) => return core_error_response(e),
                }
            }
            endpoints
        }
        None => match state.delivery.list_endpoints(&principal.org_id).await {
            Ok(endpoints) => endpoints.into_iter().filter(|e| e.active).collect(),
            Err(e) => return core_error_response(e),
        },
    };
    if endpoints.is_empty() {
        return bad_request("no active endpoints to deliver to");
    }

    let mut receipts = Vec::with_capacity(endpoints.len());
    for endpoint in &endpoints {
        match state.delivery.deliver(&principal, &state.retry, &event, endpoint).await {
            Ok(receipt) => receipts.push(receipt),
            Err(e) => return core_error_response(e),
        }
    }

    Json(serde_json::json!({ "receipts": receipts })).into_response()
}

pub async fn acknowledge_receipt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(receipt_id): Path<String>,
    Json(_body): Json<AcknowledgeRequest>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "acknowledge", "receipt") {
        return forbidden("acknowledge", "receipt");
    }
    match state.delivery.acknowledge(&principal.org_id, &receipt_id).await {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => core_error_response(e),
    }
}
