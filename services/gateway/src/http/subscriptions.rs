use crate::auth::resolve_principal;
use crate::http::response::{bad_request, core_error_response, forbidden, unauthorized};
use crate::state::AppState;
use apix_core::{CoreError, LogEventInput};
use apix_protocol::http::{CreateSubscriptionRequest, SubscriptionResponse};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;

fn to_response(sub: apix_protocol::Subscription) -> SubscriptionResponse {
    SubscriptionResponse {
        subscription_id: sub.subscription_id,
        channel: sub.channel,
        filters: sub.filters,
    }
}

pub async fn create_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<CreateSubscriptionRequest>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "create", "subscription") {
        return forbidden("create", "subscription");
    }
    if !apix_protocol::channel::is_valid_channel_name(&body.channel) {
        return bad_request(format!("invalid channel name: {}", body.channel));
    }

    match state.subscriptions.create(&principal, &body.channel, body.filters).await {
        Ok(sub) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "create",
                        resource_type: "subscription",
                        resource_id: Some(&sub.subscription_id),
                        old_values: None,
                        new_values: serde_json::to_value(&sub).ok(),
                        success: true,
                        ip_address: None,
                        user_agent: None,
                    },
                )
                .await;
            (axum::http::StatusCode::CREATED, Json(to_response(sub))).into_response()
        }
        Err(e) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "create",
                        resource_type: "subscription",
                        resource_id: None,
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

pub async fn list_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "read", "subscription") {
        return forbidden("read", "subscription");
    }
    let Some(user_id) = &principal.user_id else {
        return core_error_response(CoreError::InvalidArgument("service principals have no subscriptions".into()));
    };
    if let Err(e) = state.subscriptions.hydrate_org(&principal.org_id).await {
        return core_error_response(e);
    }

    let subs: Vec<SubscriptionResponse> = state
        .subscriptions
        .list_for_user(&principal.org_id, user_id)
        .into_iter()
        .map(to_response)
        .collect();
    Json(serde_json::json!({ "subscriptions": subs })).into_response()
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(subscription_id): Path<String>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "delete", "subscription") {
        return forbidden("delete", "subscription");
    }

    match state.subscriptions.delete(&principal.org_id, &subscription_id).await {
        Ok(()) => {
            let _ = state
                .audit
                .log_event(
                    &principal,
                    LogEventInput {
                        action: "delete",
                        resource_type: "subscription",
                        resource_id: Some(&subscription_id),
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
                        resource_type: "subscription",
                        resource_id: Some(&subscription_id),
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
