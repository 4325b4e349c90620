use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use license_sync_core::{Entitlement, Plan};

use crate::problem::ErrorResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    active: bool,
    expires_at: DateTime<Utc>,
    plan: Plan,
}

/// Read-only entitlement lookup for client apps; `account_id` wins when both are given.
pub async fn lookup(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    let repo = state.storage().entitlements();
    let found = match (non_blank(&query.account_id), non_blank(&query.device_id)) {
        (Some(account_id), _) => repo.fetch_by_account(account_id).await,
        (None, Some(device_id)) => repo.find_latest_by_device(device_id).await,
        (None, None) => {
            return Err(ErrorResponse::bad_request("account_id or device_id required"));
        }
    };

    let entitlement: Entitlement = found
        .map_err(|err| {
            error!(stage = "reconcile", error = %err, "failed to load entitlement");
            ErrorResponse::internal("failed to load entitlement")
        })?
        .ok_or_else(|| ErrorResponse::new(StatusCode::NOT_FOUND, "entitlement not found"))?;

    Ok(Json(StatusResponse {
        active: entitlement.is_active(state.now()),
        expires_at: entitlement.expires_at,
        plan: entitlement.plan,
    }))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use chrono::Duration;
    use serde_json::json;

    use license_sync_storage::{Database, EntitlementGrant};

    use crate::test_support::{at, billing_config, json_body, memory_database, send, test_state};

    async fn seed(database: &Database, account_id: &str, device_id: &str, expires_at: &str) {
        database
            .entitlements()
            .upsert_for_account(
                account_id,
                &EntitlementGrant {
                    device_id: Some(device_id),
                    expires_at: at(expires_at),
                    plan: Plan::Annual,
                    notes: "seed",
                    granted_at: at(expires_at) - Duration::days(365),
                },
            )
            .await
            .expect("seed entitlement");
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn reports_active_entitlement_by_account() {
        let database = memory_database().await;
        seed(&database, "acct-1", "dev-1", "2024-06-01T00:00:00Z").await;
        let state = test_state(&database, billing_config(), None, at("2024-01-01T00:00:00Z"));

        let response = send(state, get("/entitlements/status?account_id=acct-1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "active": true, "expires_at": "2024-06-01T00:00:00Z", "plan": "annual" })
        );
    }

    #[tokio::test]
    async fn reports_expired_entitlement_by_device() {
        let database = memory_database().await;
        seed(&database, "acct-1", "dev-1", "2024-06-01T00:00:00Z").await;
        let state = test_state(&database, billing_config(), None, at("2024-06-01T00:00:00Z"));

        let response = send(state, get("/entitlements/status?device_id=dev-1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["active"], json!(false));
    }

    #[tokio::test]
    async fn unknown_subject_is_not_found() {
        let database = memory_database().await;
        let state = test_state(&database, billing_config(), None, at("2024-01-01T00:00:00Z"));

        let response = send(state, get("/entitlements/status?device_id=nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lookup_without_identifiers_is_rejected() {
        let database = memory_database().await;
        let state = test_state(&database, billing_config(), None, at("2024-01-01T00:00:00Z"));

        let response = send(state, get("/entitlements/status?account_id=")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
