use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, info, warn};

use license_sync_core::signature::SIGNATURE_HEADER;
use license_sync_core::{
    classify, resolve_subject, BillingEvent, ClassifierError, GrantEvent, PaymentOutcome,
    SignatureError,
};

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Entry point for provider deliveries.
///
/// Authenticates the raw body, classifies the event and dispatches it.
/// Deliveries that can never succeed get a 400; only a persistence failure
/// answers 500 so the provider redelivers.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = process(&state, &headers, &body).await;
    let kind = match &result {
        Ok(kind) => *kind,
        Err(problem) if problem.status().is_server_error() => "failed",
        Err(_) => "rejected",
    };
    histogram!("webhook_ack_latency_seconds", "kind" => kind).record(start.elapsed().as_secs_f64());

    result.map(|_| (StatusCode::OK, Json(json!({ "received": true }))).into_response())
}

async fn process(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<&'static str, ProblemResponse> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .map(|value| value.to_str())
        .transpose()
        .map_err(|_| {
            reject_delivery(SignatureError::InvalidSignature(
                "header is not visible ascii",
            ))
        })?;

    let event = state
        .verifier()
        .verify(body, signature, state.now())
        .map_err(reject_delivery)?;

    let billing_event = classify(&event).map_err(reject_object)?;
    let kind = billing_event.metric_kind();
    counter!("webhook_events_total", "kind" => kind).increment(1);
    info!(
        stage = "ingress",
        event_id = %event.id,
        event_type = %event.event_type,
        livemode = ?event.livemode,
        kind,
        "verified provider event"
    );

    match billing_event {
        BillingEvent::EntitlementGranted(grant) => apply_grant(state, &grant).await?,
        BillingEvent::InvoicePaid(invoice) => {
            state.ledger().record(PaymentOutcome::Paid, &invoice).await;
        }
        BillingEvent::InvoiceFailed(invoice) => {
            state.ledger().record(PaymentOutcome::Failed, &invoice).await;
        }
        BillingEvent::Ignored {
            event_id,
            event_type,
        } => {
            info!(stage = "classifier", %event_id, %event_type, "ignoring unhandled event type");
        }
    }

    Ok(kind)
}

async fn apply_grant(state: &AppState, grant: &GrantEvent) -> Result<(), ProblemResponse> {
    let subject = resolve_subject(grant).map_err(|err| {
        counter!("webhook_rejected_total", "reason" => "missing_identity").increment(1);
        warn!(
            stage = "classifier",
            event_id = %grant.event_id,
            session_id = ?grant.session_id,
            "grant carries no identity"
        );
        ProblemResponse::new(StatusCode::BAD_REQUEST, "missing_identity", err.to_string())
    })?;

    state
        .reconciler()
        .reconcile(&subject, &grant.event_id)
        .await
        .map_err(|err| {
            counter!("webhook_rejected_total", "reason" => "persistence_failure").increment(1);
            error!(
                stage = "reconcile",
                event_id = %grant.event_id,
                %subject,
                error = %err,
                "failed to apply grant"
            );
            ProblemResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "persistence_failure",
                "failed to persist entitlement",
            )
        })?;

    Ok(())
}

fn reject_delivery(err: SignatureError) -> ProblemResponse {
    let reason = err.metric_reason();
    counter!("webhook_rejected_total", "reason" => reason).increment(1);
    warn!(stage = "ingress", reason, error = %err, "rejected delivery");
    ProblemResponse::new(StatusCode::BAD_REQUEST, reason, err.to_string())
}

fn reject_object(err: ClassifierError) -> ProblemResponse {
    counter!("webhook_rejected_total", "reason" => "invalid_payload").increment(1);
    warn!(stage = "classifier", error = %err, "malformed event object");
    ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_payload", err.to_string())
}
