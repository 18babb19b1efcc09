use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::task;
use tracing::{error, info, warn};

use crate::canonical::InboundPayload;
use crate::pipeline::{process_inbound_email, PipelineError, PipelineOutcome};

use super::state::AppState;
use super::verify::{rejection_status, verify_mailgun};

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub(super) async fn ingest_inbound_email(
    State(state): State<AppState>,
    request: Request,
) -> Response {
    let payload = match decode_payload(&state, request).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    if let Err(reason) = verify_mailgun(
        state.signing_key.as_deref(),
        state.require_signature,
        &payload.anti_replay_fields(),
    ) {
        warn!("inbound email webhook rejected: {}", reason);
        return (
            rejection_status(reason),
            Json(json!({"ok": false, "error": reason})),
        )
            .into_response();
    }

    let deps = state.deps.clone();
    let settings = state.settings;
    let result =
        task::spawn_blocking(move || process_inbound_email(&deps, settings, &payload)).await;

    match result {
        Ok(Ok(outcome)) => (StatusCode::OK, Json(outcome_body(&outcome))).into_response(),
        Ok(Err(PipelineError::TenantNotFound(recipient))) => {
            info!("inbound email for unknown recipient {:?}", recipient);
            (
                StatusCode::NOT_FOUND,
                Json(json!({"ok": false, "error": "tenant_not_found"})),
            )
                .into_response()
        }
        Ok(Err(PipelineError::Store(err))) => {
            error!("inbound email pipeline store failure: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": "store_unavailable"})),
            )
                .into_response()
        }
        Err(err) => {
            error!("inbound email pipeline task failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": "internal_error"})),
            )
                .into_response()
        }
    }
}

fn outcome_body(outcome: &PipelineOutcome) -> serde_json::Value {
    match outcome {
        PipelineOutcome::LeadCreated { lead_id, .. } => json!({"ok": true, "lead_id": lead_id}),
        PipelineOutcome::DuplicateDelivery => json!({"ok": true, "deduped": true}),
        PipelineOutcome::DuplicateLead => json!({"ok": true, "deduped_lead": true}),
        PipelineOutcome::Blocked(reason) => json!({"ok": true, "blocked": reason.as_str()}),
        PipelineOutcome::GmailVerification { code: Some(code) } => {
            json!({"ok": true, "gmail_verification": true, "code": code})
        }
        PipelineOutcome::GmailVerification { code: None } => {
            json!({"ok": true, "gmail_verification": true})
        }
    }
}

fn bad_form() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"ok": false, "error": "bad_form"})),
    )
        .into_response()
}

/// Reads multipart or urlencoded form fields. File parts are skipped.
async fn decode_payload(state: &AppState, request: Request) -> Result<InboundPayload, Response> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false);

    if !is_multipart {
        let body = Bytes::from_request(request, state)
            .await
            .map_err(IntoResponse::into_response)?;
        return InboundPayload::from_urlencoded(&body).map_err(|err| {
            warn!("inbound email body is not form-encoded: {}", err);
            bad_form()
        });
    }

    let mut multipart = Multipart::from_request(request, state).await.map_err(|err| {
        warn!("inbound email multipart rejected: {}", err);
        bad_form()
    })?;
    let mut payload = InboundPayload::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!("inbound email multipart field failed: {}", err);
                return Err(bad_form());
            }
        };
        if field.file_name().is_some() {
            continue;
        }
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let value = field.text().await.map_err(|err| {
            warn!("inbound email field {} unreadable: {}", name, err);
            bad_form()
        })?;
        payload.insert(name, value);
    }
    Ok(payload)
}
