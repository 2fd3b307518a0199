use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::{
    engine::MAX_ID_LEN,
    error::ActivationError,
    store::{
        audit::{ACTION_LICENSE_ACTIVATE, ACTION_LICENSE_CREATE, ACTION_LICENSE_DEACTIVATE},
        AuditEvent, AuditQuery, LicenseStore,
    },
    token::ALGORITHM,
    AppState,
};

// ── IP extraction ────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|xff| xff.split(',').next());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());

    [forwarded, real_ip]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|ip| !ip.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Audit failures never change the response, but they are not dropped silently.
async fn audit(state: &AppState, event: AuditEvent) {
    if let Err(e) = state
        .engine
        .run_store(move |store| store.record_audit(event))
        .await
    {
        warn!(error = %e, "failed to record audit event");
    }
}

/// Malformed bodies are reported like any other invalid request.
fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ActivationError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ActivationError::InvalidRequest(rejection.body_text()))
}

/// Keep oversized ids out of the audit log.
fn clip(value: &str) -> String {
    match value.char_indices().nth(MAX_ID_LEN) {
        Some((end, _)) => value[..end].to_owned(),
        None => value.to_owned(),
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Activation ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ActivationRequest {
    pub license: String,
    pub hwid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub token: String,
    pub public_key: String,
}

pub async fn activate(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<ActivationRequest>, JsonRejection>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    let (license, hwid, result) = match parse_body(body) {
        Ok(req) => {
            let result = match state.engine.activate(&req.license, &req.hwid).await {
                Ok(assertion) => state.issuer.sign(&assertion).map_err(ActivationError::from),
                Err(e) => Err(e),
            };
            (Some(clip(&req.license)), Some(clip(&req.hwid)), result)
        }
        Err(e) => (None, None, Err(e)),
    };

    audit(
        &state,
        AuditEvent::new(
            ACTION_LICENSE_ACTIVATE,
            license,
            hwid,
            ip,
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
        ),
    )
    .await;

    match result {
        Ok(token) => Json(ActivateResponse {
            token,
            public_key: state.issuer.public_key().to_owned(),
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn deactivate(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<ActivationRequest>, JsonRejection>,
) -> Response {
    let ip = extract_ip(&headers, &addr);
    let (license, hwid, result) = match parse_body(body) {
        Ok(req) => {
            let result = state.engine.deactivate(&req.license, &req.hwid).await;
            (Some(clip(&req.license)), Some(clip(&req.hwid)), result)
        }
        Err(e) => (None, None, Err(e)),
    };

    audit(
        &state,
        AuditEvent::new(
            ACTION_LICENSE_DEACTIVATE,
            license,
            hwid,
            ip,
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
        ),
    )
    .await;

    match result {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn public_key(State(state): State<AppState>) -> Response {
    Json(json!({
        "public_key": state.issuer.public_key(),
        "kid": state.issuer.key_id(),
        "alg": format!("{ALGORITHM:?}"),
    }))
    .into_response()
}

// ── Provisioning (admin) ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateLicenseRequest {
    pub license: String,
}

pub async fn create_license(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Result<Json<CreateLicenseRequest>, JsonRejection>,
) -> Response {
    let req = match parse_body(body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    if req.license.is_empty() || req.license.len() > MAX_ID_LEN {
        return ActivationError::InvalidRequest(format!(
            "license must be between 1 and {MAX_ID_LEN} bytes"
        ))
        .into_response();
    }
    let ip = extract_ip(&headers, &addr);

    let id = req.license.clone();
    match state.engine.run_store(move |store| store.create_license(&id)).await {
        Ok(Some(record)) => {
            audit(
                &state,
                AuditEvent::new(ACTION_LICENSE_CREATE, Some(req.license), None, ip, true, None),
            )
            .await;
            (StatusCode::CREATED, Json(record)).into_response()
        }
        Ok(None) => {
            audit(
                &state,
                AuditEvent::new(
                    ACTION_LICENSE_CREATE,
                    Some(req.license),
                    None,
                    ip,
                    false,
                    Some("already exists".into()),
                ),
            )
            .await;
            (
                StatusCode::CONFLICT,
                Json(json!({"error": "license already exists"})),
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

pub async fn list_licenses(State(state): State<AppState>) -> Response {
    match state.engine.run_store(|store| store.list_licenses()).await {
        Ok(records) => Json(json!({ "licenses": records })).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_license(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.run_store(move |store| store.get_license(&id)).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => ActivationError::NotFound.into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Audit query (admin) ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub license: Option<String>,
    pub limit: Option<usize>,
}

pub async fn audit_events(
    State(state): State<AppState>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let query = AuditQuery {
        since: params.since,
        until: params.until,
        action: params.action,
        license: params.license,
        limit: params.limit.unwrap_or(100).min(1000),
    };
    match state.engine.run_store(move |store| store.list_audit(&query)).await {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => e.into_response(),
    }
}
