//! HTTP handlers for the lease API.
//!
//! Error mapping follows the error categories of the core: unknown group →
//! 404, invalid input → 400 with per-field detail, unparseable body → 422,
//! joining while a winner is active → 409, status conflicts → 400, and a
//! winner with an unparseable ref → 500.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::lease::{valid_gh_temp_ref, LeaseError, LeaseProvider, ProviderState, Request, Status};
use crate::AppState;

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_context: Option<Value>,
}

fn api_error(status: StatusCode, message: impl Into<String>, context: Option<Value>) -> Response {
    (
        status,
        Json(ApiErrorBody {
            error: message.into(),
            error_context: context,
        }),
    )
        .into_response()
}

fn lease_error_response(message: &str, err: LeaseError) -> Response {
    let status = match &err {
        LeaseError::AlreadyAcquired => StatusCode::CONFLICT,
        LeaseError::RefFormat(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    error!(error = %err, "{}", message);
    api_error(status, message, Some(Value::String(err.to_string())))
}

fn get_provider<'a>(
    state: &'a AppState,
    owner: &str,
    repo: &str,
    base_ref: &str,
) -> Result<&'a Arc<LeaseProvider>, Response> {
    state
        .orchestrator
        .get(owner, repo, base_ref)
        .map_err(|err| {
            error!(owner = %owner, repo = %repo, base_ref = %base_ref, "unknown provider requested");
            api_error(StatusCode::NOT_FOUND, err.to_string(), None)
        })
}

// =============================================================================
// Input validation
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AcquireBody {
    #[serde(default)]
    head_sha: String,
    #[serde(default)]
    head_ref: String,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    status: Option<Status>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    #[serde(default)]
    head_sha: String,
    #[serde(default)]
    head_ref: String,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    status: Option<Status>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct InputValidationError {
    failed_field: &'static str,
    tag: &'static str,
    value: String,
}

fn validate_common(head_sha: &str, head_ref: &str, priority: i64) -> Vec<InputValidationError> {
    let mut errors = Vec::new();
    if head_sha.is_empty() {
        errors.push(InputValidationError {
            failed_field: "head_sha",
            tag: "required",
            value: String::new(),
        });
    }
    if head_ref.is_empty() {
        errors.push(InputValidationError {
            failed_field: "head_ref",
            tag: "required",
            value: String::new(),
        });
    } else if !valid_gh_temp_ref(head_ref) {
        errors.push(InputValidationError {
            failed_field: "head_ref",
            tag: "gh_temp_branch_ref",
            value: head_ref.to_string(),
        });
    }
    if priority < 1 {
        errors.push(InputValidationError {
            failed_field: "priority",
            tag: "min",
            value: priority.to_string(),
        });
    }
    errors
}

fn validate_acquire(body: &AcquireBody) -> Vec<InputValidationError> {
    let mut errors = validate_common(&body.head_sha, &body.head_ref, body.priority);
    match body.status {
        None | Some(Status::Pending) => {}
        Some(other) => errors.push(InputValidationError {
            failed_field: "status",
            tag: "oneof=pending",
            value: other.to_string(),
        }),
    }
    errors
}

fn validate_release(body: &ReleaseBody) -> Vec<InputValidationError> {
    let mut errors = validate_common(&body.head_sha, &body.head_ref, body.priority);
    match body.status {
        Some(Status::Success) | Some(Status::Failure) => {}
        other => errors.push(InputValidationError {
            failed_field: "status",
            tag: "oneof=success failure",
            value: other.map(|s| s.to_string()).unwrap_or_default(),
        }),
    }
    errors
}

fn invalid_request(errors: Vec<InputValidationError>) -> Response {
    let context = serde_json::to_value(errors).unwrap_or(Value::Null);
    api_error(StatusCode::BAD_REQUEST, "Invalid request", Some(context))
}

fn unprocessable_body(rejection: JsonRejection) -> Response {
    api_error(
        StatusCode::UNPROCESSABLE_ENTITY,
        rejection.body_text(),
        None,
    )
}

// =============================================================================
// Lease routes
// =============================================================================

/// GET `/`: every provider's view, keyed by group id.
pub async fn provider_list(State(state): State<Arc<AppState>>) -> Response {
    let mut list = BTreeMap::new();
    for (id, provider) in state.orchestrator.get_all() {
        match provider.view().await {
            Ok(view) => {
                list.insert(id.clone(), view);
            }
            Err(err) => {
                return lease_error_response("Couldn't build provider view", err);
            }
        }
    }
    (StatusCode::OK, Json(list)).into_response()
}

/// GET `/:owner/:repo/:base_ref`: a single provider's view.
pub async fn provider_details(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, base_ref)): Path<(String, String, String)>,
) -> Response {
    let provider = match get_provider(&state, &owner, &repo, &base_ref) {
        Ok(provider) => provider,
        Err(response) => return response,
    };
    match provider.view().await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => lease_error_response("Couldn't build provider view", err),
    }
}

/// DELETE `/:owner/:repo/:base_ref`: operator escape hatch.
pub async fn provider_clear(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, base_ref)): Path<(String, String, String)>,
) -> Response {
    let provider = match get_provider(&state, &owner, &repo, &base_ref) {
        Ok(provider) => provider,
        Err(response) => return response,
    };
    provider.clear().await;
    match provider.view().await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => lease_error_response("Couldn't build provider view", err),
    }
}

/// POST `/:owner/:repo/:base_ref/acquire`.
pub async fn acquire(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, base_ref)): Path<(String, String, String)>,
    body: Result<Json<AcquireBody>, JsonRejection>,
) -> Response {
    let provider = match get_provider(&state, &owner, &repo, &base_ref) {
        Ok(provider) => provider,
        Err(response) => return response,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return unprocessable_body(rejection),
    };
    let errors = validate_acquire(&body);
    if !errors.is_empty() {
        return invalid_request(errors);
    }

    let mut request = Request::new(body.head_sha, body.head_ref, body.priority);
    request.status = body.status;

    match provider.acquire(request).await {
        Ok(updated) => match provider.request_context(&updated).await {
            Ok(context) => (StatusCode::OK, Json(context)).into_response(),
            Err(err) => lease_error_response("Couldn't build request context", err),
        },
        Err(err) => lease_error_response("Couldn't acquire the lock", err),
    }
}

/// POST `/:owner/:repo/:base_ref/release`.
pub async fn release(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, base_ref)): Path<(String, String, String)>,
    body: Result<Json<ReleaseBody>, JsonRejection>,
) -> Response {
    let provider = match get_provider(&state, &owner, &repo, &base_ref) {
        Ok(provider) => provider,
        Err(response) => return response,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return unprocessable_body(rejection),
    };
    let errors = validate_release(&body);
    if !errors.is_empty() {
        return invalid_request(errors);
    }

    let mut request = Request::new(body.head_sha, body.head_ref, body.priority);
    request.status = body.status;

    match provider.release(request).await {
        Ok(updated) => match provider.request_context(&updated).await {
            Ok(context) => (StatusCode::OK, Json(context)).into_response(),
            Err(err) => lease_error_response("Couldn't build request context", err),
        },
        Err(err) => lease_error_response("Couldn't release the lock", err),
    }
}

// =============================================================================
// Probes and metrics
// =============================================================================

/// GET `/k8s/liveness`.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET `/k8s/readiness`: 500 while the storage is down.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    let mut sample = ProviderState::new("healthcheck", Utc::now());
    if state.storage.health_check(&mut sample).await {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// GET `/metrics`: Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match crate::metrics::encode_text(&state.registry) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire_body(head_sha: &str, head_ref: &str, priority: i64) -> AcquireBody {
        AcquireBody {
            head_sha: head_sha.to_string(),
            head_ref: head_ref.to_string(),
            priority,
            status: None,
        }
    }

    #[test]
    fn valid_acquire_body_passes() {
        let body = acquire_body("abc", "gh-readonly-queue/main/pr-1-aa", 1);
        assert!(validate_acquire(&body).is_empty());
    }

    #[test]
    fn missing_fields_are_reported_individually() {
        let errors = validate_acquire(&acquire_body("", "", 0));
        let fields: Vec<&str> = errors.iter().map(|e| e.failed_field).collect();
        assert_eq!(fields, vec!["head_sha", "head_ref", "priority"]);
        assert_eq!(errors[0].tag, "required");
        assert_eq!(errors[2].tag, "min");
    }

    #[test]
    fn malformed_head_ref_is_reported() {
        let errors = validate_acquire(&acquire_body("abc", "refs/heads/main", 1));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].failed_field, "head_ref");
        assert_eq!(errors[0].tag, "gh_temp_branch_ref");
        assert_eq!(errors[0].value, "refs/heads/main");
    }

    #[test]
    fn acquire_rejects_outcome_statuses() {
        let mut body = acquire_body("abc", "gh-readonly-queue/main/pr-1-aa", 1);

        for status in [Status::Acquired, Status::Success, Status::Failure, Status::Completed] {
            body.status = Some(status);
            let errors = validate_acquire(&body);
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].failed_field, "status");
            assert_eq!(errors[0].tag, "oneof=pending");
            assert_eq!(errors[0].value, status.to_string());
        }

        body.status = Some(Status::Pending);
        assert!(validate_acquire(&body).is_empty());
        body.status = None;
        assert!(validate_acquire(&body).is_empty());
    }

    #[test]
    fn release_requires_an_outcome_status() {
        let mut body = ReleaseBody {
            head_sha: "abc".to_string(),
            head_ref: "gh-readonly-queue/main/pr-1-aa".to_string(),
            priority: 1,
            status: None,
        };
        let errors = validate_release(&body);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].failed_field, "status");
        assert_eq!(errors[0].tag, "oneof=success failure");

        body.status = Some(Status::Acquired);
        let errors = validate_release(&body);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].value, "acquired");

        body.status = Some(Status::Success);
        assert!(validate_release(&body).is_empty());
        body.status = Some(Status::Failure);
        assert!(validate_release(&body).is_empty());
    }
}
