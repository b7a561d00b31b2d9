//! Contact form endpoints.
//!
//! The verification session is bound to the `contactgate_session` cookie.
//! `submit` issues the cookie when the client has none; the other endpoints
//! require it.

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, HeaderValue, StatusCode, header::RETRY_AFTER, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, warn};

use super::types::{
    ErrorResponse, MessageResponse, ResendRequest, SubmissionStatus, SubmitRequest,
    SubmitResponse, VerifyRequest, VerifyResponse,
};
use super::utils::{
    ClientIp, clear_session_cookie, extract_session_id, new_session_id, session_cookie,
};
use crate::api::AppState;
use crate::flow::{FlowError, VerifyStep};

fn error_response(status: StatusCode, body: ErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

fn missing_payload() -> Response {
    error_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Missing payload"))
}

fn session_expired() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        ErrorResponse::new(FlowError::SessionExpired.to_string()),
    )
}

pub(crate) fn flow_error_response(err: &FlowError) -> Response {
    match err {
        FlowError::RateLimited => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorResponse::new(err.to_string()),
        ),
        FlowError::Invalid(message) => {
            error_response(StatusCode::BAD_REQUEST, ErrorResponse::new(message.clone()))
        }
        FlowError::SessionExpired => session_expired(),
        FlowError::Cooldown { remaining_seconds } => {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from(*remaining_seconds));
            let body = ErrorResponse {
                retry_after_seconds: Some(*remaining_seconds),
                ..ErrorResponse::new(err.to_string())
            };
            (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
        }
        FlowError::Delivery { saved_locally, .. } => error_response(
            StatusCode::BAD_GATEWAY,
            ErrorResponse {
                saved_locally: Some(*saved_locally),
                ..ErrorResponse::new(err.to_string())
            },
        ),
        FlowError::Persistence { saved_locally, .. } => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse {
                saved_locally: Some(*saved_locally),
                ..ErrorResponse::new("Failed to record submission")
            },
        ),
        FlowError::Store(store_err) => {
            error!("contact flow store failure: {store_err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("Temporary failure, please try again"),
            )
        }
    }
}

/// Hold the form and email a verification code to the submitted address.
#[utoipa::path(
    post,
    path = "/v1/contact/submit",
    request_body = SubmitRequest,
    responses(
        (status = 202, description = "Verification code sent", body = SubmitResponse),
        (status = 400, description = "Missing or invalid fields", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse),
        (status = 502, description = "Verification email could not be sent", body = ErrorResponse)
    ),
    tag = "contact"
)]
pub async fn submit(
    headers: HeaderMap,
    ClientIp(client_ip): ClientIp,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<SubmitRequest>>,
) -> Response {
    let request: SubmitRequest = match payload {
        Some(Json(payload)) => payload,
        None => return missing_payload(),
    };

    if !request.website.trim().is_empty() {
        warn!(client_ip, "honeypot field filled, dropping submission");
        return error_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Spam detected"));
    }

    // every submission gets a fresh session id; the old one only loses its form
    let previous_session = extract_session_id(&headers);
    let session_id = new_session_id();
    let mut response_headers = HeaderMap::new();
    match session_cookie(&session_id, state.session_ttl_seconds, state.secure_cookies) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            error!("Failed to build session cookie: {err}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("Submission failed"),
            );
        }
    }

    match state.flow.submit(&client_ip, &session_id, &request.form()).await {
        Ok(email) => {
            if let Some(previous) = previous_session
                && let Err(err) = state.flow.discard_session(&previous).await
            {
                warn!("failed to discard previous session: {err}");
            }
            let body = SubmitResponse {
                message: format!("A verification code was sent to {email}"),
                email,
            };
            (StatusCode::ACCEPTED, response_headers, Json(body)).into_response()
        }
        Err(err) => (response_headers, flow_error_response(&err)).into_response(),
    }
}

/// Confirm the code and finalize the pending submission.
#[utoipa::path(
    post,
    path = "/v1/contact/verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Submission recorded", body = VerifyResponse),
        (status = 400, description = "Wrong code or missing fields", body = ErrorResponse),
        (status = 404, description = "No pending code or form", body = ErrorResponse),
        (status = 410, description = "Code expired or locked", body = ErrorResponse),
        (status = 429, description = "Rate limited", body = ErrorResponse),
        (status = 502, description = "Notification could not be sent", body = ErrorResponse)
    ),
    tag = "contact"
)]
pub async fn verify(
    headers: HeaderMap,
    ClientIp(client_ip): ClientIp,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<VerifyRequest>>,
) -> Response {
    let request: VerifyRequest = match payload {
        Some(Json(payload)) => payload,
        None => return missing_payload(),
    };
    let Some(session_id) = extract_session_id(&headers) else {
        return session_expired();
    };

    match state
        .flow
        .verify(&client_ip, &session_id, &request.email, &request.code)
        .await
    {
        Ok(VerifyStep::Submitted { submission_id }) => {
            let body = VerifyResponse {
                message: format!("Submission received, reference #{submission_id}"),
                submission_id,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Ok(VerifyStep::InvalidCode { remaining }) => error_response(
            StatusCode::BAD_REQUEST,
            ErrorResponse {
                remaining_attempts: Some(remaining),
                ..ErrorResponse::new(format!(
                    "Invalid code, {remaining} attempt(s) remaining"
                ))
            },
        ),
        Ok(VerifyStep::Expired) => error_response(
            StatusCode::GONE,
            ErrorResponse::new("The code has expired, please submit the form again"),
        ),
        Ok(VerifyStep::TooManyAttempts) => error_response(
            StatusCode::GONE,
            ErrorResponse::new("Too many incorrect attempts, please submit the form again"),
        ),
        Ok(VerifyStep::NotFound) => error_response(
            StatusCode::NOT_FOUND,
            ErrorResponse::new("No pending code, please submit the form again"),
        ),
        Err(err) => flow_error_response(&err),
    }
}

/// Email a replacement code once the cooldown has passed.
#[utoipa::path(
    post,
    path = "/v1/contact/resend",
    request_body = ResendRequest,
    responses(
        (status = 202, description = "New code sent", body = MessageResponse),
        (status = 404, description = "No pending form for this email", body = ErrorResponse),
        (status = 429, description = "Cooldown active", body = ErrorResponse),
        (status = 502, description = "Verification email could not be sent", body = ErrorResponse)
    ),
    tag = "contact"
)]
pub async fn resend(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<ResendRequest>>,
) -> Response {
    let request: ResendRequest = match payload {
        Some(Json(payload)) => payload,
        None => return missing_payload(),
    };
    let Some(session_id) = extract_session_id(&headers) else {
        return session_expired();
    };

    match state.flow.resend(&session_id, &request.email).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(MessageResponse {
                message: format!("A new verification code was sent to {}", request.email.trim()),
            }),
        )
            .into_response(),
        Err(err) => flow_error_response(&err),
    }
}

/// Drop the pending form and its code.
#[utoipa::path(
    post,
    path = "/v1/contact/cancel",
    responses(
        (status = 204, description = "Pending submission discarded")
    ),
    tag = "contact"
)]
pub async fn cancel(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(state.secure_cookies) {
        response_headers.insert(SET_COOKIE, cookie);
    }

    if let Some(session_id) = extract_session_id(&headers)
        && let Err(err) = state.flow.cancel(&session_id).await
    {
        return (response_headers, flow_error_response(&err)).into_response();
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

/// Look up a recorded submission by reference id.
#[utoipa::path(
    get,
    path = "/v1/contact/submissions/{id}",
    params(
        ("id" = String, Path, description = "Six-digit submission reference")
    ),
    responses(
        (status = 200, description = "Submission found", body = SubmissionStatus),
        (status = 404, description = "Unknown reference", body = ErrorResponse)
    ),
    tag = "contact"
)]
pub async fn submission_status(
    Path(id): Path<String>,
    state: Extension<Arc<AppState>>,
) -> Response {
    match state.flow.submissions().find(&id).await {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(SubmissionStatus {
                id,
                status: "found".to_string(),
                submitted_at: record.date.to_rfc3339(),
                email: record.email,
                name: record.name,
            }),
        )
            .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, ErrorResponse::new("not_found")),
        Err(err) => {
            error!("Failed to look up submission {id}: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("Lookup failed"),
            )
        }
    }
}
