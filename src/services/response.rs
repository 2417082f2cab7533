//! HTTP response building helpers
//!
//! Every handler error goes through [`error_response`], the single place
//! error kinds become status codes.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::HealthError;

/// Message used for every absent-or-not-owned outcome
pub const NOT_FOUND_MESSAGE: &str = "Resource not found";

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

pub fn error_body(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}

pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    error_body(StatusCode::NOT_FOUND, message)
}

/// Map an error to a response.
///
/// With `production` set, 5xx bodies carry only a generic message and the
/// detail goes to the log.
pub fn error_response(error: HealthError, production: bool) -> Response<Full<Bytes>> {
    let status = status_for(&error);

    let message = match &error {
        HealthError::NotFound(_) | HealthError::RecordNotFound(_) | HealthError::Ownership(_) => {
            NOT_FOUND_MESSAGE.to_string()
        }
        HealthError::Json(e) => format!("Invalid JSON: {}", e),
        _ => error.to_string(),
    };

    if error.is_internal() {
        error!(status = status.as_u16(), error = %error, "Request failed");
        if production {
            return error_body(status, generic_message(status));
        }
    } else {
        warn!(status = status.as_u16(), error = %error, "Request rejected");
    }

    error_body(status, &message)
}

pub fn status_for(error: &HealthError) -> StatusCode {
    match error {
        HealthError::Validation(_) | HealthError::Json(_) => StatusCode::BAD_REQUEST,
        HealthError::Auth(_) => StatusCode::UNAUTHORIZED,
        HealthError::Forbidden(_) | HealthError::AccessDenied => StatusCode::FORBIDDEN,
        HealthError::NotFound(_) | HealthError::RecordNotFound(_) | HealthError::Ownership(_) => {
            StatusCode::NOT_FOUND
        }
        HealthError::Conflict(_) | HealthError::AlreadyResponded(_) => StatusCode::CONFLICT,
        HealthError::Decryption(_) | HealthError::MalformedPermissions(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        HealthError::Dependency(_) => StatusCode::BAD_GATEWAY,
        HealthError::Config(_)
        | HealthError::Database(_)
        | HealthError::Io(_)
        | HealthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn generic_message(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_GATEWAY => "Upstream service unavailable",
        _ => "Internal server error",
    }
}

pub fn from_result<T: Serialize>(result: Result<T, HealthError>, production: bool) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e, production),
    }
}

pub fn from_create_result<T: Serialize>(
    result: Result<T, HealthError>,
    production: bool,
) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => created(&value),
        Err(e) => error_response(e, production),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&HealthError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&HealthError::Auth("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&HealthError::AccessDenied), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&HealthError::Ownership("r".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&HealthError::AlreadyResponded("r".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&HealthError::Decryption("x".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(&HealthError::Dependency("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&HealthError::Internal("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_not_found_and_not_owned_look_identical() {
        let absent = body_json(error_response(HealthError::NotFound("record 1".into()), false)).await;
        let foreign = body_json(error_response(HealthError::Ownership("record 1".into()), false)).await;
        assert_eq!(absent, foreign);
        assert_eq!(absent["error"], NOT_FOUND_MESSAGE);
    }

    #[tokio::test]
    async fn test_production_hides_internal_detail() {
        let resp = error_response(HealthError::Internal("disk at /var/secret".into()), true);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Internal server error");

        let dev = body_json(error_response(HealthError::Internal("disk at /var/secret".into()), false)).await;
        assert!(dev["error"].as_str().unwrap().contains("/var/secret"));
    }

    #[tokio::test]
    async fn test_production_hides_dependency_detail() {
        let resp = error_response(HealthError::Dependency("ledger at 10.0.0.7 unavailable".into()), true);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(resp).await["error"], "Upstream service unavailable");
    }

    #[test]
    fn test_internal_errors_are_exactly_server_errors() {
        let errors = [
            HealthError::Validation("x".into()),
            HealthError::NotFound("x".into()),
            HealthError::Conflict("x".into()),
            HealthError::AccessDenied,
            HealthError::Decryption("x".into()),
            HealthError::Auth("x".into()),
            HealthError::Forbidden("x".into()),
            HealthError::Dependency("x".into()),
            HealthError::Config("x".into()),
            HealthError::Io(std::io::Error::other("x")),
            HealthError::Internal("x".into()),
        ];
        for error in &errors {
            assert_eq!(error.is_internal(), status_for(error).is_server_error(), "{}", error);
        }
    }

    #[tokio::test]
    async fn test_client_errors_keep_message_in_production() {
        let body = body_json(error_response(HealthError::Validation("purpose is required".into()), true)).await;
        assert!(body["error"].as_str().unwrap().contains("purpose is required"));
    }
}
