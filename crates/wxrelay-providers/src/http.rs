//! HTTP failure → `BackendError` mapping shared by every backend.

use reqwest::{header::HeaderValue, Response, StatusCode};
use wxrelay_core::error::BackendError;

/// Map a transport-level reqwest failure.
pub(crate) fn request_error(backend: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else if let Some(status) = err.status() {
        status_error(backend, status, None, &err.to_string())
    } else if err.is_decode() {
        BackendError::MalformedResponse(format!("{backend}: {err}"))
    } else {
        BackendError::Unavailable(format!("{backend} request failed: {err}"))
    }
}

/// Map a non-success HTTP status.
pub(crate) fn status_error(
    backend: &str,
    status: StatusCode,
    retry_after_secs: Option<u64>,
    body: &str,
) -> BackendError {
    match status.as_u16() {
        401 | 403 => BackendError::AuthFailure(format!("{backend} returned {status}: {body}")),
        429 => BackendError::RateLimited { retry_after_secs },
        408 | 504 => BackendError::Timeout,
        _ if status.is_server_error() => {
            BackendError::Unavailable(format!("{backend} returned {status}: {body}"))
        }
        _ => BackendError::MalformedResponse(format!("{backend} returned {status}: {body}")),
    }
}

/// Pass successful responses through; read the body of failures into an error.
pub(crate) async fn check_status(backend: &str, resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(resp.headers().get("retry-after"));
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(backend, status, retry_after, &body))
}

/// Delay-seconds form only; HTTP-date values are ignored.
pub(crate) fn parse_retry_after(header: Option<&HeaderValue>) -> Option<u64> {
    header?.to_str().ok()?.trim().parse().ok()
}
