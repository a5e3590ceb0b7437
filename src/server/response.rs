//! Error and payload shapes shared by every route.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};

use crate::error::AppError;
use crate::explorer::{FileBody, Paged};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(target: "fileplane::server", error_key = self.error_key(), code = self.code_str(), "{}", self.message());
        } else {
            debug!(target: "fileplane::server", error_key = self.error_key(), code = self.code_str(), "{}", self.message());
        }
        let body = json!({
            "status": "error",
            "error_key": self.error_key(),
            "code": self.code_str(),
            "message": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, AppError>;

pub fn ok_json<T: Serialize>(v: T) -> ApiResult<Response> {
    Ok((StatusCode::OK, Json(v)).into_response())
}

/// Inline (view) or attachment (download) file response.
pub fn file_response(body: FileBody, attachment: bool) -> Response {
    let disposition = if attachment {
        format!("attachment; filename=\"{}\"", urlencoding::encode(&body.name))
    } else {
        format!("inline; filename=\"{}\"", urlencoding::encode(&body.name))
    };
    (StatusCode::OK, [(header::CONTENT_TYPE, body.content_type), (header::CONTENT_DISPOSITION, disposition)], body.bytes).into_response()
}

fn page_url(base: &str, params: &[(&str, &str)], page: usize, page_size: usize) -> String {
    let mut q: Vec<String> = params
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect();
    q.push(format!("page={}", page));
    q.push(format!("page_size={}", page_size));
    format!("{}?{}", base, q.join("&"))
}

/// `{count, previous, next, results}` with page links that repeat `params`.
pub fn paged_body<T: Serialize>(base: &str, params: &[(&str, &str)], page: &Paged<T>) -> serde_json::Value {
    json!({
        "count": page.count,
        "previous": page.previous_page().map(|n| page_url(base, params, n, page.page_size)),
        "next": page.next_page().map(|n| page_url(base, params, n, page.page_size)),
        "results": page.results,
    })
}

/// `true`, `"yes"`, `"1"` and `1` are true; anything else is false.
pub fn truthy(v: Option<&serde_json::Value>) -> bool {
    match v {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => crate::paths::is_true_value(s),
        Some(serde_json::Value::Number(n)) => n.as_u64() == Some(1),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_links_keep_filters() {
        let page = Paged { count: 5, page: 2, page_size: 2, results: vec![3, 4] };
        let body = paged_body("/api/v1/explorer/explorer/", &[("path", "a b"), ("query", "")], &page);
        assert_eq!(body["previous"], "/api/v1/explorer/explorer/?path=a%20b&page=1&page_size=2");
        assert_eq!(body["next"], "/api/v1/explorer/explorer/?path=a%20b&page=3&page_size=2");
    }

    #[test]
    fn truthy_tokens() {
        for v in [json!(true), json!("Yes"), json!("1"), json!(1), json!("TRUE")] {
            assert!(truthy(Some(&v)), "{}", v);
        }
        for v in [json!(false), json!("no"), json!(0), json!(null)] {
            assert!(!truthy(Some(&v)), "{}", v);
        }
        assert!(!truthy(None));
    }

    #[test]
    fn errors_carry_key_and_status() {
        let resp = AppError::invalid_path("system_path", "nope").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
