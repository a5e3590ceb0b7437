use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Header naming the calling member.
pub const MEMBER_HEADER: &str = "x-member";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attrs {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// What the request claims to be, before directory lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    /// Empty when the request named nobody
    pub username: String,
    #[serde(default)]
    pub attrs: Attrs,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Principal {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let ip = header(headers, "x-forwarded-for").map(|v| v.split(',').next().unwrap_or_default().trim().to_string());
        Principal {
            username: header(headers, MEMBER_HEADER).unwrap_or_default(),
            attrs: Attrs { ip, request_id: header(headers, REQUEST_ID_HEADER) },
        }
    }

    pub fn is_named(&self) -> bool { !self.username.is_empty() }
}
