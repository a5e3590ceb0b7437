//! Azure Blob Storage over the REST API with Shared Key authorization.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, RequestBuilder};
use sha2::Sha256;

use super::remote::{self, RetryPolicy};
use super::{xml, DriverError, DriverResult, ObjectMeta};
use crate::config::AzureSettings;

const API_VERSION: &str = "2021-08-06";

pub struct AzureBackend {
    client: Client,
    policy: RetryPolicy,
    account: String,
    key: Vec<u8>,
    container: String,
}

/// Inputs of one Shared Key signature.
pub struct SharedKeyRequest<'a> {
    pub verb: &'a str,
    pub content_length: usize,
    pub content_type: &'a str,
    /// `x-ms-*` headers, any order
    pub ms_headers: &'a [(String, String)],
    pub account: &'a str,
    /// `/container` or `/container/blob`, unencoded
    pub resource_path: &'a str,
    pub query: &'a [(String, String)],
}

pub fn string_to_sign(r: &SharedKeyRequest<'_>) -> String {
    let length = if r.content_length == 0 { String::new() } else { r.content_length.to_string() };
    let mut ms: Vec<(String, String)> = r.ms_headers.iter().map(|(k, v)| (k.to_lowercase(), v.trim().to_string())).collect();
    ms.sort();
    let canonical_headers: String = ms.iter().map(|(k, v)| format!("{}:{}\n", k, v)).collect();
    let mut resource = format!("/{}{}", r.account, r.resource_path);
    let mut q: Vec<(String, String)> = r.query.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect();
    q.sort();
    for (k, v) in q {
        resource.push_str(&format!("\n{}:{}", k, v));
    }
    // VERB, Content-Encoding, Content-Language, Content-Length, Content-MD5, Content-Type,
    // Date, If-Modified-Since, If-Match, If-None-Match, If-Unmodified-Since, Range
    format!(
        "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}{}",
        r.verb, length, r.content_type, canonical_headers, resource
    )
}

pub fn sign(key: &[u8], string_to_sign: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
        Ok(m) => m,
        Err(_) => unreachable!("hmac accepts any key length"),
    };
    mac.update(string_to_sign.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

fn parse_http_date(v: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(v).ok().map(|d| d.with_timezone(&Utc))
}

impl AzureBackend {
    pub fn new(settings: &AzureSettings, policy: RetryPolicy) -> DriverResult<Self> {
        if settings.account_name.is_empty() || settings.container.is_empty() {
            return Err(DriverError::Config("AZURE_ACCOUNT_NAME and AZURE_CONTAINER are required for the Azure backend".into()));
        }
        let key = base64::engine::general_purpose::STANDARD
            .decode(settings.account_key.trim())
            .map_err(|e| DriverError::Config(format!("AZURE_ACCOUNT_KEY is not valid base64: {}", e)))?;
        Ok(Self {
            client: remote::build_client(&policy)?,
            policy,
            account: settings.account_name.clone(),
            key,
            container: settings.container.clone(),
        })
    }

    fn resource_path(&self, blob: &str) -> String {
        if blob.is_empty() { format!("/{}", self.container) } else { format!("/{}/{}", self.container, blob) }
    }

    fn url(&self, blob: &str, query: &[(String, String)]) -> String {
        let path = if blob.is_empty() {
            format!("/{}", self.container)
        } else {
            format!("/{}/{}", self.container, super::sigv4::encode_key_path(blob))
        };
        let mut url = format!("https://{}.blob.core.windows.net{}", self.account, path);
        if !query.is_empty() {
            let qs: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", super::sigv4::encode_component(k), super::sigv4::encode_component(v)))
                .collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }
        url
    }

    fn builder(&self, method: &Method, blob: &str, query: &[(String, String)], body: &[u8]) -> RequestBuilder {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let mut ms = vec![("x-ms-date".to_string(), date), ("x-ms-version".to_string(), API_VERSION.to_string())];
        let content_type = if *method == Method::PUT {
            ms.push(("x-ms-blob-type".to_string(), "BlockBlob".to_string()));
            "application/octet-stream"
        } else {
            ""
        };
        let sts = string_to_sign(&SharedKeyRequest {
            verb: method.as_str(),
            content_length: body.len(),
            content_type,
            ms_headers: &ms,
            account: &self.account,
            resource_path: &self.resource_path(blob),
            query,
        });
        let mut rb = self.client.request(method.clone(), self.url(blob, query));
        for (k, v) in ms.iter() {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if !content_type.is_empty() {
            rb = rb.header("content-type", content_type);
        }
        rb = rb.header("authorization", format!("SharedKey {}:{}", self.account, sign(&self.key, &sts)));
        if *method == Method::PUT {
            rb = rb.body(body.to_vec());
        }
        rb
    }

    async fn call(&self, method: Method, blob: &str, query: &[(String, String)], body: &[u8]) -> DriverResult<reqwest::Response> {
        remote::send(&self.policy, blob, || Ok(self.builder(&method, blob, query, body))).await
    }

    pub async fn read(&self, key: &str) -> DriverResult<Vec<u8>> {
        let resp = remote::check(key, self.call(Method::GET, key, &[], &[]).await?).await?;
        remote::bytes(key, resp).await
    }

    pub async fn write(&self, key: &str, bytes: &[u8]) -> DriverResult<()> {
        remote::check(key, self.call(Method::PUT, key, &[], bytes).await?).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> DriverResult<()> {
        match remote::check(key, self.call(Method::DELETE, key, &[], &[]).await?).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn head_headers(&self, key: &str) -> DriverResult<Option<reqwest::header::HeaderMap>> {
        match remote::check(key, self.call(Method::HEAD, key, &[], &[]).await?).await {
            Ok(r) => Ok(Some(r.headers().clone())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn head(&self, key: &str) -> DriverResult<Option<ObjectMeta>> {
        let Some(h) = self.head_headers(key).await? else { return Ok(None) };
        let get = |n: &str| h.get(n).and_then(|v| v.to_str().ok());
        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size: get("content-length").and_then(|v| v.parse().ok()).unwrap_or(0),
            modified: get("last-modified").and_then(parse_http_date),
        }))
    }

    async fn list_page(&self, prefix: &str, delimiter: bool, marker: Option<&str>, max: Option<usize>) -> DriverResult<String> {
        let mut query = vec![
            ("restype".to_string(), "container".to_string()),
            ("comp".to_string(), "list".to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        if delimiter {
            query.push(("delimiter".to_string(), "/".to_string()));
        }
        if let Some(m) = marker {
            query.push(("marker".to_string(), m.to_string()));
        }
        if let Some(n) = max {
            query.push(("maxresults".to_string(), n.to_string()));
        }
        let resp = remote::check(prefix, self.call(Method::GET, "", &query, &[]).await?).await?;
        remote::text(prefix, resp).await
    }

    fn next_marker(body: &str) -> Option<String> {
        xml::text(body, "NextMarker").filter(|m| !m.is_empty())
    }

    pub async fn list(&self, prefix: &str) -> DriverResult<(Vec<String>, Vec<String>)> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let body = self.list_page(prefix, true, marker.as_deref(), None).await?;
            for bp in xml::elements(&body, "BlobPrefix") {
                if let Some(n) = xml::text(bp, "Name") {
                    let name = n.strip_prefix(prefix).unwrap_or(&n).trim_end_matches('/').to_string();
                    if !name.is_empty() { dirs.push(name); }
                }
            }
            for b in xml::elements(&body, "Blob") {
                if let Some(n) = xml::text(b, "Name") {
                    let name = n.strip_prefix(prefix).unwrap_or(&n).to_string();
                    if !name.is_empty() { files.push(name); }
                }
            }
            marker = Self::next_marker(&body);
            if marker.is_none() { break; }
        }
        Ok((dirs, files))
    }

    pub async fn list_recursive(&self, prefix: &str) -> DriverResult<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let body = self.list_page(prefix, false, marker.as_deref(), None).await?;
            for b in xml::elements(&body, "Blob") {
                let Some(key) = xml::text(b, "Name") else { continue };
                out.push(ObjectMeta {
                    key,
                    size: xml::text(b, "Content-Length").and_then(|s| s.parse().ok()).unwrap_or(0),
                    modified: xml::text(b, "Last-Modified").as_deref().and_then(parse_http_date),
                });
            }
            marker = Self::next_marker(&body);
            if marker.is_none() { break; }
        }
        Ok(out)
    }

    pub async fn created(&self, key: &str) -> DriverResult<DateTime<Utc>> {
        let Some(h) = self.head_headers(key).await? else {
            return Err(DriverError::NotFound(key.to_string()));
        };
        let get = |n: &str| h.get(n).and_then(|v| v.to_str().ok()).and_then(parse_http_date);
        get("x-ms-creation-time")
            .or_else(|| get("last-modified"))
            .ok_or_else(|| DriverError::NotFound(key.to_string()))
    }

    pub async fn delete_prefix(&self, prefix: &str) -> DriverResult<usize> {
        let objects = self.list_recursive(prefix).await?;
        for o in objects.iter() {
            self.delete(&o.key).await?;
        }
        Ok(objects.len())
    }

    pub async fn dir_exists(&self, prefix: &str) -> DriverResult<bool> {
        if prefix.is_empty() {
            return Ok(true);
        }
        let body = self.list_page(prefix, false, None, Some(1)).await?;
        Ok(!xml::elements(&body, "Blob").is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_to_sign_layout() {
        let ms = vec![
            ("x-ms-version".to_string(), API_VERSION.to_string()),
            ("x-ms-date".to_string(), "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        ];
        let q = vec![
            ("restype".to_string(), "container".to_string()),
            ("comp".to_string(), "list".to_string()),
        ];
        let sts = string_to_sign(&SharedKeyRequest {
            verb: "GET",
            content_length: 0,
            content_type: "",
            ms_headers: &ms,
            account: "acct",
            resource_path: "/media",
            query: &q,
        });
        assert_eq!(
            sts,
            "GET\n\n\n\n\n\n\n\n\n\n\n\nx-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\nx-ms-version:2021-08-06\n/acct/media\ncomp:list\nrestype:container"
        );
    }

    #[test]
    fn put_includes_length_and_type() {
        let ms = vec![("x-ms-blob-type".to_string(), "BlockBlob".to_string())];
        let sts = string_to_sign(&SharedKeyRequest {
            verb: "PUT",
            content_length: 11,
            content_type: "application/octet-stream",
            ms_headers: &ms,
            account: "acct",
            resource_path: "/media/space00000/a.txt",
            query: &[],
        });
        assert!(sts.starts_with("PUT\n\n\n11\n\napplication/octet-stream\n"));
        assert!(sts.ends_with("x-ms-blob-type:BlockBlob\n/acct/media/space00000/a.txt"));
    }

    #[test]
    fn signature_is_base64_hmac() {
        let sig = sign(b"key", "The quick brown fox jumps over the lazy dog");
        assert_eq!(sig, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
    }

    #[test]
    fn bad_account_key_rejected() {
        let s = AzureSettings { account_name: "a".into(), account_key: "not base64!".into(), container: "c".into() };
        assert!(matches!(AzureBackend::new(&s, RetryPolicy::default()), Err(DriverError::Config(_))));
    }
}
