use std::collections::BTreeMap;

use axum::body::Body;
use axum::response::Response;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Memoized outcome of the first execution for a cache key.
///
/// Written once under the lock and never updated; it only disappears when its TTL lapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<StoredHeaderValue>>,
    #[serde(with = "hex::serde")]
    pub body: Vec<u8>,
    pub fingerprint: String,
}

/// Raw header value bytes, hex-encoded in the serialized record so obs-text survives replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredHeaderValue(#[serde(with = "hex::serde")] pub Vec<u8>);

impl StoredHeaderValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&HeaderValue> for StoredHeaderValue {
    fn from(value: &HeaderValue) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<&str> for StoredHeaderValue {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl StoredRecord {
    /// Captures a response, dropping any header named in `skip_headers`.
    pub fn capture(
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
        fingerprint: String,
        skip_headers: &[String],
    ) -> Self {
        Self {
            status: status.as_u16(),
            headers: replayable_headers(headers, skip_headers),
            body: body.to_vec(),
            fingerprint,
        }
    }

    /// Rebuilds the HTTP response this record was captured from.
    pub fn to_response(&self) -> Result<Response> {
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            AppError::Internal(anyhow::anyhow!("stored record has invalid status {}: {}", self.status, e))
        })?;

        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, values) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                AppError::Internal(anyhow::anyhow!("stored record has invalid header name {}: {}", name, e))
            })?;
            for value in values {
                let value = HeaderValue::from_bytes(value.as_bytes()).map_err(|e| {
                    AppError::Internal(anyhow::anyhow!("stored record has invalid header value: {}", e))
                })?;
                headers.append(name.clone(), value);
            }
        }

        Ok(response)
    }
}

/// Collects response headers that are safe to replay, keeping value order per name.
pub fn replayable_headers(
    headers: &HeaderMap,
    skip_headers: &[String],
) -> BTreeMap<String, Vec<StoredHeaderValue>> {
    headers
        .keys()
        .filter(|name| !skip_headers.iter().any(|skip| skip.eq_ignore_ascii_case(name.as_str())))
        .map(|name| {
            let values = headers.get_all(name).iter().map(StoredHeaderValue::from).collect();
            (name.as_str().to_string(), values)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_TYPE, DATE, SET_COOKIE, TRANSFER_ENCODING};

    fn default_skip() -> Vec<String> {
        vec!["set-cookie".into(), "date".into(), "transfer-encoding".into()]
    }

    #[test]
    fn test_capture_filters_transport_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(DATE, HeaderValue::from_static("Wed, 14 Oct 2026 10:00:00 GMT"));
        headers.insert(SET_COOKIE, HeaderValue::from_static("session=abc"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let record = StoredRecord::capture(StatusCode::CREATED, &headers, b"{}", "fp".into(), &default_skip());

        assert_eq!(record.status, 201);
        assert_eq!(record.headers.len(), 1);
        assert_eq!(record.headers["content-type"], vec![StoredHeaderValue::from("application/json")]);
    }

    #[test]
    fn test_capture_keeps_multi_value_order() {
        let mut headers = HeaderMap::new();
        headers.append("x-trace", HeaderValue::from_static("first"));
        headers.append("x-trace", HeaderValue::from_static("second"));

        let record = StoredRecord::capture(StatusCode::OK, &headers, b"", "fp".into(), &[]);
        assert_eq!(
            record.headers["x-trace"],
            vec![StoredHeaderValue::from("first"), StoredHeaderValue::from("second")]
        );
    }

    #[test]
    fn test_skip_list_is_extensible() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("abc"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let skip = vec!["X-Request-Id".to_string()];
        let record = StoredRecord::capture(StatusCode::OK, &headers, b"", "fp".into(), &skip);
        assert!(!record.headers.contains_key("x-request-id"));
        assert!(record.headers.contains_key("content-type"));
    }

    #[test]
    fn test_to_response_restores_status_headers_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let record = StoredRecord::capture(
            StatusCode::CREATED,
            &headers,
            br#"{"id":7}"#,
            "fp".into(),
            &default_skip(),
        );

        let response = record.to_response().unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_invalid_status_is_an_error() {
        let record = StoredRecord {
            status: 42,
            headers: BTreeMap::new(),
            body: vec![],
            fingerprint: "fp".into(),
        };
        assert!(record.to_response().is_err());
    }

    #[test]
    fn test_serialized_body_is_hex() {
        let record = StoredRecord {
            status: 200,
            headers: BTreeMap::new(),
            body: b"ok".to_vec(),
            fingerprint: "fp".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"body\":\"6f6b\""));
        let back: StoredRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_non_ascii_header_values_survive_storage() {
        let disposition = HeaderValue::from_bytes("attachment; filename=\"café.pdf\"".as_bytes()).unwrap();
        let latin1 = HeaderValue::from_bytes(b"caf\xe9").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-disposition", disposition.clone());
        headers.insert("x-legacy-name", latin1.clone());

        let record = StoredRecord::capture(StatusCode::OK, &headers, b"pdf", "fp".into(), &default_skip());
        let json = serde_json::to_string(&record).unwrap();
        let restored: StoredRecord = serde_json::from_str(&json).unwrap();

        let response = restored.to_response().unwrap();
        assert_eq!(response.headers()["content-disposition"], disposition);
        assert_eq!(response.headers()["x-legacy-name"], latin1);
    }
}
