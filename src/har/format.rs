//! HAR 1.2 document model
//!
//! Only the fields the archive reads or writes are modelled; unknown fields
//! in loaded files are ignored.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exchange::{Request, Response};

/// HAR format version written by the archive
pub const HAR_VERSION: &str = "1.2";

/// Value of `content.encoding` for binary bodies
pub const BASE64_ENCODING: &str = "base64";

/// Top-level HAR document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarDocument {
    /// The log
    pub log: HarLog,
}

/// HAR log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarLog {
    /// Format version
    pub version: String,
    /// Producing tool
    pub creator: HarCreator,
    /// Recorded entries, in recording order
    #[serde(default)]
    pub entries: Vec<HarEntry>,
}

impl Default for HarLog {
    fn default() -> Self {
        Self {
            version: HAR_VERSION.to_string(),
            creator: HarCreator::default(),
            entries: Vec::new(),
        }
    }
}

/// Producing tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarCreator {
    /// Tool name
    pub name: String,
    /// Tool version
    pub version: String,
}

impl Default for HarCreator {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One recorded exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    /// When the request started
    pub started_date_time: DateTime<Utc>,
    /// Total elapsed time in milliseconds
    pub time: f64,
    /// Request
    pub request: HarRequest,
    /// Response
    pub response: HarResponse,
    /// Phase timings
    #[serde(default)]
    pub timings: HarTimings,
}

/// Name/value pair used for headers and query strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarNameValue {
    /// Name
    pub name: String,
    /// Value
    pub value: String,
}

/// Recorded request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    /// Method
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Protocol version
    #[serde(default = "default_http_version")]
    pub http_version: String,
    /// Headers
    #[serde(default)]
    pub headers: Vec<HarNameValue>,
    /// Parsed query string
    #[serde(default)]
    pub query_string: Vec<HarNameValue>,
    /// Body, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
    /// Header block size (-1 if unknown)
    #[serde(default = "unknown_size")]
    pub headers_size: i64,
    /// Body size in bytes
    #[serde(default = "unknown_size")]
    pub body_size: i64,
}

/// Recorded request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    /// Content type
    #[serde(default)]
    pub mime_type: String,
    /// Body text, base64 when `_encoding` says so
    #[serde(default)]
    pub text: String,
    /// Non-standard body encoding marker
    #[serde(
        default,
        rename = "_encoding",
        skip_serializing_if = "Option::is_none"
    )]
    pub encoding: Option<String>,
}

/// Recorded response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    /// Status code
    pub status: u16,
    /// Status text
    #[serde(default)]
    pub status_text: String,
    /// Protocol version
    #[serde(default = "default_http_version")]
    pub http_version: String,
    /// Headers
    #[serde(default)]
    pub headers: Vec<HarNameValue>,
    /// Body
    pub content: HarContent,
    /// Redirect target
    #[serde(default, rename = "redirectURL")]
    pub redirect_url: String,
    /// Header block size (-1 if unknown)
    #[serde(default = "unknown_size")]
    pub headers_size: i64,
    /// Body size in bytes
    #[serde(default = "unknown_size")]
    pub body_size: i64,
}

/// Recorded response body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    /// Decoded body size
    pub size: i64,
    /// Content type
    #[serde(default)]
    pub mime_type: String,
    /// Body text, base64 when `encoding` says so
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Body encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// Phase timings in milliseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarTimings {
    /// Sending the request
    pub send: f64,
    /// Waiting for the first byte
    pub wait: f64,
    /// Receiving the body
    pub receive: f64,
}

fn default_http_version() -> String {
    "HTTP/1.1".to_string()
}

fn unknown_size() -> i64 {
    -1
}

fn to_name_values(headers: &[(String, String)]) -> Vec<HarNameValue> {
    headers
        .iter()
        .map(|(name, value)| HarNameValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn from_name_values(values: &[HarNameValue]) -> Vec<(String, String)> {
    values
        .iter()
        .map(|nv| (nv.name.clone(), nv.value.clone()))
        .collect()
}

/// Encode a body as (text, encoding)
fn encode_body(body: &[u8]) -> (String, Option<String>) {
    match std::str::from_utf8(body) {
        Ok(text) => (text.to_string(), None),
        Err(_) => (STANDARD.encode(body), Some(BASE64_ENCODING.to_string())),
    }
}

fn decode_body(text: &str, encoding: Option<&str>) -> crate::Result<Vec<u8>> {
    match encoding {
        Some(BASE64_ENCODING) => STANDARD
            .decode(text)
            .map_err(|e| crate::InterposeError::Other(format!("Invalid base64 HAR body: {e}"))),
        _ => Ok(text.as_bytes().to_vec()),
    }
}

fn query_pairs(url: &str) -> Vec<HarNameValue> {
    super::key::split_query(url)
        .into_iter()
        .map(|(name, value)| HarNameValue { name, value })
        .collect()
}

fn mime_type(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}

fn len_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

impl HarEntry {
    /// Build an entry from a live request/response pair
    #[must_use]
    pub fn from_exchange(
        request: &Request,
        response: &Response,
        started: DateTime<Utc>,
        elapsed_ms: f64,
    ) -> Self {
        let post_data = (!request.body.is_empty()).then(|| {
            let (text, encoding) = encode_body(&request.body);
            HarPostData {
                mime_type: mime_type(&request.headers),
                text,
                encoding,
            }
        });

        let (text, encoding) = encode_body(&response.body);

        Self {
            started_date_time: started,
            time: elapsed_ms,
            request: HarRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                http_version: default_http_version(),
                headers: to_name_values(&request.headers),
                query_string: query_pairs(&request.url),
                post_data,
                headers_size: -1,
                body_size: len_i64(request.body.len()),
            },
            response: HarResponse {
                status: response.status,
                status_text: status_text(response.status),
                http_version: default_http_version(),
                headers: to_name_values(&response.headers),
                content: HarContent {
                    size: len_i64(response.body.len()),
                    mime_type: mime_type(&response.headers),
                    text: Some(text),
                    encoding,
                },
                redirect_url: response
                    .header("location")
                    .map(str::to_string)
                    .unwrap_or_default(),
                headers_size: -1,
                body_size: len_i64(response.body.len()),
            },
            timings: HarTimings {
                send: 0.0,
                wait: elapsed_ms,
                receive: 0.0,
            },
        }
    }

    /// Recorded request body bytes
    ///
    /// # Errors
    ///
    /// Returns error if a base64 body is malformed
    pub fn request_body(&self) -> crate::Result<Vec<u8>> {
        match &self.request.post_data {
            Some(data) => decode_body(&data.text, data.encoding.as_deref()),
            None => Ok(Vec::new()),
        }
    }

    /// Rebuild the recorded response
    ///
    /// # Errors
    ///
    /// Returns error if a base64 body is malformed
    pub fn to_response(&self) -> crate::Result<Response> {
        let body = match &self.response.content.text {
            Some(text) => decode_body(text, self.response.content.encoding.as_deref())?,
            None => Vec::new(),
        };

        Ok(Response {
            status: self.response.status,
            headers: from_name_values(&self.response.headers),
            body,
        })
    }
}

fn status_text(status: u16) -> String {
    hyper::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_body_is_base64() {
        let request = Request::get("http://example.com/img?b=2&a=1");
        let response = Response::new(200)
            .with_header("content-type", "image/png")
            .with_body(vec![0x89, 0x50, 0xff, 0x00]);

        let entry = HarEntry::from_exchange(&request, &response, Utc::now(), 12.0);
        assert_eq!(entry.response.content.encoding.as_deref(), Some("base64"));
        assert_eq!(entry.response.content.mime_type, "image/png");
        assert_eq!(entry.response.status_text, "OK");
        assert_eq!(entry.request.query_string.len(), 2);
        assert_eq!(entry.to_response().unwrap(), response);
    }

    #[test]
    fn test_text_body_kept_readable() {
        let request = Request::new("POST", "http://example.com/api").with_body("{\"q\":1}");
        let response = Response::json(201, "[]");

        let entry = HarEntry::from_exchange(&request, &response, Utc::now(), 3.5);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["response"]["content"]["text"], "[]");
        assert!(json["response"]["content"].get("encoding").is_none());
        assert_eq!(json["request"]["postData"]["text"], "{\"q\":1}");
        assert_eq!(json["response"]["redirectURL"], "");
        assert!(json["startedDateTime"].is_string());
        assert_eq!(entry.request_body().unwrap(), b"{\"q\":1}");
    }

    #[test]
    fn test_parse_minimal_foreign_entry() {
        let json = r#"{
            "startedDateTime": "2024-01-01T00:00:00.000Z",
            "time": 5,
            "request": {"method": "GET", "url": "http://example.com/"},
            "response": {"status": 404, "content": {"size": 0}}
        }"#;
        let entry: HarEntry = serde_json::from_str(json).unwrap();
        let response = entry.to_response().unwrap();
        assert_eq!(response.status, 404);
        assert!(response.body.is_empty());
    }
}
