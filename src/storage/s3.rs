//! S3-compatible store backend
//!
//! Pure-Rust async client using reqwest with AWS SigV4 request signing.
//! Uses path-style addressing and V2 listings with continuation tokens,
//! which MinIO and the other common S3-compatible providers accept.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::backend::{ListPage, StoreBackend};
use super::credentials::StoreCredentials;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

type HmacSha256 = Hmac<Sha256>;

const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// S3-compatible storage backend
pub struct S3Backend {
    client: Client,
    credentials: StoreCredentials,
}

impl S3Backend {
    /// Create a backend over the given credentials
    pub fn new(credentials: StoreCredentials) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            credentials,
        }
    }

    /// Key as stored in the bucket: the directory prefix plus the
    /// instance-relative key.
    fn full_key(&self, key: &str) -> String {
        format!("{}/{}", self.credentials.prefix, key)
    }

    /// Perform one signed request against the bucket.
    ///
    /// `object` is the bucket-absolute key, empty for bucket-level
    /// operations. Extra headers ride outside the signed set. Returns
    /// None on transport failure.
    async fn send(
        &self,
        method: Method,
        object: &str,
        query: &[(&str, String)],
        extra_headers: &[(&str, String)],
        body: Bytes,
    ) -> Option<reqwest::Response> {
        let path = if object.is_empty() {
            format!("/{}", self.credentials.bucket)
        } else {
            format!(
                "/{}/{}",
                self.credentials.bucket,
                uri_encode(object, false)
            )
        };

        let mut pairs: Vec<(String, String)> = query
            .iter()
            .map(|(key, value)| (uri_encode(key, true), uri_encode(value, true)))
            .collect();
        pairs.sort();
        let canonical_query = pairs
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join("&");

        let host = self.credentials.host();
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let date = &amz_date[..8];
        let payload_hash = hex_encode(&sha256(&body));

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            method.as_str(),
            path,
            canonical_query,
            host,
            payload_hash,
            amz_date,
            SIGNED_HEADERS,
            payload_hash
        );

        let scope = format!(
            "{}/{}/s3/aws4_request",
            date, self.credentials.region
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex_encode(&sha256(canonical_request.as_bytes()))
        );

        let url = if canonical_query.is_empty() {
            format!("{}{}", self.credentials.endpoint, path)
        } else {
            format!("{}{}?{}", self.credentials.endpoint, path, canonical_query)
        };

        let mut request = self
            .client
            .request(method, &url)
            .header("x-amz-date", amz_date.as_str())
            .header("x-amz-content-sha256", payload_hash.as_str());

        // Anonymous access is left unsigned so public development
        // endpoints keep working without keys.
        if !self.credentials.access_key.is_empty() {
            let secret = format!("AWS4{}", self.credentials.secret_key);
            let k_date = hmac_sha256(secret.as_bytes(), date.as_bytes());
            let k_region = hmac_sha256(&k_date, self.credentials.region.as_bytes());
            let k_service = hmac_sha256(&k_region, b"s3");
            let signing_key = hmac_sha256(&k_service, b"aws4_request");
            let signature = hex_encode(&hmac_sha256(&signing_key, string_to_sign.as_bytes()));
            let authorization = format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                self.credentials.access_key, scope, SIGNED_HEADERS, signature
            );
            request = request.header("Authorization", authorization);
        }

        for (name, value) in extra_headers {
            request = request.header(*name, value.as_str());
        }

        match request.body(body).send().await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!("Object store request to {} failed: {}", url, e);
                None
            }
        }
    }
}

#[async_trait]
impl StoreBackend for S3Backend {
    async fn put(&self, key: &str, data: Bytes) -> bool {
        let object = self.full_key(key);
        match self.send(Method::PUT, &object, &[], &[], data).await {
            Some(response) => response.status().is_success(),
            None => false,
        }
    }

    async fn get(&self, key: &str) -> Bytes {
        let object = self.full_key(key);
        let Some(response) = self.send(Method::GET, &object, &[], &[], Bytes::new()).await else {
            return Bytes::new();
        };
        if !response.status().is_success() {
            return Bytes::new();
        }
        response.bytes().await.unwrap_or_default()
    }

    async fn head(&self, key: &str) -> i64 {
        let object = self.full_key(key);
        let Some(response) = self.send(Method::HEAD, &object, &[], &[], Bytes::new()).await else {
            return 0;
        };
        if !response.status().is_success() {
            return 0;
        }
        response
            .headers()
            .get("content-length")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    async fn delete(&self, key: &str) -> bool {
        let object = self.full_key(key);
        match self.send(Method::DELETE, &object, &[], &[], Bytes::new()).await {
            Some(response) => {
                response.status().is_success() || response.status() == StatusCode::NOT_FOUND
            }
            None => false,
        }
    }

    async fn list_page(&self, prefix: &str, marker: Option<String>) -> ListPage {
        let mut query = vec![
            ("list-type", "2".to_string()),
            ("prefix", self.full_key(prefix)),
        ];
        if let Some(marker) = marker {
            query.push(("continuation-token", marker));
        }

        let Some(response) = self.send(Method::GET, "", &query, &[], Bytes::new()).await else {
            return ListPage::default();
        };
        if !response.status().is_success() {
            return ListPage::default();
        }
        let text = response.text().await.unwrap_or_default();

        let directory = format!("{}/", self.credentials.prefix);
        let keys = extract_tags(&text, "Key")
            .into_iter()
            .filter_map(|key| key.strip_prefix(&directory).map(str::to_string))
            .collect();
        let truncated = extract_tags(&text, "IsTruncated")
            .first()
            .map(|value| value == "true")
            .unwrap_or(false);
        let next_marker = extract_tags(&text, "NextContinuationToken")
            .into_iter()
            .next();

        debug!(
            "Listed page for prefix {} (truncated: {})",
            prefix, truncated
        );
        ListPage {
            keys,
            next_marker,
            truncated,
        }
    }

    async fn bulk_delete(&self, keys: &[String]) -> bool {
        if keys.is_empty() {
            return true;
        }

        let mut payload = String::from("<Delete><Quiet>true</Quiet>");
        for key in keys {
            payload.push_str("<Object><Key>");
            payload.push_str(&xml_escape(&self.full_key(key)));
            payload.push_str("</Key></Object>");
        }
        payload.push_str("</Delete>");
        let body = Bytes::from(payload);

        // DeleteObjects requires a payload checksum; SHA-256 is the one
        // modern providers accept in place of Content-MD5.
        let checksum_headers = [
            (
                "x-amz-checksum-sha256",
                BASE64.encode(sha256(&body)),
            ),
            (
                "x-amz-sdk-checksum-algorithm",
                "SHA256".to_string(),
            ),
        ];
        let query = [("delete", String::new())];
        let response = self
            .send(Method::POST, "", &query, &checksum_headers, body)
            .await;
        match response {
            Some(response) => response.status().is_success(),
            None => false,
        }
    }
}

/// SHA-256 digest
fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// HMAC-SHA256 with an arbitrary-length key
fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

/// Lowercase hex encoding
fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// AWS-style URI encoding; `encode_slash` controls whether `/` is kept
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if !encode_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

/// Extract the text content of every `<tag>...</tag>` occurrence
fn extract_tags(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else { break };
        values.push(xml_unescape(&rest[..end]));
        rest = &rest[end + close.len()..];
    }
    values
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xml_unescape(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode_preserves_slashes_for_paths() {
        assert_eq!(uri_encode("a/b c", false), "a/b%20c");
        assert_eq!(uri_encode("a/b c", true), "a%2Fb%20c");
    }

    #[test]
    fn test_extract_tags_reads_all_keys() {
        let xml = "<ListBucketResult><Contents><Key>p/a</Key></Contents>\
                   <Contents><Key>p/b</Key></Contents>\
                   <IsTruncated>false</IsTruncated></ListBucketResult>";
        assert_eq!(extract_tags(xml, "Key"), vec!["p/a", "p/b"]);
        assert_eq!(extract_tags(xml, "IsTruncated"), vec!["false"]);
    }

    #[test]
    fn test_signing_key_derivation_matches_reference() {
        // AWS documentation reference vectors for SigV4 key derivation
        let secret = "AWS4wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
        let k_date = hmac_sha256(secret.as_bytes(), b"20150830");
        let k_region = hmac_sha256(&k_date, b"us-east-1");
        let k_service = hmac_sha256(&k_region, b"iam");
        let signing_key = hmac_sha256(&k_service, b"aws4_request");
        assert_eq!(
            hex_encode(&signing_key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
    }
}
