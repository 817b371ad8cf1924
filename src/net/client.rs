//! Flat-map REST client
//!
//! Outbound counterpart of the REST server: requests carry a flat JSON
//! string map, responses are decoded back into one. Transport failures
//! never surface as errors; callers observe them as non-2xx codes.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use super::server::HttpMethod;

/// Default timeout applied to every outbound request
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Decoded response from a flat-map request.
///
/// The HTTP status is only adopted when the response body parses as a
/// JSON object; any other payload (including transport failures, which
/// produce an empty body) yields code 400 with a `Status`/`Message`
/// pair. The membership loops rely on this: a peer that cannot answer
/// with a well-formed status map is not contactable.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub code: u16,
    pub body: HashMap<String, String>,
}

impl RestResponse {
    fn failure(message: String) -> Self {
        let mut body = HashMap::new();
        body.insert("Status".to_string(), "Error".to_string());
        body.insert("Message".to_string(), message);
        Self { code: 400, body }
    }
}

/// Flat-map REST client with bounded retries
#[derive(Clone)]
pub struct RestClient {
    client: Client,
}

impl RestClient {
    /// Create a client with the default request timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// Create a client with a custom request timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// GET a flat-map resource, no retries
    pub async fn get(&self, url: &str) -> RestResponse {
        self.request(HttpMethod::Get, url, &HashMap::new(), 1).await
    }

    /// POST a flat string map, no retries
    pub async fn post(&self, url: &str, body: &HashMap<String, String>) -> RestResponse {
        self.request(HttpMethod::Post, url, body, 1).await
    }

    /// Perform a request, retrying until a status below 300 is seen or
    /// the retry limit is exhausted. A limit below one is treated as one.
    pub async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: &HashMap<String, String>,
        retry_limit: u32,
    ) -> RestResponse {
        let retry_limit = retry_limit.max(1);
        let mut response = RestResponse::failure(String::new());

        let mut attempt = 0;
        while response.code >= 300 && attempt < retry_limit {
            attempt += 1;
            response = self.request_once(method, url, body).await;
            if response.code >= 300 {
                debug!(
                    "Request attempt {}/{} to {} returned {}",
                    attempt, retry_limit, url, response.code
                );
            }
        }

        response
    }

    async fn request_once(
        &self,
        method: HttpMethod,
        url: &str,
        body: &HashMap<String, String>,
    ) -> RestResponse {
        let builder = match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => {
                let payload = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
                self.client.post(url).body(payload)
            }
        };

        let raw = match builder.send().await {
            Ok(raw) => raw,
            Err(e) => return RestResponse::failure(e.to_string()),
        };

        let status = raw.status().as_u16();
        let text = raw.text().await.unwrap_or_default();

        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Object(members)) => {
                let mut decoded = HashMap::new();
                for (key, value) in members {
                    if let serde_json::Value::String(item) = value {
                        decoded.insert(key, item);
                    }
                }
                RestResponse {
                    code: status,
                    body: decoded,
                }
            }
            _ => RestResponse::failure(text),
        }
    }
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_response_shape() {
        let response = RestResponse::failure("connection refused".to_string());
        assert_eq!(response.code, 400);
        assert_eq!(response.body["Status"], "Error");
        assert_eq!(response.body["Message"], "connection refused");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_failure() {
        let client = RestClient::with_timeout(Duration::from_millis(200));
        let response = client.get("http://127.0.0.1:1/internal/master/status").await;
        assert_eq!(response.code, 400);
        assert_eq!(response.body["Status"], "Error");
    }
}
