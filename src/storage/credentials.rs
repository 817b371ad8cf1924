//! Object-store credentials
//!
//! Carries everything needed to reach one prefix-scoped slice of an
//! S3-compatible bucket. The directory prefix is part of the
//! credentials: two instances with different prefixes never see each
//! other's keys.

/// Connection and scoping parameters for an S3-compatible store
#[derive(Debug, Clone)]
pub struct StoreCredentials {
    /// Endpoint URL, e.g. `http://localhost:9000`
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Directory prefix scoping every key of this instance
    pub prefix: String,
    /// Region used for request signing
    pub region: String,
    /// Access key id
    pub access_key: String,
    /// Secret access key
    pub secret_key: String,
}

impl Default for StoreCredentials {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            bucket: "gridmesh".into(),
            prefix: "gridmesh".into(),
            region: "us-east-1".into(),
            access_key: String::new(),
            secret_key: String::new(),
        }
    }
}

impl StoreCredentials {
    /// Host portion of the endpoint, as used in signed `Host` headers
    pub fn host(&self) -> String {
        self.endpoint
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_strips_scheme() {
        let credentials = StoreCredentials {
            endpoint: "http://minio.local:9000".into(),
            ..Default::default()
        };
        assert_eq!(credentials.host(), "minio.local:9000");
    }
}
