//! Flat-map REST server
//!
//! Routes are declared as a verb plus a path with an optional trailing
//! variable segment. Handlers receive the request headers, the decoded
//! flat string-map body, and the trailing argument, and return a status
//! code with a flat string-map body. Handlers run synchronously and must
//! not block on network I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{MeshError, Result};
use crate::runtime::StopSignal;

/// Maximum accepted request body size in bytes
pub const MAX_BODY_BYTES: usize = 100 * 1024;

const BODY_TOO_LONG_MESSAGE: &str = "Failed to read HTTP Request: Request Body Too Long";
const INVALID_JSON_MESSAGE: &str = "Failed to read HTTP Request: Invalid JSON Body";

/// HTTP verbs understood by the flat-map router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Status code and flat string-map body returned by a route handler
#[derive(Debug, Clone, Default)]
pub struct RouteResponse {
    pub code: u16,
    pub body: HashMap<String, String>,
}

impl RouteResponse {
    /// Create an empty response with the given status code
    pub fn new(code: u16) -> Self {
        Self {
            code,
            body: HashMap::new(),
        }
    }

    /// Add a body entry, builder style
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }
}

/// Handler signature: headers, body map, optional trailing path argument
pub type RouteHandler = Arc<
    dyn Fn(&HashMap<String, String>, &HashMap<String, String>, Option<&str>) -> RouteResponse
        + Send
        + Sync,
>;

/// A single declared route
#[derive(Clone)]
pub struct Route {
    pub method: HttpMethod,
    pub path: String,
    /// Name of the trailing path variable, if the route takes one
    pub route_arg: Option<String>,
    pub handler: RouteHandler,
}

impl Route {
    /// Declare a route without a trailing path variable
    pub fn new<F>(method: HttpMethod, path: &str, handler: F) -> Self
    where
        F: Fn(&HashMap<String, String>, &HashMap<String, String>, Option<&str>) -> RouteResponse
            + Send
            + Sync
            + 'static,
    {
        Self {
            method,
            path: path.to_string(),
            route_arg: None,
            handler: Arc::new(handler),
        }
    }

    /// Declare a route with a trailing path variable
    pub fn with_arg<F>(method: HttpMethod, path: &str, arg: &str, handler: F) -> Self
    where
        F: Fn(&HashMap<String, String>, &HashMap<String, String>, Option<&str>) -> RouteResponse
            + Send
            + Sync
            + 'static,
    {
        Self {
            method,
            path: path.to_string(),
            route_arg: Some(arg.to_string()),
            handler: Arc::new(handler),
        }
    }
}

/// Thin verb + path + JSON-map REST server
pub struct RestServer {
    routes: Vec<Route>,
}

impl RestServer {
    /// Create a server with no routes
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a route
    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Register a batch of routes
    pub fn add_routes(&mut self, routes: Vec<Route>) {
        self.routes.extend(routes);
    }

    /// Bind the listener and serve until the shutdown signal fires.
    ///
    /// Returns the bound address (useful with port 0) and the join
    /// handle of the serving task.
    pub async fn serve(
        self,
        addr: &str,
        stop: &StopSignal,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let mut router = Router::new();
        for route in self.routes {
            let path = match &route.route_arg {
                Some(arg) => format!("{}/{{{}}}", route.path, arg),
                None => route.path.clone(),
            };
            let takes_arg = route.route_arg.is_some();
            let handler = route.handler;
            let service = move |arg: Option<Path<String>>, headers: HeaderMap, body: Bytes| {
                let handler = handler.clone();
                async move {
                    dispatch(
                        handler,
                        headers,
                        arg.filter(|_| takes_arg).map(|Path(value)| value),
                        body,
                    )
                }
            };
            router = match route.method {
                HttpMethod::Get => router.route(&path, get(service)),
                HttpMethod::Post => router.route(&path, post(service)),
            };
        }
        // The body cap is enforced in dispatch() so the over-limit error
        // payload stays under our control; the axum limit is only a
        // memory backstop slightly above the cap.
        let router = router.layer(DefaultBodyLimit::max(MAX_BODY_BYTES * 2));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeshError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| MeshError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let mut stop_listener = stop.listener();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    stop_listener.stopped().await;
                })
                .await;
            if let Err(e) = result {
                warn!("REST server on {} exited with error: {}", local_addr, e);
            }
        });

        info!("REST server listening on {}", local_addr);
        Ok((local_addr, handle))
    }
}

impl Default for RestServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode the request, invoke the handler, encode the response.
fn dispatch(
    handler: RouteHandler,
    headers: HeaderMap,
    route_arg: Option<String>,
    body: Bytes,
) -> Response {
    if body.len() > MAX_BODY_BYTES {
        let mut error_body = HashMap::new();
        error_body.insert("Status".to_string(), "Error".to_string());
        error_body.insert("Message".to_string(), BODY_TOO_LONG_MESSAGE.to_string());
        return map_response(400, &error_body);
    }

    let mut header_values = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(text) = value.to_str() {
            header_values.insert(name.as_str().to_string(), text.to_string());
        }
    }

    // An absent body decodes to an empty map; a present body must be a
    // JSON object and only its string-valued members are kept.
    let mut body_values = HashMap::new();
    if !body.is_empty() {
        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Object(members)) => {
                for (key, value) in members {
                    if let serde_json::Value::String(text) = value {
                        body_values.insert(key, text);
                    }
                }
            }
            _ => {
                return (StatusCode::BAD_REQUEST, INVALID_JSON_MESSAGE).into_response();
            }
        }
    }

    let response = handler(&header_values, &body_values, route_arg.as_deref());
    map_response(response.code, &response.body)
}

/// Encode a flat string map as a JSON response with the given status.
fn map_response(code: u16, body: &HashMap<String, String>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let payload = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_response_builder() {
        let response = RouteResponse::new(201)
            .with("AddedNode", "True")
            .with("NodeId", "n1");
        assert_eq!(response.code, 201);
        assert_eq!(response.body["AddedNode"], "True");
        assert_eq!(response.body["NodeId"], "n1");
    }

    #[test]
    fn test_dispatch_rejects_oversized_body() {
        let handler: RouteHandler = Arc::new(|_, _, _| RouteResponse::new(200));
        let body = Bytes::from(vec![b'x'; MAX_BODY_BYTES + 1]);
        let response = dispatch(handler, HeaderMap::new(), None, body);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_dispatch_rejects_invalid_json() {
        let handler: RouteHandler = Arc::new(|_, _, _| RouteResponse::new(200));
        let body = Bytes::from_static(b"not json at all");
        let response = dispatch(handler, HeaderMap::new(), None, body);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_dispatch_ignores_non_string_values() {
        let handler: RouteHandler = Arc::new(|_, body, _| {
            let mut response = RouteResponse::new(200);
            response.body.insert("Count".to_string(), body.len().to_string());
            response
        });
        let body = Bytes::from_static(b"{\"NodeId\":\"n1\",\"Depth\":3}");
        let response = dispatch(handler, HeaderMap::new(), None, body);
        assert_eq!(response.status(), StatusCode::OK);
    }
}
