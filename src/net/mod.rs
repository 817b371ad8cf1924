//! REST transport surface
//!
//! Thin verb + path + flat JSON string-map server and client used for
//! every node-to-node RPC in the cluster.

pub mod client;
pub mod server;

pub use client::{RestClient, RestResponse};
pub use server::{HttpMethod, RestServer, Route, RouteResponse, MAX_BODY_BYTES};
