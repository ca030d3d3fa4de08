//! Service façade: the RPC-shaped boundary over the registry.
//!
//! Requests and responses are plain serde messages; the service translates
//! them onto registry/network/pool operations, and the REST layer maps the
//! result (or error) onto HTTP.

pub mod rest;
pub mod schemas;
pub mod service;

pub use rest::router;
pub use service::IpamService;
