//! Server-side protocol rules (C6) and, behind the `mock-server` feature,
//! an in-process mock APNs server the integration tests drive over real
//! HTTP/2 (§4.6, §10.5).

pub mod rules;

#[cfg(feature = "mock-server")]
pub mod mock;

#[cfg(feature = "mock-server")]
pub use mock::{MockServer, MockServerBuilder};
