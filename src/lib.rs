//! # Pushy
//!
//! An HTTP/2 client engine for Apple's Push Notification service (APNs).
//!
//! Pushy drives the APNs wire protocol directly over `h2` rather than
//! going through a general-purpose HTTP client, so it can see and react to
//! `SETTINGS`, `GOAWAY`, and `PING` the way APNs itself expects a
//! long-lived provider connection to behave. Authentication is either a
//! JWT bearer token minted from a P-256 signing key, or a client TLS
//! certificate.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use pushy::{Client, ClientConfig, PushNotification, SigningKey};
//!
//! #[tokio::main]
//! async fn main() -> pushy::Result<()> {
//!     let key = SigningKey::from_pkcs8_pem("TEAM1234AB", "KEYID6789A", &p8_pem)?;
//!     let config = ClientConfig::with_signing_key(key).production().build();
//!     let client = Client::new(config);
//!     client.connect().await?;
//!
//!     let notification = PushNotification::builder(device_token, payload.into())
//!         .topic("com.example.app")
//!         .build()
//!         .map_err(pushy::PushyError::LocalRejection)?;
//!
//!     let response = client.send(notification).await?;
//!     println!("{response:?}");
//!     Ok(())
//! }
//! ```

mod auth;
mod client;
mod codec;
mod connection;
mod error;
mod notification;
mod observer;
mod response;
pub mod server;
mod stream_table;
mod transport;

pub use auth::{AuthToken, SigningKey, TokenProvider, VerificationFailure, VerificationKey};
pub use client::{AuthMode, Client, ClientBuilder, ClientConfig, Endpoint};
pub use connection::ConnectionState;
pub use error::{Classification, PushyError, Result};
pub use notification::{Priority, PushNotification, PushType};
pub use observer::{ClientObserver, NoopObserver};
pub use response::{RejectionReason, Response};
pub use transport::{Http2Transport, Transport, TransportStream};

/// Common imports for applications embedding Pushy.
pub mod prelude {
    pub use crate::{
        AuthMode, Client, ClientBuilder, ClientConfig, Endpoint, PushNotification, PushyError,
        RejectionReason, Response, Result, SigningKey,
    };
}
