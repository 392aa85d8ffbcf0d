//! HTTP surface of the broker, for Axum.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use credential_broker::{BrokerConfig, MemorySessionStore};
//! use credential_broker::server::broker_routes;
//!
//! let config = BrokerConfig::from_env()?;
//! let broker = config.build_broker(Arc::new(MemorySessionStore::new()))?;
//!
//! let app = broker_routes(Arc::new(broker), config.server.clone());
//! axum::serve(listener, app).await?;
//! ```
//!
//! Errors render as `{"error": <code>, "message": ..., "upstream_status"?: ...}`
//! with the status chosen by [`ApiError`].

mod config;
mod cookies;
mod error;
mod extractor;
mod routes;
mod state;

pub use config::ServerSettings;
pub use error::ApiError;
pub use extractor::JsonOrForm;
pub use routes::broker_routes;

/// Re-export cookie key type for builder API.
pub use axum_extra::extract::cookie::Key as CookieKey;
