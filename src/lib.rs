//! StelloVault Auth Library
//!
//! Authentication building blocks for StelloVault services: password
//! hashing, EdDSA access tokens with a published key set, Stellar wallet
//! sign-in, OpenID Connect, rate limiting and rotating refresh sessions.

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod oidc;
pub mod password;
pub mod ratelimit;
pub mod session;
pub mod tasks;
pub mod telemetry;
pub mod token;
pub mod wallet;

pub use auth::{AuthService, AuthServiceBuilder};
pub use config::{AuthConfig, Environment};
pub use error::{AuthError, AuthResult};
