//! Authentication façade
//!
//! Wires the password hasher, token signer and verifier, wallet sign-in,
//! OIDC relying party, rate limiter and refresh sessions into one service.

mod service;

pub use service::{AuthService, AuthServiceBuilder};
