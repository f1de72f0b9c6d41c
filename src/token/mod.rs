//! Token signing and verification
//!
//! Access and refresh tokens are EdDSA-signed JWTs carrying the signing
//! key's `kid`. Third-party bearer and identity tokens are verified against
//! their issuers' published key sets.

pub mod claims;
pub mod jwks;
pub mod keys;
pub mod keyset;
pub mod signer;
pub mod verifier;

pub use claims::{Audience, Claims, TokenType};
pub use jwks::{key_set_router, serve_key_set, KeySetDocument, KEY_SET_PATH};
pub use keys::{KeyRing, SigningKeyMaterial};
pub use keyset::KeySetCache;
pub use signer::TokenSigner;
pub use verifier::{BearerVerifier, IssuerTrust, PinnedKey};
