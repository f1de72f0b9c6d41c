//! OpenID Connect relying party for third-party sign-in

pub mod apple;
pub mod discovery;
pub mod pkce;
pub mod provider;
pub mod relying_party;

pub use apple::{AppleClientSecret, AppleSecretConfig};
pub use discovery::{DiscoveryClient, DiscoveryDocument};
pub use provider::{ClientSecret, ProviderConfig, ProviderOverride, ProviderRegistry};
pub use relying_party::{AuthorizationRequest, OidcIdentity, RelyingParty};
