//! Provider registry
//!
//! Built-in defaults for well-known identity providers, merged with the
//! caller's per-provider settings. The registry is passed to the relying
//! party at construction; nothing here is global.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::apple::{AppleClientSecret, AppleSecretConfig};
use crate::error::{AuthError, AuthResult};

pub const GOOGLE: &str = "google";
pub const APPLE: &str = "apple";
pub const MICROSOFT: &str = "microsoft";

/// Where the token-endpoint `client_secret` comes from
#[derive(Debug, Clone, Default)]
pub enum ClientSecret {
    /// Public client
    #[default]
    None,
    Static(String),
    /// Minted per exchange
    Apple(Arc<AppleClientSecret>),
}

impl ClientSecret {
    pub fn resolve(&self, now: DateTime<Utc>) -> AuthResult<Option<String>> {
        match self {
            ClientSecret::None => Ok(None),
            ClientSecret::Static(secret) => Ok(Some(secret.clone())),
            ClientSecret::Apple(minter) => minter.mint(now).map(Some),
        }
    }
}

/// Effective settings for one provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: ClientSecret,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Extra authorization request parameters (e.g. `response_mode`)
    pub extra_auth_params: BTreeMap<String, String>,
    /// Whether the token endpoint accepts `code_verifier`
    pub use_pkce: bool,
}

/// Caller-supplied settings for a provider
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderOverride {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    /// Added to the default scopes
    pub scopes: Vec<String>,
    /// Required for providers without built-in defaults
    pub issuer: Option<String>,
    pub extra_auth_params: BTreeMap<String, String>,
    pub use_pkce: Option<bool>,
    #[serde(skip)]
    pub apple_secret: Option<AppleSecretConfig>,
}

/// Built-in defaults for a provider name
pub fn defaults_for(name: &str) -> Option<ProviderConfig> {
    let base = |issuer: &str, scopes: &[&str]| ProviderConfig {
        name: name.to_string(),
        issuer: issuer.to_string(),
        client_id: String::new(),
        client_secret: ClientSecret::None,
        redirect_uri: String::new(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        extra_auth_params: BTreeMap::new(),
        use_pkce: true,
    };

    match name {
        GOOGLE => Some(base(
            "https://accounts.google.com",
            &["openid", "email", "profile"],
        )),
        APPLE => {
            let mut apple = base("https://appleid.apple.com", &["openid", "email", "name"]);
            apple
                .extra_auth_params
                .insert("response_mode".to_string(), "form_post".to_string());
            apple.use_pkce = false;
            Some(apple)
        }
        MICROSOFT => Some(base(
            "https://login.microsoftonline.com/common/v2.0",
            &["openid", "email", "profile"],
        )),
        _ => None,
    }
}

/// De-duplicate in first-seen order and make sure `openid` is present
pub fn merge_scopes(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + extra.len() + 1);
    for scope in base.iter().chain(extra) {
        if !scope.is_empty() && !merged.contains(scope) {
            merged.push(scope.clone());
        }
    }
    if !merged.iter().any(|s| s == "openid") {
        merged.insert(0, "openid".to_string());
    }
    merged
}

/// Providers by name
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `overrides` into the built-in defaults
    pub fn from_overrides(overrides: HashMap<String, ProviderOverride>) -> AuthResult<Self> {
        let mut registry = Self::new();
        for (name, settings) in overrides {
            registry = registry.with_override(&name, settings)?;
        }
        Ok(registry)
    }

    pub fn with_override(mut self, name: &str, settings: ProviderOverride) -> AuthResult<Self> {
        let mut config = match (defaults_for(name), &settings.issuer) {
            (Some(mut defaults), Some(issuer)) => {
                defaults.issuer = issuer.clone();
                defaults
            }
            (Some(defaults), None) => defaults,
            (None, Some(issuer)) => ProviderConfig {
                name: name.to_string(),
                issuer: issuer.clone(),
                client_id: String::new(),
                client_secret: ClientSecret::None,
                redirect_uri: String::new(),
                scopes: Vec::new(),
                extra_auth_params: BTreeMap::new(),
                use_pkce: true,
            },
            (None, None) => {
                return Err(AuthError::InvalidInput(format!(
                    "provider '{}' has no defaults and no issuer",
                    name
                )))
            }
        };

        if settings.client_id.is_empty() || settings.redirect_uri.is_empty() {
            return Err(AuthError::InvalidInput(format!(
                "provider '{}' needs client_id and redirect_uri",
                name
            )));
        }

        config.client_id = settings.client_id;
        config.redirect_uri = settings.redirect_uri;
        config.scopes = merge_scopes(&config.scopes, &settings.scopes);
        config.extra_auth_params.extend(settings.extra_auth_params);
        if let Some(use_pkce) = settings.use_pkce {
            config.use_pkce = use_pkce;
        }
        config.client_secret = match (settings.apple_secret, settings.client_secret) {
            (Some(apple), _) => ClientSecret::Apple(Arc::new(AppleClientSecret::new(apple)?)),
            (None, Some(secret)) => ClientSecret::Static(secret),
            (None, None) => ClientSecret::None,
        };

        self.providers.insert(name.to_string(), config);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> AuthResult<&ProviderConfig> {
        self.providers
            .get(name)
            .ok_or_else(|| AuthError::InvalidInput(format!("unknown provider '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProviderOverride {
        ProviderOverride {
            client_id: "client-1".to_string(),
            redirect_uri: "https://app.example.com/callback".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_google_defaults_merged() {
        let registry = ProviderRegistry::new()
            .with_override(
                GOOGLE,
                ProviderOverride {
                    scopes: vec!["email".to_string(), "calendar".to_string()],
                    client_secret: Some("shh".to_string()),
                    ..settings()
                },
            )
            .unwrap();

        let google = registry.get(GOOGLE).unwrap();
        assert_eq!(google.issuer, "https://accounts.google.com");
        assert_eq!(google.scopes, vec!["openid", "email", "profile", "calendar"]);
        assert!(google.use_pkce);
        assert!(matches!(google.client_secret, ClientSecret::Static(_)));
    }

    #[test]
    fn test_apple_uses_form_post_without_pkce() {
        let registry = ProviderRegistry::new().with_override(APPLE, settings()).unwrap();
        let apple = registry.get(APPLE).unwrap();

        assert!(!apple.use_pkce);
        assert_eq!(
            apple.extra_auth_params.get("response_mode").map(String::as_str),
            Some("form_post")
        );
    }

    #[test]
    fn test_custom_provider_needs_issuer() {
        assert!(ProviderRegistry::new().with_override("acme", settings()).is_err());

        let registry = ProviderRegistry::new()
            .with_override(
                "acme",
                ProviderOverride {
                    issuer: Some("https://login.acme.test".to_string()),
                    ..settings()
                },
            )
            .unwrap();
        assert_eq!(registry.get("acme").unwrap().scopes, vec!["openid"]);
    }

    #[test]
    fn test_unknown_provider_lookup() {
        let registry = ProviderRegistry::new();
        assert!(matches!(registry.get("google"), Err(AuthError::InvalidInput(_))));
    }

    #[test]
    fn test_merge_scopes_ensures_openid() {
        let merged = merge_scopes(&["email".to_string()], &["email".to_string()]);
        assert_eq!(merged, vec!["openid", "email"]);
    }
}
