//! Sign-in message format
//!
//! The signature covers the literal message bytes, so the layout is fixed:
//!
//! ```text
//! {domain} wants you to sign in with your Stellar account:
//! {address}
//!
//! {statement}
//!
//! URI: {uri}
//! Version: {version}
//! Chain ID: {chain_id}
//! Nonce: {nonce}
//! Issued At: {issued_at}
//! Expiration Time: {expiration_time}
//! Not Before: {not_before}
//! Request ID: {request_id}
//! Resources:
//! - {resource}
//! ```
//!
//! Only the nonce and issued-at fields are required. The statement block
//! (with its surrounding blank line) is present only when there is a
//! statement.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum nonce length accepted on parse
pub const MIN_NONCE_LEN: usize = 8;

pub const DEFAULT_VERSION: &str = "1";
pub const DEFAULT_CHAIN_ID: &str = "mainnet";

/// Default challenge lifetime
pub const DEFAULT_EXPIRY_MINUTES: i64 = 15;

const HEADER_SUFFIX: &str = " wants you to sign in with your Stellar account:";

const URI: &str = "URI: ";
const VERSION: &str = "Version: ";
const CHAIN_ID: &str = "Chain ID: ";
const NONCE: &str = "Nonce: ";
const ISSUED_AT: &str = "Issued At: ";
const EXPIRATION_TIME: &str = "Expiration Time: ";
const NOT_BEFORE: &str = "Not Before: ";
const REQUEST_ID: &str = "Request ID: ";
const RESOURCES: &str = "Resources:";
const RESOURCE_ITEM: &str = "- ";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MessageError {
    #[error("invalid header line")]
    InvalidHeader,

    #[error("missing address line")]
    MissingAddress,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("duplicate field: {0}")]
    DuplicateField(&'static str),

    #[error("unexpected line: {0}")]
    UnexpectedLine(String),

    #[error("nonce must be at least {MIN_NONCE_LEN} characters")]
    NonceTooShort,

    #[error("invalid timestamp in {0}")]
    InvalidTimestamp(&'static str),

    #[error("statement must be a single trimmed line")]
    InvalidStatement,

    #[error("message is not in canonical form")]
    NotCanonical,

    #[error("message has expired")]
    Expired,

    #[error("message is not yet valid")]
    NotYetValid,

    #[error("issued-at is in the future")]
    IssuedInFuture,

    #[error("message was issued for another domain")]
    DomainMismatch,
}

/// Structured sign-in request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInInput {
    pub domain: String,
    pub address: String,
    pub statement: Option<String>,
    pub uri: Option<String>,
    pub version: Option<String>,
    pub chain_id: Option<String>,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub request_id: Option<String>,
    pub resources: Vec<String>,
}

/// 16 random bytes, base64url without padding
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC 3339 timestamp, accepting only the canonical `...Z` form
fn parse_timestamp(value: &str, field: &'static str) -> Result<DateTime<Utc>, MessageError> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|_| MessageError::InvalidTimestamp(field))?
        .with_timezone(&Utc);
    if format_timestamp(&parsed) != value {
        return Err(MessageError::InvalidTimestamp(field));
    }
    Ok(parsed)
}

fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

fn set_once<T>(
    slot: &mut Option<T>,
    value: T,
    field: &'static str,
) -> Result<(), MessageError> {
    if slot.is_some() {
        return Err(MessageError::DuplicateField(field));
    }
    *slot = Some(value);
    Ok(())
}

impl SignInInput {
    /// New request with a fresh nonce and the default version, chain id and expiry
    pub fn new(domain: impl Into<String>, address: impl Into<String>, now: DateTime<Utc>) -> Self {
        let issued_at = truncate_to_seconds(now);
        Self {
            domain: domain.into(),
            address: address.into(),
            statement: None,
            uri: None,
            version: Some(DEFAULT_VERSION.to_string()),
            chain_id: Some(DEFAULT_CHAIN_ID.to_string()),
            nonce: generate_nonce(),
            issued_at,
            expiration_time: Some(issued_at + Duration::minutes(DEFAULT_EXPIRY_MINUTES)),
            not_before: None,
            request_id: None,
            resources: Vec::new(),
        }
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = Some(chain_id.into());
        self
    }

    pub fn with_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_time = Some(truncate_to_seconds(at));
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(truncate_to_seconds(at));
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    /// Field checks that keep the message unambiguous to parse
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.domain.is_empty() || self.domain.contains(char::is_whitespace) {
            return Err(MessageError::InvalidHeader);
        }
        if self.address.is_empty() || self.address.contains(char::is_whitespace) {
            return Err(MessageError::MissingAddress);
        }
        if let Some(statement) = &self.statement {
            if statement.is_empty() || statement.contains('\n') || statement.trim() != statement {
                return Err(MessageError::InvalidStatement);
            }
        }
        if self.nonce.len() < MIN_NONCE_LEN {
            return Err(MessageError::NonceTooShort);
        }
        let single_line = |value: &Option<String>| value.as_deref().map_or(true, |v| !v.contains('\n'));
        if !single_line(&self.uri)
            || !single_line(&self.version)
            || !single_line(&self.chain_id)
            || !single_line(&self.request_id)
            || self.resources.iter().any(|r| r.contains('\n'))
            || self.nonce.contains('\n')
        {
            return Err(MessageError::NotCanonical);
        }
        Ok(())
    }

    /// Canonical message text
    pub fn to_message(&self) -> String {
        let mut message = format!("{}{}\n{}", self.domain, HEADER_SUFFIX, self.address);

        if let Some(statement) = &self.statement {
            message.push_str("\n\n");
            message.push_str(statement);
        }
        message.push('\n');

        if let Some(uri) = &self.uri {
            message.push('\n');
            message.push_str(URI);
            message.push_str(uri);
        }
        if let Some(version) = &self.version {
            message.push('\n');
            message.push_str(VERSION);
            message.push_str(version);
        }
        if let Some(chain_id) = &self.chain_id {
            message.push('\n');
            message.push_str(CHAIN_ID);
            message.push_str(chain_id);
        }

        message.push('\n');
        message.push_str(NONCE);
        message.push_str(&self.nonce);
        message.push('\n');
        message.push_str(ISSUED_AT);
        message.push_str(&format_timestamp(&self.issued_at));

        if let Some(at) = &self.expiration_time {
            message.push('\n');
            message.push_str(EXPIRATION_TIME);
            message.push_str(&format_timestamp(at));
        }
        if let Some(at) = &self.not_before {
            message.push('\n');
            message.push_str(NOT_BEFORE);
            message.push_str(&format_timestamp(at));
        }
        if let Some(request_id) = &self.request_id {
            message.push('\n');
            message.push_str(REQUEST_ID);
            message.push_str(request_id);
        }

        if !self.resources.is_empty() {
            message.push('\n');
            message.push_str(RESOURCES);
            for resource in &self.resources {
                message.push('\n');
                message.push_str(RESOURCE_ITEM);
                message.push_str(resource);
            }
        }

        message
    }

    /// Parse a message produced by [`SignInInput::to_message`].
    ///
    /// Anything that would not serialize back to the same bytes is rejected.
    pub fn parse(message: &str) -> Result<Self, MessageError> {
        let lines: Vec<&str> = message.split('\n').collect();

        let domain = lines
            .first()
            .and_then(|line| line.strip_suffix(HEADER_SUFFIX))
            .filter(|domain| !domain.is_empty())
            .ok_or(MessageError::InvalidHeader)?;
        let address = lines
            .get(1)
            .filter(|address| !address.is_empty())
            .ok_or(MessageError::MissingAddress)?;

        match lines.get(2) {
            None => return Err(MessageError::MissingField("Nonce")),
            Some(line) if !line.is_empty() => return Err(MessageError::NotCanonical),
            Some(_) => {}
        }

        // The statement, when present, is the only line between two blank lines
        let (statement, field_start) = match (lines.get(3), lines.get(4)) {
            (Some(statement), Some(&"")) => (statement.to_string(), 5),
            _ => (String::new(), 3),
        };

        let mut uri = None;
        let mut version = None;
        let mut chain_id = None;
        let mut nonce = None;
        let mut issued_at = None;
        let mut expiration_time = None;
        let mut not_before = None;
        let mut request_id = None;
        let mut resources = Vec::new();
        let mut in_resources = false;

        for line in &lines[field_start..] {
            if in_resources {
                match line.strip_prefix(RESOURCE_ITEM) {
                    Some(resource) => {
                        resources.push(resource.to_string());
                        continue;
                    }
                    None => return Err(MessageError::UnexpectedLine(line.to_string())),
                }
            }

            if let Some(value) = line.strip_prefix(URI) {
                set_once(&mut uri, value.to_string(), "URI")?;
            } else if let Some(value) = line.strip_prefix(VERSION) {
                set_once(&mut version, value.to_string(), "Version")?;
            } else if let Some(value) = line.strip_prefix(CHAIN_ID) {
                set_once(&mut chain_id, value.to_string(), "Chain ID")?;
            } else if let Some(value) = line.strip_prefix(NONCE) {
                set_once(&mut nonce, value.to_string(), "Nonce")?;
            } else if let Some(value) = line.strip_prefix(ISSUED_AT) {
                set_once(&mut issued_at, parse_timestamp(value, "Issued At")?, "Issued At")?;
            } else if let Some(value) = line.strip_prefix(EXPIRATION_TIME) {
                set_once(
                    &mut expiration_time,
                    parse_timestamp(value, "Expiration Time")?,
                    "Expiration Time",
                )?;
            } else if let Some(value) = line.strip_prefix(NOT_BEFORE) {
                set_once(
                    &mut not_before,
                    parse_timestamp(value, "Not Before")?,
                    "Not Before",
                )?;
            } else if let Some(value) = line.strip_prefix(REQUEST_ID) {
                set_once(&mut request_id, value.to_string(), "Request ID")?;
            } else if *line == RESOURCES {
                in_resources = true;
            } else {
                return Err(MessageError::UnexpectedLine(line.to_string()));
            }
        }

        let nonce = nonce.ok_or(MessageError::MissingField("Nonce"))?;
        if nonce.len() < MIN_NONCE_LEN {
            return Err(MessageError::NonceTooShort);
        }
        let issued_at = issued_at.ok_or(MessageError::MissingField("Issued At"))?;

        let input = Self {
            domain: domain.to_string(),
            address: address.to_string(),
            statement: if statement.is_empty() {
                None
            } else {
                Some(statement)
            },
            uri,
            version,
            chain_id,
            nonce,
            issued_at,
            expiration_time,
            not_before,
            request_id,
            resources,
        };

        if input.to_message() != message {
            return Err(MessageError::NotCanonical);
        }
        Ok(input)
    }

    /// Freshness checks against `now`; `skew` bounds how far issued-at may lead
    pub fn validate_timestamps(&self, now: DateTime<Utc>, skew: Duration) -> Result<(), MessageError> {
        if let Some(expiration_time) = self.expiration_time {
            if now >= expiration_time {
                return Err(MessageError::Expired);
            }
        }
        if let Some(not_before) = self.not_before {
            if now < not_before {
                return Err(MessageError::NotYetValid);
            }
        }
        if self.issued_at > now + skew {
            return Err(MessageError::IssuedInFuture);
        }
        Ok(())
    }

    /// Host comparison is case-insensitive
    pub fn validate_domain(&self, expected: &str) -> Result<(), MessageError> {
        if self.domain.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(MessageError::DomainMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ADDRESS: &str = "GAAZI4TCR3TY5OJHCTJC2A4QSY6CJWJH5IAJTGKIN2ER7LBNVKOCCWN7";

    fn issued() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 5, 11, 0, 0).unwrap()
    }

    fn minimal() -> SignInInput {
        SignInInput {
            domain: "example.com".to_string(),
            address: ADDRESS.to_string(),
            statement: None,
            uri: None,
            version: None,
            chain_id: None,
            nonce: "abc12345".to_string(),
            issued_at: issued(),
            expiration_time: None,
            not_before: None,
            request_id: None,
            resources: Vec::new(),
        }
    }

    #[test]
    fn test_minimal_layout() {
        let expected = format!(
            "example.com wants you to sign in with your Stellar account:\n{}\n\nNonce: abc12345\nIssued At: 2025-12-05T11:00:00Z",
            ADDRESS
        );
        assert_eq!(minimal().to_message(), expected);
        assert_eq!(SignInInput::parse(&expected).unwrap(), minimal());
    }

    #[test]
    fn test_full_round_trip() {
        let input = SignInInput {
            statement: Some("Sign in to StelloVault".to_string()),
            uri: Some("https://example.com/login".to_string()),
            version: Some("1".to_string()),
            chain_id: Some("testnet".to_string()),
            expiration_time: Some(issued() + Duration::minutes(15)),
            not_before: Some(issued()),
            request_id: Some("req-42".to_string()),
            resources: vec![
                "https://example.com/terms".to_string(),
                "ipfs://bafybeic".to_string(),
            ],
            ..minimal()
        };

        let message = input.to_message();
        assert!(message.contains(&format!("{}\n\nSign in to StelloVault\n\nURI: ", ADDRESS)));
        assert!(message.ends_with("Resources:\n- https://example.com/terms\n- ipfs://bafybeic"));
        assert_eq!(SignInInput::parse(&message).unwrap(), input);
    }

    #[test]
    fn test_each_optional_field_round_trips_alone() {
        let variants = vec![
            minimal().with_statement("hello"),
            minimal().with_uri("https://example.com"),
            minimal().with_chain_id("futurenet"),
            minimal().with_expiration(issued() + Duration::minutes(1)),
            minimal().with_not_before(issued()),
            minimal().with_request_id("r1"),
            minimal().with_resources(vec!["a".to_string()]),
        ];

        for input in variants {
            let message = input.to_message();
            assert_eq!(SignInInput::parse(&message).unwrap(), input, "{}", message);
        }
    }

    #[test]
    fn test_new_fills_defaults() {
        let input = SignInInput::new("example.com", ADDRESS, issued());
        assert_eq!(input.version.as_deref(), Some(DEFAULT_VERSION));
        assert_eq!(input.chain_id.as_deref(), Some(DEFAULT_CHAIN_ID));
        assert_eq!(input.expiration_time, Some(issued() + Duration::minutes(15)));
        assert_eq!(input.nonce.len(), 22);
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_nonces_are_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn test_rejects_bad_header() {
        let message = minimal().to_message().replace("Stellar", "Ethereum");
        assert_eq!(SignInInput::parse(&message), Err(MessageError::InvalidHeader));
    }

    #[test]
    fn test_rejects_short_nonce() {
        let input = SignInInput {
            nonce: "n1".to_string(),
            ..minimal()
        };
        assert_eq!(
            SignInInput::parse(&input.to_message()),
            Err(MessageError::NonceTooShort)
        );
    }

    #[test]
    fn test_rejects_missing_issued_at() {
        let message = format!(
            "example.com wants you to sign in with your Stellar account:\n{}\n\nNonce: abc12345",
            ADDRESS
        );
        assert_eq!(
            SignInInput::parse(&message),
            Err(MessageError::MissingField("Issued At"))
        );
    }

    #[test]
    fn test_rejects_non_canonical_whitespace() {
        let message = minimal().to_message().replace("\n\nNonce", "\n\n\nNonce");
        assert!(SignInInput::parse(&message).is_err());

        let with_cr = minimal().to_message().replace('\n', "\r\n");
        assert!(SignInInput::parse(&with_cr).is_err());
    }

    #[test]
    fn test_rejects_offset_timestamps() {
        let message = minimal()
            .to_message()
            .replace("2025-12-05T11:00:00Z", "2025-12-05T12:00:00+01:00");
        assert_eq!(
            SignInInput::parse(&message),
            Err(MessageError::InvalidTimestamp("Issued At"))
        );
    }

    #[test]
    fn test_timestamp_validation() {
        let skew = Duration::minutes(5);
        let input = minimal()
            .with_expiration(issued() + Duration::minutes(15))
            .with_not_before(issued() + Duration::minutes(1));

        assert_eq!(
            input.validate_timestamps(issued(), skew),
            Err(MessageError::NotYetValid)
        );
        assert!(input
            .validate_timestamps(issued() + Duration::minutes(2), skew)
            .is_ok());
        assert_eq!(
            input.validate_timestamps(issued() + Duration::minutes(15), skew),
            Err(MessageError::Expired)
        );

        let future = minimal();
        assert_eq!(
            future.validate_timestamps(issued() - Duration::minutes(6), skew),
            Err(MessageError::IssuedInFuture)
        );
        assert!(future
            .validate_timestamps(issued() - Duration::minutes(4), skew)
            .is_ok());
    }

    #[test]
    fn test_multiline_statement_invalid() {
        let input = minimal().with_statement("line one\nNonce: forged123");
        assert_eq!(input.validate(), Err(MessageError::InvalidStatement));
    }

    #[test]
    fn test_statement_resembling_a_field_round_trips() {
        for statement in ["Nonce: not-the-nonce", "URI: https://elsewhere.test", "Resources:"] {
            let input = minimal().with_statement(statement).with_uri("https://example.com");
            assert!(input.validate().is_ok());
            let message = input.to_message();
            assert_eq!(SignInInput::parse(&message).unwrap(), input, "{}", message);
        }
    }

    #[test]
    fn test_domain_binding() {
        let input = minimal();
        assert!(input.validate_domain("Example.COM").is_ok());
        assert_eq!(
            input.validate_domain("evil.example.com"),
            Err(MessageError::DomainMismatch)
        );
    }
}
