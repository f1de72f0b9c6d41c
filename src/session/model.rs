//! Refresh session records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use validator::Validate;

/// Fingerprint history of a session.
///
/// At most two fingerprints are tracked: the live one and, right after a
/// rotation, the one it replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FingerprintSlots {
    Active {
        current: String,
    },
    Rotated {
        current: String,
        previous: String,
        rotated_at: DateTime<Utc>,
    },
}

/// Which slot a presented fingerprint matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMatch {
    Current,
    Previous { rotated_at: DateTime<Utc> },
    None,
}

impl FingerprintSlots {
    pub fn current(&self) -> &str {
        match self {
            FingerprintSlots::Active { current } | FingerprintSlots::Rotated { current, .. } => {
                current
            }
        }
    }

    pub fn previous(&self) -> Option<&str> {
        match self {
            FingerprintSlots::Active { .. } => None,
            FingerprintSlots::Rotated { previous, .. } => Some(previous),
        }
    }

    pub fn rotated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FingerprintSlots::Active { .. } => None,
            FingerprintSlots::Rotated { rotated_at, .. } => Some(*rotated_at),
        }
    }

    pub fn matches(&self, fingerprint: &str) -> SlotMatch {
        match self {
            FingerprintSlots::Active { current } if current == fingerprint => SlotMatch::Current,
            FingerprintSlots::Rotated { current, .. } if current == fingerprint => {
                SlotMatch::Current
            }
            FingerprintSlots::Rotated {
                previous,
                rotated_at,
                ..
            } if previous == fingerprint => SlotMatch::Previous {
                rotated_at: *rotated_at,
            },
            _ => SlotMatch::None,
        }
    }

    /// Slots as stored: (current, previous, rotated_at)
    pub fn to_columns(&self) -> (String, Option<String>, Option<DateTime<Utc>>) {
        (
            self.current().to_string(),
            self.previous().map(str::to_string),
            self.rotated_at(),
        )
    }

    pub fn from_columns(
        current: String,
        previous: Option<String>,
        rotated_at: Option<DateTime<Utc>>,
    ) -> Self {
        match (previous, rotated_at) {
            (Some(previous), Some(rotated_at)) => FingerprintSlots::Rotated {
                current,
                previous,
                rotated_at,
            },
            _ => FingerprintSlots::Active { current },
        }
    }
}

/// Client details captured at sign-in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ClientMeta {
    #[validate(length(max = 512))]
    pub user_agent: Option<String>,
    #[validate(length(max = 64))]
    pub ip_address: Option<String>,
    #[validate(length(max = 256))]
    pub device_info: Option<String>,
}

/// One continuous sign-in on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSession {
    pub id: Uuid,
    pub family_id: Uuid,
    pub subject: String,
    /// Authority that authenticated the subject
    pub issuer: String,
    pub slots: FingerprintSlots,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub client: ClientMeta,
}

impl RefreshSession {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired(now)
    }
}

/// SHA-256 hex of a refresh token
pub fn fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
