//! Refresh sessions
//!
//! Lifecycle: Active (current fingerprint) → Rotated (current + previous)
//! → Revoked. Sessions descended from one sign-in share a family and are
//! revoked together when a superseded refresh token shows up again.

pub mod memory;
pub mod model;
pub mod postgres;
pub mod service;
pub mod store;

pub use memory::MemorySessionStore;
pub use model::{fingerprint, ClientMeta, FingerprintSlots, RefreshSession, SlotMatch};
pub use postgres::PgSessionStore;
pub use service::{SessionManager, SessionSettings, SessionTokens};
pub use store::SessionStore;
