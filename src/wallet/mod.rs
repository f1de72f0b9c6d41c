//! Wallet challenge-response sign-in for Stellar accounts

pub mod address;
pub mod message;
pub mod service;

pub use address::{decode_account_id, encode_account_id, verify_signature, AddressError};
pub use message::{generate_nonce, MessageError, SignInInput};
pub use service::{WalletChallenge, WalletIdentity, WalletVerifier};
