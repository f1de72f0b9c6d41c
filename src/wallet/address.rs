//! Stellar account addresses and signature checks
//!
//! Accounts are ed25519 public keys in StrKey form ("G..." addresses).

use base32::Alphabet;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

/// StrKey version byte for ed25519 account ids (encodes as 'G')
const ACCOUNT_ID_VERSION: u8 = 6 << 3;

/// Errors that can occur during address decoding and signature verification
#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Invalid Stellar address format: {0}")]
    InvalidAddressFormat(String),

    #[error("Invalid address checksum")]
    InvalidChecksum,

    #[error("Invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Decode a Stellar public key from G-address format
///
/// Addresses are base32 (RFC 4648, no padding) over a version byte, the
/// 32 key bytes and a little-endian CRC16-XModem checksum.
pub fn decode_account_id(address: &str) -> Result<[u8; 32], AddressError> {
    if !address.starts_with('G') {
        return Err(AddressError::InvalidAddressFormat(
            "Stellar public keys must start with 'G'".to_string(),
        ));
    }

    let decoded = base32::decode(Alphabet::Rfc4648 { padding: false }, address)
        .ok_or_else(|| AddressError::InvalidAddressFormat("Invalid base32 encoding".to_string()))?;

    // 1 version byte + 32 key bytes + 2 checksum bytes
    if decoded.len() != 35 {
        return Err(AddressError::InvalidAddressFormat(format!(
            "Expected 35 bytes, got {}",
            decoded.len()
        )));
    }
    if decoded[0] != ACCOUNT_ID_VERSION {
        return Err(AddressError::InvalidAddressFormat(
            "Not an account id".to_string(),
        ));
    }

    if decoded[33..35] != crc16_xmodem(&decoded[..33]) {
        return Err(AddressError::InvalidChecksum);
    }

    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&decoded[1..33]);
    Ok(public_key)
}

/// Encode a public key as a G-address
pub fn encode_account_id(public_key: &[u8; 32]) -> String {
    let mut payload = Vec::with_capacity(35);
    payload.push(ACCOUNT_ID_VERSION);
    payload.extend_from_slice(public_key);
    let checksum = crc16_xmodem(&payload);
    payload.extend_from_slice(&checksum);

    base32::encode(Alphabet::Rfc4648 { padding: false }, &payload)
}

/// Verify a base64 ed25519 signature by `address` over `message`
pub fn verify_signature(
    address: &str,
    message: &[u8],
    signature_base64: &str,
) -> Result<(), AddressError> {
    let public_key = decode_account_id(address)?;

    let encoded = signature_base64.trim();
    let signature_bytes = STANDARD
        .decode(encoded)
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')))
        .map_err(|e| AddressError::InvalidSignatureFormat(e.to_string()))?;

    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| AddressError::InvalidSignatureFormat(e.to_string()))?;

    let verifying_key = VerifyingKey::from_bytes(&public_key)
        .map_err(|e| AddressError::InvalidPublicKey(e.to_string()))?;

    verifying_key
        .verify(message, &signature)
        .map_err(|_| AddressError::VerificationFailed)
}

/// Calculate CRC16-XModem checksum (little-endian)
fn crc16_xmodem(data: &[u8]) -> [u8; 2] {
    let mut crc: u16 = 0;

    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    const KNOWN_ADDRESS: &str = "GAAZI4TCR3TY5OJHCTJC2A4QSY6CJWJH5IAJTGKIN2ER7LBNVKOCCWN7";

    #[test]
    fn test_decode_known_address() {
        let key = decode_account_id(KNOWN_ADDRESS).unwrap();
        assert_eq!(encode_account_id(&key), KNOWN_ADDRESS);
    }

    #[test]
    fn test_invalid_prefix() {
        let address = "SAAZI4TCR3TY5OJHCTJC2A4QSY6CJWJH5IAJTGKIN2ER7LBNVKOCCWN7";
        assert!(matches!(
            decode_account_id(address),
            Err(AddressError::InvalidAddressFormat(_))
        ));
    }

    #[test]
    fn test_corrupted_checksum() {
        let mut address = KNOWN_ADDRESS.to_string();
        address.replace_range(55..56, "A");
        assert!(decode_account_id(&address).is_err());
    }

    #[test]
    fn test_signature_round_trip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = encode_account_id(&signing_key.verifying_key().to_bytes());
        let message = b"hello stellar";
        let signature = STANDARD.encode(signing_key.sign(message).to_bytes());

        assert!(verify_signature(&address, message, &signature).is_ok());
        assert!(matches!(
            verify_signature(&address, b"tampered", &signature),
            Err(AddressError::VerificationFailed)
        ));

        // URL-safe encodings are accepted as well
        let url_safe = URL_SAFE_NO_PAD.encode(signing_key.sign(message).to_bytes());
        assert!(verify_signature(&address, message, &url_safe).is_ok());
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let signer = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let address = encode_account_id(&other.verifying_key().to_bytes());
        let signature = STANDARD.encode(signer.sign(b"msg").to_bytes());

        assert!(verify_signature(&address, b"msg", &signature).is_err());
    }
}
