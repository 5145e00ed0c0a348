//! Password and WireGuard keypair generation from the OS CSPRNG.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::{OsRng, RngCore};
use x25519_dalek::{X25519_BASEPOINT_BYTES, x25519};

use crate::error::LabError;

pub const DEFAULT_PASSWORD_LENGTH: usize = 16;
pub const PASSWORD_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*";

/// Generate a password of `length` characters (0 means the default length).
pub fn generate_password(length: usize) -> Result<String, LabError> {
    generate_password_with(&mut OsRng, length)
}

fn generate_password_with<R: RngCore>(rng: &mut R, length: usize) -> Result<String, LabError> {
    let length = if length == 0 {
        DEFAULT_PASSWORD_LENGTH
    } else {
        length
    };
    let charset_len = PASSWORD_CHARSET.len() as u32;
    // Largest multiple of the charset size that fits in a byte; bytes at or
    // above it are redrawn so every character is equally likely.
    let zone = (256 / charset_len) * charset_len;

    let mut password = String::with_capacity(length);
    let mut buf = [0u8; 32];
    while password.len() < length {
        rng.try_fill_bytes(&mut buf).map_err(|e| LabError::Credential {
            message: format!("failed to read random bytes: {e}"),
        })?;
        for &b in &buf {
            if (b as u32) < zone {
                password.push(PASSWORD_CHARSET[(b as u32 % charset_len) as usize] as char);
                if password.len() == length {
                    break;
                }
            }
        }
    }
    Ok(password)
}

/// A base64-encoded Curve25519 keypair.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a WireGuard keypair: a clamped random scalar and its base point product.
pub fn generate_keypair() -> Result<KeyPair, LabError> {
    let mut scalar = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut scalar)
        .map_err(|e| LabError::Credential {
            message: format!("failed to generate random key: {e}"),
        })?;
    Ok(keypair_from_scalar(scalar))
}

fn keypair_from_scalar(mut scalar: [u8; 32]) -> KeyPair {
    clamp(&mut scalar);
    let public = x25519(scalar, X25519_BASEPOINT_BYTES);
    KeyPair {
        private_key: STANDARD.encode(scalar),
        public_key: STANDARD.encode(public),
    }
}

fn clamp(scalar: &mut [u8; 32]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

/// Derive the base64 public key for a base64 private key.
pub fn public_key_for(private_key: &str) -> Result<String, LabError> {
    let bytes: [u8; 32] = STANDARD
        .decode(private_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| LabError::Credential {
            message: "private key must be 32 bytes of base64".into(),
        })?;
    Ok(STANDARD.encode(x25519(bytes, X25519_BASEPOINT_BYTES)))
}

/// True if `key` decodes to exactly 32 bytes.
pub fn is_valid_key(key: &str) -> bool {
    STANDARD.decode(key).is_ok_and(|b| b.len() == 32)
}
