use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::workflows::booking::domain::BookingId;

pub(crate) const CODE_LENGTH: usize = 6;

/// Fresh six-digit code, zero padded.
pub(crate) fn generate_code() -> String {
    let mut rng = rand::rng();
    format!("{:06}", rng.random_range(0..1_000_000u32))
}

/// Codes are stored hashed and salted with the booking id.
pub(crate) fn hash_code(booking_id: &BookingId, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(booking_id.0.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn is_well_formed(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|byte| byte.is_ascii_digit())
}

/// Compare a submitted code against the stored hash in constant time.
pub(crate) fn matches(booking_id: &BookingId, submitted: &str, expected_hash: &str) -> bool {
    let submitted_hash = hash_code(booking_id, submitted.trim());
    submitted_hash
        .as_bytes()
        .ct_eq(expected_hash.as_bytes())
        .into()
}
