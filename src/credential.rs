//! Credential derivation: password hashing, recovery-password decoding,
//! and the per-protector key stretch. Grounded in the teacher's
//! `zeroize`-everywhere discipline (`header.rs`/`volume.rs` derives) and
//! in `libbde_password.c`/`libbde_recovery.c` for the exact byte layout.

// The abort flag checked between stretch-key hash rounds.
use std::sync::atomic::{AtomicBool, Ordering};

// SHA-256 for password/recovery hashing and the stretch-key loop.
use sha2::{Digest, Sha256};
// Secrets are wrapped so they're scrubbed from memory on drop.
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};

const STRETCH_LOOP_BOUND: u64 = 0x000f_ffff;
const STRETCH_ITERATIONS: u64 = 0x0010_0000;

/// A password as supplied by the caller. Both encodings hash identically
/// once converted to little-endian UTF-16 (S5 in the test suite).
#[derive(Zeroize)]
pub enum Password {
    Utf8(String),
    Utf16(Vec<u16>),
}

impl Password {
    fn to_utf16le_bytes(&self) -> Zeroizing<Vec<u8>> {
        let units: Vec<u16> = match self {
            Password::Utf8(s) => s.encode_utf16().collect(),
            Password::Utf16(units) => {
                // Skip a leading BOM (U+FEFF) if present; callers may hand
                // us raw UTF-16 that still carries one.
                if units.first() == Some(&0xFEFF) {
                    units[1..].to_vec()
                } else {
                    units.clone()
                }
            }
        };
        let mut bytes = Vec::with_capacity(units.len() * 2);
        for u in units {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        Zeroizing::new(bytes)
    }
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Password hash: UTF-16LE bytes, SHA-256'd twice. 32 bytes.
pub fn hash_password(password: &Password) -> Zeroizing<[u8; 32]> {
    let utf16 = password.to_utf16le_bytes();
    Zeroizing::new(double_sha256(&utf16))
}

/// Decodes a recovery password string of the form
/// `DDDDDD-DDDDDD-DDDDDD-DDDDDD-DDDDDD-DDDDDD-DDDDDD-DDDDDD` into its
/// 16-byte binary form. Returns `None` (not an error) when the string
/// doesn't fit the pattern, so callers can try it as something else.
pub fn decode_recovery_password(input: &str) -> Option<[u8; 16]> {
    let groups: Vec<&str> = input.split('-').collect();
    if groups.len() != 8 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, group) in groups.iter().enumerate() {
        if group.len() != 6 || !group.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u32 = group.parse().ok()?;
        if value % 11 != 0 {
            return None;
        }
        let word = value / 11;
        if word > 0xFFFF {
            return None;
        }
        let word = word as u16;
        out[i * 2..i * 2 + 2].copy_from_slice(&word.to_le_bytes());
    }
    Some(out)
}

/// Recovery-password hash: the 16-byte decoded value, SHA-256'd twice.
pub fn hash_recovery_password(binary: &[u8; 16]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(double_sha256(binary))
}

/// Password-key stretch block, 88 bytes: `last_hash(32) ||
/// initial_hash(32) || salt(16) || counter:u64_le`. The loop runs while
/// `counter < 0x000fffff`; the final SHA-256 over the block with
/// `counter == 0x000fffff` is the 2^20th and last hash, and its digest is
/// the AES-256 key used to AES-CCM-decrypt the protector's wrapped key.
pub fn stretch_key(
    initial_hash: &[u8; 32],
    salt: &[u8; 16],
    abort: &AtomicBool,
) -> Result<Zeroizing<[u8; 32]>> {
    let mut block = Zeroizing::new([0u8; 88]);
    block[32..64].copy_from_slice(initial_hash);
    block[64..80].copy_from_slice(salt);

    for counter in 0..STRETCH_LOOP_BOUND {
        if counter % 4096 == 0 && abort.load(Ordering::Relaxed) {
            return Err(Error::Aborted);
        }
        block[80..88].copy_from_slice(&counter.to_le_bytes());
        let digest = Sha256::digest(&block[..]);
        block[0..32].copy_from_slice(&digest);
    }
    debug_assert_eq!(STRETCH_LOOP_BOUND + 1, STRETCH_ITERATIONS);
    block[80..88].copy_from_slice(&STRETCH_LOOP_BOUND.to_le_bytes());
    let key = Sha256::digest(&block[..]);
    Ok(Zeroizing::new(key.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_and_utf16_passwords_hash_identically() {
        let utf8 = Password::Utf8("TeSt".to_string());
        let utf16 = Password::Utf16("TeSt".encode_utf16().collect());
        assert_eq!(*hash_password(&utf8), *hash_password(&utf16));
    }

    #[test]
    fn password_hash_matches_known_vector() {
        let expected = "f8559b5acfab5409c126e8ac8a5939bffaa893f62ae8373b689ceea64bd47569";
        let got = hash_password(&Password::Utf8("TeSt".to_string()));
        assert_eq!(hex::encode(*got), expected);
    }

    #[test]
    fn recovery_password_round_trip() {
        let input = "236808-089419-192665-495704-618299-073414-538373-542366";
        let decoded = decode_recovery_password(input);
        assert!(decoded.is_some());
    }

    #[test]
    fn recovery_password_rejects_bad_group() {
        // 000001 is not divisible by 11.
        let input = "000001-089419-192665-495704-618299-073414-538373-542366";
        assert!(decode_recovery_password(input).is_none());
    }

    #[test]
    fn recovery_password_rejects_group_over_0xffff_after_division() {
        // 720896 / 11 = 65536 = 0x10000, one past the u16 max.
        let input = "720896-089419-192665-495704-618299-073414-538373-542366";
        assert!(decode_recovery_password(input).is_none());
    }

    #[test]
    fn stretch_key_is_deterministic() {
        let hash = [0x42u8; 32];
        let salt = [0x24u8; 16];
        let abort = AtomicBool::new(false);
        let a = stretch_key(&hash, &salt, &abort).unwrap();
        let b = stretch_key(&hash, &salt, &abort).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn stretch_key_honors_abort() {
        let hash = [0x11u8; 32];
        let salt = [0x22u8; 16];
        let abort = AtomicBool::new(true);
        assert!(matches!(stretch_key(&hash, &salt, &abort), Err(Error::Aborted)));
    }
}
