//! Protector tree enumeration and the VMK/FVEK unwrap pipeline. Grounded
//! in `libbde_vound_ext.c`'s `libbde_metadata_validate_recovery_master_key`
//! for the AES-CCM unwrap and validation-preface check, and in
//! `libbde_key_protector.c`'s identifier/type accessor shape for the
//! public `Protector` view.

use std::sync::atomic::AtomicBool;

// Little-endian field reads for the on-disk protector payload layout.
use byteorder::{ByteOrder, LittleEndian};
// VMK/FVEK material is scrubbed from memory on drop.
use zeroize::{Zeroize, ZeroizeOnDrop};

// AES-CCM unwrap of the VMK and FVEK.
use crate::aesprim;
use crate::credential::{self, Password};
use crate::error::{Error, Result};
use crate::metadata::{self, Entry, Metadata, Value};

/// The validation preface that opens a decrypted VMK/FVEK payload: 24
/// bytes, with `data_size` at `[16..18]` and `version` at `[20..22]` (the
/// 16 bytes ahead of them are unused by validation), which must read
/// 0x2c and 1 for the unwrap to be considered successful.
const VALIDATION_PREFACE_LEN: usize = 24;
const EXPECTED_VALIDATION_SIZE: u16 = 0x2c;
const EXPECTED_VALIDATION_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionType {
    // VMK stored unencrypted; unlocks with no credential at all.
    ClearKey,
    Tpm,
    // .BEK startup-key file.
    StartupKey,
    TpmAndPin,
    RecoveryPassword,
    Password,
    Unknown(u16),
}

mod protection_tags {
    pub const CLEAR_KEY: u16 = 0x0000;
    pub const TPM: u16 = 0x0100;
    pub const STARTUP_KEY: u16 = 0x0200;
    pub const TPM_AND_PIN: u16 = 0x0500;
    pub const RECOVERY_PASSWORD: u16 = 0x0800;
    pub const PASSWORD: u16 = 0x2000;
}

impl From<u16> for ProtectionType {
    fn from(raw: u16) -> Self {
        match raw {
            protection_tags::CLEAR_KEY => ProtectionType::ClearKey,
            protection_tags::TPM => ProtectionType::Tpm,
            protection_tags::STARTUP_KEY => ProtectionType::StartupKey,
            protection_tags::TPM_AND_PIN => ProtectionType::TpmAndPin,
            protection_tags::RECOVERY_PASSWORD => ProtectionType::RecoveryPassword,
            protection_tags::PASSWORD => ProtectionType::Password,
            other => ProtectionType::Unknown(other),
        }
    }
}

/// A single protector as exposed to callers: identity and type only.
/// Unwrap is an internal operation driven by `unlock`, never exposed
/// directly, since the VMK it recovers is secret material.
#[derive(Debug, Clone)]
pub struct Protector {
    pub identifier: [u8; 16],
    pub protection_type: ProtectionType,
}

/// Credentials the caller has configured before calling `unlock`.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub password: Option<Password>,
    pub recovery_password_hash: Option<[u8; 32]>,
    pub startup_key: Option<[u8; 32]>,
}

pub fn list_protectors(metadata: &Metadata) -> Vec<Protector> {
    metadata
        .volume_master_keys()
        .into_iter()
        .map(|v| Protector { identifier: v.identifier, protection_type: ProtectionType::from(v.protection_type) })
        .collect()
}

/// Attempts every configured, supported protector in priority order
/// (recovery password, then password, then startup key, clear key last
/// since it requires no credential and should not mask a deliberate
/// choice) and returns the recovered VMK on first success.
pub fn unlock_vmk(metadata: &Metadata, credentials: &Credentials, abort: &AtomicBool) -> Result<Option<[u8; 32]>> {
    let vmk_entries: Vec<&Entry> = metadata
        .entries
        .iter()
        .filter(|e| matches!(e.value, Value::VolumeMasterKey(_)))
        .collect();

    for entry in ordered_by_priority(&vmk_entries) {
        let Value::VolumeMasterKey(vmk) = &entry.value else { continue };
        let protection_type = ProtectionType::from(vmk.protection_type);

        let attempt = match protection_type {
            ProtectionType::ClearKey => unlock_clear_key(entry),
            ProtectionType::RecoveryPassword => credentials
                .recovery_password_hash
                .map(|hash| unlock_with_hash(entry, &hash, abort))
                .unwrap_or(Ok(None)),
            ProtectionType::Password => match &credentials.password {
                Some(password) => {
                    let hash = credential::hash_password(password);
                    unlock_with_hash(entry, &hash, abort)
                }
                None => Ok(None),
            },
            ProtectionType::StartupKey => credentials
                .startup_key
                .map(|hash| unlock_with_hash(entry, &hash, abort))
                .unwrap_or(Ok(None)),
            ProtectionType::Tpm | ProtectionType::TpmAndPin | ProtectionType::Unknown(_) => Ok(None),
        };

        match attempt {
            Ok(Some(vmk_bytes)) => return Ok(Some(vmk_bytes)),
            Ok(None) => continue,
            Err(Error::Aborted) => return Err(Error::Aborted),
            Err(_) => continue,
        }
    }
    Ok(None)
}

fn ordered_by_priority<'a>(entries: &[&'a Entry]) -> Vec<&'a Entry> {
    let rank = |e: &&Entry| -> u8 {
        let Value::VolumeMasterKey(vmk) = &e.value else { return 255 };
        match ProtectionType::from(vmk.protection_type) {
            ProtectionType::RecoveryPassword => 0,
            ProtectionType::Password => 1,
            ProtectionType::StartupKey => 2,
            ProtectionType::ClearKey => 3,
            _ => 255,
        }
    };
    let mut sorted: Vec<&Entry> = entries.to_vec();
    sorted.sort_by_key(rank);
    sorted
}

fn unlock_clear_key(entry: &Entry) -> Result<Option<[u8; 32]>> {
    let key_entry = entry
        .children()
        .iter()
        .find(|e| matches!(e.value, Value::Key(_)));
    match key_entry {
        Some(e) => {
            if let Value::Key(bytes) = &e.value {
                let mut vmk = [0u8; 32];
                let n = bytes.len().min(32);
                vmk[..n].copy_from_slice(&bytes[..n]);
                Ok(Some(vmk))
            } else {
                Ok(None)
            }
        }
        None => Ok(None),
    }
}

/// Unwraps a stretch-key-protected VMK entry given the 32-byte credential
/// hash (password hash or recovery-password hash).
fn unlock_with_hash(entry: &Entry, hash: &[u8; 32], abort: &AtomicBool) -> Result<Option<[u8; 32]>> {
    let Some(stretch_entry) = entry.find_by_value_type(metadata::VALUE_STRETCH_KEY) else {
        return Ok(None);
    };
    let Value::StretchKey(stretch) = &stretch_entry.value else {
        return Ok(None);
    };
    let Some(ccm_entry) = stretch_entry
        .children()
        .iter()
        .find(|e| matches!(e.value, Value::AesCcmEncryptedKey(_)))
    else {
        return Ok(None);
    };
    let Value::AesCcmEncryptedKey(wrapped) = &ccm_entry.value else {
        return Ok(None);
    };

    let ccm_key = credential::stretch_key(hash, &stretch.salt, abort)?;
    let decrypted = match aesprim::ccm_decrypt(&ccm_key, &wrapped.nonce, &wrapped.data) {
        Ok(d) => d,
        Err(_) => return Ok(None),
    };

    extract_vmk_from_validated_payload(&decrypted)
}

/// Checks the 24-byte validation preface and recovers the 32-byte VMK
/// from the `Key` entry nested immediately after it.
fn extract_vmk_from_validated_payload(decrypted: &[u8]) -> Result<Option<[u8; 32]>> {
    if decrypted.len() < VALIDATION_PREFACE_LEN {
        return Ok(None);
    }
    let size = LittleEndian::read_u16(&decrypted[16..18]);
    let version = LittleEndian::read_u16(&decrypted[20..22]);
    if size != EXPECTED_VALIDATION_SIZE || version != EXPECTED_VALIDATION_VERSION {
        return Ok(None);
    }

    let nested = metadata::parse_entry_stream_public(&decrypted[VALIDATION_PREFACE_LEN..])?;
    let key_entry = nested.iter().find(|e| matches!(e.value, Value::Key(_)));
    match key_entry {
        Some(Entry { value: Value::Key(bytes), .. }) => {
            if bytes.len() < 32 {
                return Ok(None);
            }
            let mut vmk = [0u8; 32];
            vmk.copy_from_slice(&bytes[..32]);
            Ok(Some(vmk))
        }
        _ => Ok(None),
    }
}

/// Recovers the FVEK-bearing entry's plaintext given the unwrapped VMK,
/// per the encryption-method table in the FVEK assembly stage.
pub fn unwrap_fvek(metadata: &Metadata, vmk: &[u8; 32]) -> Result<Vec<u8>> {
    let fvek_entry = metadata
        .fvek_entry()
        .ok_or_else(|| Error::Corrupted("metadata has no FVEK entry".into()))?;
    let Value::AesCcmEncryptedKey(wrapped) = &fvek_entry.value else {
        return Err(Error::Corrupted("FVEK entry is not AES-CCM wrapped".into()));
    };

    let decrypted = aesprim::ccm_decrypt(vmk, &wrapped.nonce, &wrapped.data)?;
    if decrypted.len() < VALIDATION_PREFACE_LEN {
        return Err(Error::Corrupted("FVEK payload shorter than validation preface".into()));
    }
    let nested = metadata::parse_entry_stream_public(&decrypted[VALIDATION_PREFACE_LEN..])?;
    let key_entry = nested
        .iter()
        .find(|e| matches!(e.value, Value::Key(_)))
        .ok_or_else(|| Error::Corrupted("FVEK payload has no embedded Key entry".into()))?;
    match &key_entry.value {
        Value::Key(bytes) => Ok(bytes.clone()),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::parse_metadata;

    fn entry_bytes(entry_type: u16, value_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let entry_size = (8 + payload.len()) as u16;
        buf.extend_from_slice(&entry_size.to_le_bytes());
        buf.extend_from_slice(&entry_type.to_le_bytes());
        buf.extend_from_slice(&value_type.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn validated_vmk_payload(vmk: &[u8; 32]) -> Vec<u8> {
        let mut buf = vec![0u8; VALIDATION_PREFACE_LEN];
        LittleEndian::write_u16(&mut buf[16..18], EXPECTED_VALIDATION_SIZE);
        LittleEndian::write_u16(&mut buf[20..22], EXPECTED_VALIDATION_VERSION);
        buf.extend_from_slice(&entry_bytes(0, metadata::VALUE_KEY, vmk));
        buf
    }

    fn sample_header_bytes(encryption_method: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 48];
        LittleEndian::write_u32(&mut buf[0..4], 48);
        LittleEndian::write_u32(&mut buf[4..8], 1);
        LittleEndian::write_u32(&mut buf[8..12], 48);
        LittleEndian::write_u32(&mut buf[12..16], 48);
        LittleEndian::write_u16(&mut buf[0x24..0x26], encryption_method);
        buf
    }

    #[test]
    fn unlocks_recovery_password_protector_and_then_fvek() {
        let vmk = [0x5au8; 32];
        let salt = [0x11u8; 16];
        let abort = AtomicBool::new(false);

        let recovery_hash = credential::hash_recovery_password(&[0x02u8; 16]);
        let ccm_key = credential::stretch_key(&recovery_hash, &salt, &abort).unwrap();
        let wrapped = aesprim::ccm_encrypt(&ccm_key, &[9u8; 12], &validated_vmk_payload(&vmk)).unwrap();

        let mut stretch_payload = Vec::new();
        stretch_payload.extend_from_slice(&0x8003u16.to_le_bytes());
        stretch_payload.extend_from_slice(&0u16.to_le_bytes());
        stretch_payload.extend_from_slice(&salt);
        let mut ccm_payload = [9u8; 12].to_vec();
        ccm_payload.extend_from_slice(&wrapped);
        stretch_payload.extend_from_slice(&entry_bytes(0, metadata::VALUE_AES_CCM_ENCRYPTED_KEY, &ccm_payload));
        let stretch_entry = entry_bytes(0, metadata::VALUE_STRETCH_KEY, &stretch_payload);

        let mut vmk_payload = Vec::new();
        vmk_payload.extend_from_slice(&[0x33u8; 16]);
        vmk_payload.extend_from_slice(&0u64.to_le_bytes());
        vmk_payload.extend_from_slice(&0x0800u16.to_le_bytes());
        vmk_payload.extend_from_slice(&0u16.to_le_bytes());
        vmk_payload.extend_from_slice(&stretch_entry);
        let vmk_entry = entry_bytes(0x0002, metadata::VALUE_VOLUME_MASTER_KEY, &vmk_payload);

        // FVEK entry, wrapped directly under the recovered VMK.
        let fvek_plain = validated_vmk_payload_with_key(&[0x99u8; 32]);
        let fvek_wrapped = aesprim::ccm_encrypt(&vmk, &[4u8; 12], &fvek_plain).unwrap();
        let mut fvek_ccm_payload = [4u8; 12].to_vec();
        fvek_ccm_payload.extend_from_slice(&fvek_wrapped);
        let fvek_entry = entry_bytes(0x0003, metadata::VALUE_AES_CCM_ENCRYPTED_KEY, &fvek_ccm_payload);

        let mut metadata_bytes = sample_header_bytes(0x8003);
        metadata_bytes.extend_from_slice(&vmk_entry);
        metadata_bytes.extend_from_slice(&fvek_entry);

        let metadata = parse_metadata(&metadata_bytes).unwrap();
        let credentials = Credentials { recovery_password_hash: Some(*recovery_hash), ..Default::default() };
        let recovered = unlock_vmk(&metadata, &credentials, &abort).unwrap();
        assert_eq!(recovered, Some(vmk));

        let fvek_bytes = unwrap_fvek(&metadata, &vmk).unwrap();
        assert_eq!(fvek_bytes, vec![0x99u8; 32]);
    }

    fn validated_vmk_payload_with_key(key: &[u8; 32]) -> Vec<u8> {
        validated_vmk_payload(key)
    }

    #[test]
    fn wrong_recovery_hash_leaves_volume_locked() {
        let abort = AtomicBool::new(false);
        let salt = [0x11u8; 16];
        let vmk = [0x5au8; 32];
        let good_hash = credential::hash_recovery_password(&[0x02u8; 16]);
        let ccm_key = credential::stretch_key(&good_hash, &salt, &abort).unwrap();
        let wrapped = aesprim::ccm_encrypt(&ccm_key, &[9u8; 12], &validated_vmk_payload(&vmk)).unwrap();

        let mut stretch_payload = Vec::new();
        stretch_payload.extend_from_slice(&0x8003u16.to_le_bytes());
        stretch_payload.extend_from_slice(&0u16.to_le_bytes());
        stretch_payload.extend_from_slice(&salt);
        let mut ccm_payload = [9u8; 12].to_vec();
        ccm_payload.extend_from_slice(&wrapped);
        stretch_payload.extend_from_slice(&entry_bytes(0, metadata::VALUE_AES_CCM_ENCRYPTED_KEY, &ccm_payload));
        let stretch_entry = entry_bytes(0, metadata::VALUE_STRETCH_KEY, &stretch_payload);

        let mut vmk_payload = Vec::new();
        vmk_payload.extend_from_slice(&[0x33u8; 16]);
        vmk_payload.extend_from_slice(&0u64.to_le_bytes());
        vmk_payload.extend_from_slice(&0x0800u16.to_le_bytes());
        vmk_payload.extend_from_slice(&0u16.to_le_bytes());
        vmk_payload.extend_from_slice(&stretch_entry);
        let vmk_entry = entry_bytes(0x0002, metadata::VALUE_VOLUME_MASTER_KEY, &vmk_payload);

        let mut metadata_bytes = sample_header_bytes(0x8003);
        metadata_bytes.extend_from_slice(&vmk_entry);
        let metadata = parse_metadata(&metadata_bytes).unwrap();

        let wrong_hash = credential::hash_recovery_password(&[0x03u8; 16]);
        let credentials = Credentials { recovery_password_hash: Some(*wrong_hash), ..Default::default() };
        let recovered = unlock_vmk(&metadata, &credentials, &abort).unwrap();
        assert_eq!(recovered, None);
    }

    #[test]
    fn clear_key_protector_unlocks_without_credentials() {
        let vmk = [0x7au8; 32];
        let key_entry = entry_bytes(0, metadata::VALUE_KEY, &vmk);
        let mut vmk_payload = Vec::new();
        vmk_payload.extend_from_slice(&[0x44u8; 16]);
        vmk_payload.extend_from_slice(&0u64.to_le_bytes());
        vmk_payload.extend_from_slice(&0x0000u16.to_le_bytes());
        vmk_payload.extend_from_slice(&0u16.to_le_bytes());
        vmk_payload.extend_from_slice(&key_entry);
        let vmk_entry = entry_bytes(0x0002, metadata::VALUE_VOLUME_MASTER_KEY, &vmk_payload);

        let mut metadata_bytes = sample_header_bytes(0x8003);
        metadata_bytes.extend_from_slice(&vmk_entry);
        let metadata = parse_metadata(&metadata_bytes).unwrap();

        let abort = AtomicBool::new(false);
        let credentials = Credentials::default();
        let recovered = unlock_vmk(&metadata, &credentials, &abort).unwrap();
        assert_eq!(recovered, Some(vmk));
    }
}
