//! AES primitives shared by the credential pipeline and the encryption
//! engine: ECB single-block (IV/sector-key derivation), CBC (legacy
//! Vista/Win7 sector cipher), AES-CCM (VMK/FVEK unwrap), and AES-XTS
//! (Win7+ sector cipher). Grounded in the teacher's `crypto.rs`
//! enum-dispatch-over-key-size pattern, narrowed to AES only: the
//! corpus's Serpent/Twofish/Camellia/Kuznyechik cascades have no BDE
//! counterpart.

// Block cipher traits: single-block encrypt/decrypt and CBC-mode mutating variants.
use aes::cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
// AES-128 and AES-256 block ciphers.
use aes::{Aes128, Aes256};
// CBC has no padding on disk; sectors are always a multiple of the block size.
use cbc::cipher::block_padding::NoPadding;
// AEAD traits for the CCM wrap/unwrap of the VMK and FVEK.
use ccm::aead::{Aead, KeyInit as AeadKeyInit, Payload};
// Fixed tag/nonce lengths used by the on-disk CCM construction.
use ccm::aead::consts::{U12, U16};
use ccm::Ccm;
// AES-XTS for the Win7+ sector cipher.
use xts_mode::Xts128;

use crate::error::{Error, Result};

type Aes256Ccm = Ccm<Aes256, U16, U12>;

fn crypto_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Crypto(e.to_string())
}

/// Single AES-ECB block encryption, used only to derive IVs and sector
/// keys from a 16-byte padded block-key value.
pub fn ecb_encrypt_block(key: &[u8], block: &mut [u8; 16]) -> Result<()> {
    let mut ga = aes::Block::clone_from_slice(block);
    match key.len() {
        16 => Aes128::new_from_slice(key).map_err(crypto_err)?.encrypt_block(&mut ga),
        32 => Aes256::new_from_slice(key).map_err(crypto_err)?.encrypt_block(&mut ga),
        n => return Err(Error::Crypto(format!("unsupported AES key size {n}"))),
    }
    block.copy_from_slice(&ga);
    Ok(())
}

/// AES-CBC decryption in place, no padding (callers always pass whole
/// sectors). `key` must be 16 or 32 bytes.
pub fn cbc_decrypt(key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    match key.len() {
        16 => {
            let cipher = cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map_err(crypto_err)?;
            cipher
                .decrypt_padded_mut::<NoPadding>(data)
                .map_err(crypto_err)?;
        }
        32 => {
            let cipher = cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map_err(crypto_err)?;
            cipher
                .decrypt_padded_mut::<NoPadding>(data)
                .map_err(crypto_err)?;
        }
        n => return Err(Error::Crypto(format!("unsupported AES key size {n}"))),
    }
    Ok(())
}

/// AES-CBC encryption in place, no padding.
pub fn cbc_encrypt(key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    let len = data.len();
    match key.len() {
        16 => {
            let cipher = cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map_err(crypto_err)?;
            cipher
                .encrypt_padded_mut::<NoPadding>(data, len)
                .map_err(crypto_err)?;
        }
        32 => {
            let cipher = cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map_err(crypto_err)?;
            cipher
                .encrypt_padded_mut::<NoPadding>(data, len)
                .map_err(crypto_err)?;
        }
        n => return Err(Error::Crypto(format!("unsupported AES key size {n}"))),
    }
    Ok(())
}

fn xts_tweak(block_key: u64) -> impl Fn(u128) -> [u8; 16] {
    let tweak = block_key.to_le_bytes();
    move |_i: u128| {
        let mut t = [0u8; 16];
        t[..8].copy_from_slice(&tweak);
        t
    }
}

/// AES-XTS sector decryption. `fvek` is `k1 || k2`; 32 bytes selects
/// AES-128-XTS, 64 bytes selects AES-256-XTS. The data-unit number is the
/// sector's plaintext byte offset, not a sequential index.
pub fn xts_decrypt(fvek: &[u8], block_key: u64, data: &mut [u8]) -> Result<()> {
    let half = fvek.len() / 2;
    let get_tweak = xts_tweak(block_key);
    match fvek.len() {
        32 => {
            let c1 = Aes128::new_from_slice(&fvek[..half]).map_err(crypto_err)?;
            let c2 = Aes128::new_from_slice(&fvek[half..]).map_err(crypto_err)?;
            Xts128::new(c1, c2).decrypt_area(data, data.len(), 0, get_tweak);
        }
        64 => {
            let c1 = Aes256::new_from_slice(&fvek[..half]).map_err(crypto_err)?;
            let c2 = Aes256::new_from_slice(&fvek[half..]).map_err(crypto_err)?;
            Xts128::new(c1, c2).decrypt_area(data, data.len(), 0, get_tweak);
        }
        n => return Err(Error::Crypto(format!("unsupported XTS key size {n}"))),
    }
    Ok(())
}

/// AES-XTS sector encryption, symmetric to [`xts_decrypt`].
pub fn xts_encrypt(fvek: &[u8], block_key: u64, data: &mut [u8]) -> Result<()> {
    let half = fvek.len() / 2;
    let get_tweak = xts_tweak(block_key);
    match fvek.len() {
        32 => {
            let c1 = Aes128::new_from_slice(&fvek[..half]).map_err(crypto_err)?;
            let c2 = Aes128::new_from_slice(&fvek[half..]).map_err(crypto_err)?;
            Xts128::new(c1, c2).encrypt_area(data, data.len(), 0, get_tweak);
        }
        64 => {
            let c1 = Aes256::new_from_slice(&fvek[..half]).map_err(crypto_err)?;
            let c2 = Aes256::new_from_slice(&fvek[half..]).map_err(crypto_err)?;
            Xts128::new(c1, c2).encrypt_area(data, data.len(), 0, get_tweak);
        }
        n => return Err(Error::Crypto(format!("unsupported XTS key size {n}"))),
    }
    Ok(())
}

/// Decrypts an AES-CCM-wrapped payload (VMK or FVEK entry stream). `key`
/// is always the 256-bit stretched credential key; `nonce` is the 12-byte
/// FILETIME||counter value read from the on-disk `AesCcmEncryptedKey`.
/// The 16-byte tag must be appended to `ciphertext`.
pub fn ccm_decrypt(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Ccm::new(key.into());
    cipher
        .decrypt(nonce.into(), Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| Error::Corrupted("AES-CCM tag verification failed".into()))
}

/// Encrypts and tags a plaintext payload, used by the symmetry-only
/// encrypt path and by the test suite to build synthetic fixtures.
pub fn ccm_encrypt(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Ccm::new(key.into());
    cipher
        .encrypt(nonce.into(), Payload { msg: plaintext, aad: &[] })
        .map_err(crypto_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_round_trips() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 16];
        let mut data = vec![0u8; 512];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = data.clone();
        cbc_encrypt(&key, &iv, &mut data).unwrap();
        assert_ne!(data, original);
        cbc_decrypt(&key, &iv, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn xts_round_trips() {
        let fvek = (0u8..64).collect::<Vec<_>>();
        let mut data = vec![0xab; 512];
        let original = data.clone();
        xts_encrypt(&fvek, 65536, &mut data).unwrap();
        assert_ne!(data, original);
        xts_decrypt(&fvek, 65536, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn ccm_round_trips() {
        let key = [0x7fu8; 32];
        let nonce = [0x01u8; 12];
        let plaintext = b"volume master key material 1234";
        let wrapped = ccm_encrypt(&key, &nonce, plaintext).unwrap();
        let unwrapped = ccm_decrypt(&key, &nonce, &wrapped).unwrap();
        assert_eq!(unwrapped, plaintext);
    }

    #[test]
    fn ccm_rejects_tampered_ciphertext() {
        let key = [0x7fu8; 32];
        let nonce = [0x01u8; 12];
        let mut wrapped = ccm_encrypt(&key, &nonce, b"volume master key material 1234").unwrap();
        wrapped[0] ^= 0xff;
        assert!(ccm_decrypt(&key, &nonce, &wrapped).is_err());
    }
}
