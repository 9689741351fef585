//! Public façade: the `Volume` lifecycle state machine tying together
//! header parsing, metadata parsing, credential-driven unwrap, and
//! sector I/O. Grounded in the teacher's `Volume` struct (a
//! `Mutex`-guarded inner state behind a thin public API, with a sticky
//! `AtomicBool` abort flag held outside the lock so `signal_abort` never
//! blocks) generalized away from its JNI-specific context-handle table.

// The whence enum accepted by `Volume::seek`.
use std::io::SeekFrom;
// Accepted by `read_startup_key` for the `.BEK` file location.
use std::path::Path;
// The sticky abort flag, and the ordering used to read/write it.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::credential::{self, Password};
use crate::encryption::{EncryptionContext, Method};
use crate::error::{Error, Result};
use crate::header::VolumeHeader;
use crate::io::{self, ByteSource, Overlay, SectorCache};
use crate::metadata::{self, Metadata};
use crate::protector::{self, Credentials, Protector};

const DEFAULT_CACHE_CAPACITY: usize = 32;

struct Inner {
    source: Option<Box<dyn ByteSource>>,
    header: Option<VolumeHeader>,
    metadata: Option<Metadata>,
    overlay: Overlay,
    credentials: Credentials,
    encryption: Option<EncryptionContext>,
    cache: SectorCache,
    offset: i64,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            source: None,
            header: None,
            metadata: None,
            overlay: Overlay::identity(0),
            credentials: Credentials::default(),
            encryption: None,
            cache: SectorCache::new(DEFAULT_CACHE_CAPACITY),
            offset: 0,
        }
    }
}

/// A BitLocker-encrypted volume, opened for byte-addressable random
/// access to its plaintext contents. No internal threads; all mutable
/// state lives behind one `Mutex`, and the abort flag is a separate
/// `AtomicBool` so `signal_abort` can be called from another thread
/// without ever blocking on that lock.
pub struct Volume {
    abort: AtomicBool,
    inner: Mutex<Inner>,
}

impl Default for Volume {
    fn default() -> Self {
        Volume { abort: AtomicBool::new(false), inner: Mutex::new(Inner::default()) }
    }
}

impl Volume {
    pub fn new() -> Self {
        Volume::default()
    }

    /// Reads the volume header and the first parseable metadata copy
    /// from `source`, trying the redundant copies in on-disk order
    /// (primary, second, third). A secondary copy disagreeing with, or
    /// failing to parse against, the primary is not itself an error —
    /// only the first copy that parses becomes canonical, so `open`
    /// still succeeds when one of the backup copies is corrupted or
    /// stale.
    pub fn open(&self, mut source: Box<dyn ByteSource>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.source.is_some() {
            return Err(Error::AlreadyOpen);
        }

        let mut header_bytes = vec![0u8; 512];
        read_exact_at(source.as_mut(), 0, &mut header_bytes)?;
        let header = VolumeHeader::parse(&header_bytes)?;

        let mut canonical: Option<Metadata> = None;
        for &metadata_offset in &header.metadata_offsets {
            let mut buf = vec![0u8; header.metadata_size as usize];
            if read_exact_at(source.as_mut(), metadata_offset, &mut buf).is_err() {
                continue;
            }
            if let Ok(parsed) = metadata::parse_metadata(&buf) {
                canonical = Some(parsed);
                break;
            }
        }
        let metadata = canonical.ok_or_else(|| Error::Corrupted("no metadata copy could be parsed".into()))?;

        inner.overlay = build_overlay(&header, &metadata);
        inner.header = Some(header);
        inner.metadata = Some(metadata);
        inner.source = Some(source);
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.encryption.is_none()
    }

    /// Attempts to unwrap the VMK and FVEK using whatever credentials
    /// have been configured so far. Idempotent: returns `Ok(true)`
    /// immediately if already unlocked. Returns `Ok(false)`, not an
    /// error, when no configured protector succeeds.
    pub fn unlock(&self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.encryption.is_some() {
            return Ok(true);
        }
        let metadata = inner.metadata.as_ref().ok_or(Error::NotOpen)?;

        let vmk = protector::unlock_vmk(metadata, &inner.credentials, &self.abort)?;
        let Some(vmk) = vmk else {
            return Ok(false);
        };
        let fvek_and_tweak = protector::unwrap_fvek(metadata, &vmk)?;
        let method = Method::from_code(metadata.header.encryption_method)?;
        let fvek_len = method.fvek_len();
        let tweak_len = method.tweak_len();
        if fvek_and_tweak.len() < fvek_len + tweak_len {
            return Err(Error::Corrupted("FVEK material shorter than encryption method requires".into()));
        }
        let fvek = fvek_and_tweak[..fvek_len].to_vec();
        let tweak = fvek_and_tweak[fvek_len..fvek_len + tweak_len].to_vec();
        inner.encryption = Some(EncryptionContext::new(method, fvek, tweak)?);
        Ok(true)
    }

    pub fn set_password(&self, password: Password) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.credentials.password = Some(password);
    }

    /// Decodes and hashes a recovery-password string immediately;
    /// only the 32-byte hash is retained.
    pub fn set_recovery_password(&self, recovery_password: &str) -> Result<()> {
        let binary = credential::decode_recovery_password(recovery_password)
            .ok_or_else(|| Error::InvalidArgument("recovery password is not in DDDDDD-...-DDDDDD form".into()))?;
        let hash = credential::hash_recovery_password(&binary);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.credentials.recovery_password_hash = Some(*hash);
        Ok(())
    }

    /// Reads a `.BEK`-style startup-key file from `path`, parses its
    /// contents as a standalone entry stream, and stores the embedded
    /// 32-byte key material as the startup-key credential, unhashed.
    pub fn read_startup_key(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path).map_err(|e| {
            let kind = e.kind();
            Error::Io { position: 0, len: 0, source: std::io::Error::new(kind, format!("{}: {e}", path.display())) }
        })?;
        let entries = metadata::parse_entry_stream_public(&bytes)?;
        let key = entries
            .iter()
            .flat_map(|e| e.children())
            .chain(entries.iter())
            .find_map(|e| match &e.value {
                metadata::Value::ExternalKey(children) => {
                    children.iter().find_map(|c| match &c.value {
                        metadata::Value::Key(bytes) if bytes.len() >= 32 => Some(bytes.clone()),
                        _ => None,
                    })
                }
                metadata::Value::Key(bytes) if bytes.len() >= 32 => Some(bytes.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::Corrupted("startup key file has no embedded key entry".into()))?;

        let mut startup_key = [0u8; 32];
        startup_key.copy_from_slice(&key[..32]);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.credentials.startup_key = Some(startup_key);
        Ok(())
    }

    /// Bypasses the unwrap pipeline entirely with already-known FVEK and
    /// TWEAK material (e.g. recovered out of band).
    pub fn set_keys(&self, method: Method, fvek: Vec<u8>, tweak: Vec<u8>) -> Result<()> {
        let ctx = EncryptionContext::new(method, fvek, tweak)?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.encryption = Some(ctx);
        Ok(())
    }

    /// Same as `set_keys`, but takes a single `FVEK || TWEAK` stream and
    /// splits it per the method's field lengths.
    pub fn set_keys_combined(&self, method: Method, combined: &[u8]) -> Result<()> {
        let fvek_len = method.fvek_len();
        let tweak_len = method.tweak_len();
        if combined.len() != fvek_len + tweak_len {
            return Err(Error::InvalidArgument(format!(
                "combined key material is {} bytes, method expects {}",
                combined.len(),
                fvek_len + tweak_len
            )));
        }
        self.set_keys(method, combined[..fvek_len].to_vec(), combined[fvek_len..].to_vec())
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let offset = inner.offset;
        let n = read_locked(&mut inner, offset, buf, &self.abort)?;
        inner.offset = inner.offset.saturating_add(n as i64);
        Ok(n)
    }

    pub fn read_at(&self, offset: i64, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        read_locked(&mut inner, offset, buf, &self.abort)
    }

    /// Repositions the stream cursor used by `read`, mirroring POSIX
    /// `lseek`'s `SEEK_SET`/`SEEK_CUR`/`SEEK_END` via `std::io::SeekFrom`.
    /// Returns the resulting absolute offset, which callers may drive
    /// negative or past the end of the volume; `read`/`read_at` clamp
    /// such offsets rather than erroring.
    pub fn seek(&self, pos: SeekFrom) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let new_offset = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => inner.offset.saturating_add(delta),
            SeekFrom::End(delta) => {
                let size = inner.header.as_ref().ok_or(Error::NotOpen)?.volume_size as i64;
                size.saturating_add(delta)
            }
        };
        inner.offset = new_offset;
        Ok(new_offset)
    }

    pub fn offset(&self) -> i64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.offset
    }

    pub fn size(&self) -> Result<u64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.header.as_ref().ok_or(Error::NotOpen)?.volume_size)
    }

    pub fn encryption_method(&self) -> Result<u16> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.metadata.as_ref().ok_or(Error::NotOpen)?.header.encryption_method)
    }

    pub fn volume_identifier(&self) -> Result<[u8; 16]> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.metadata.as_ref().ok_or(Error::NotOpen)?.header.volume_identifier)
    }

    pub fn creation_time(&self) -> Result<u64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.metadata.as_ref().ok_or(Error::NotOpen)?.header.creation_time)
    }

    pub fn description(&self) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let metadata = inner.metadata.as_ref().ok_or(Error::NotOpen)?;
        Ok(metadata.entries.iter().find_map(|e| match &e.value {
            metadata::Value::UnicodeString(s)
                if e.entry_type == metadata::EntryType::Description =>
            {
                Some(s.clone())
            }
            _ => None,
        }))
    }

    pub fn key_protectors(&self) -> Result<Vec<Protector>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let metadata = inner.metadata.as_ref().ok_or(Error::NotOpen)?;
        Ok(protector::list_protectors(metadata))
    }

    /// Drops the unwrapped keys and clears the sector cache, zeroizing
    /// both, and resets any configured credentials. Leaves the parsed
    /// header/metadata and the underlying source untouched so the
    /// volume can be unlocked again.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.encryption = None;
        inner.cache.clear();
        inner.credentials = Credentials::default();
    }

    /// Sets the sticky abort flag. Never blocks on the inner lock; an
    /// in-progress key stretch or sector loop observes it at its next
    /// checkpoint and returns `Error::Aborted`.
    pub fn signal_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::Relaxed);
    }
}

fn read_locked(inner: &mut Inner, offset: i64, buf: &mut [u8], abort: &AtomicBool) -> Result<usize> {
    let header = inner.header.as_ref().ok_or(Error::NotOpen)?;
    let encryption = inner.encryption.as_ref().ok_or(Error::StillLocked)?;
    if offset < 0 {
        return Ok(0);
    }
    let source = inner.source.as_deref_mut().ok_or(Error::NotOpen)?;
    io::read_plaintext(
        source,
        &mut inner.cache,
        encryption,
        &inner.overlay,
        header.bytes_per_sector as u64,
        header.volume_size,
        offset as u64,
        buf,
        abort,
    )
}

fn build_overlay(header: &VolumeHeader, metadata: &Metadata) -> Overlay {
    match metadata.volume_header_block() {
        Some((cipher_offset, length)) => {
            Overlay { vhb_cipher_offset: cipher_offset, vhb_length: length, first_metadata_offset: header.metadata_offsets[0] }
        }
        None => Overlay::identity(header.metadata_offsets[0]),
    }
}

fn read_exact_at(source: &mut dyn ByteSource, offset: u64, buf: &mut [u8]) -> Result<()> {
    let n = source.read_at(offset, buf).map_err(|e| Error::Io { position: offset, len: buf.len(), source: e })?;
    if n != buf.len() {
        return Err(Error::Io {
            position: offset,
            len: buf.len(),
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"),
        });
    }
    Ok(())
}
