//! Byte-source abstraction, the sector cache, and the plaintext-to-
//! ciphertext offset mapping with its unencrypted-region overlay.
//! `ByteSource` generalizes the teacher's JNI-specific `CallbackReader`
//! (`io_callback.rs`) into a plain trait any backing store can
//! implement; `FileByteSource` is the file-backed adapter callers use
//! outside of a host-language binding.

use std::fs::File;
// Seek/Read traits plus the whence enum used by FileByteSource.
use std::io::{self, Read, Seek, SeekFrom};
// The sticky abort flag checked on every sector decrypt.
use std::sync::atomic::{AtomicBool, Ordering};

use crate::encryption::EncryptionContext;
use crate::error::{Error, Result};

/// Injected collaborator providing random byte access to the backing
/// image or device. The volume never mutates it; `volume_offset` lets a
/// caller point at a BDE volume embedded inside a larger container
/// (e.g. a partition within a disk image) without copying.
pub trait ByteSource: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn size(&self) -> u64;
    fn is_open(&self) -> bool;
    fn volume_offset(&self) -> u64 {
        0
    }
}

/// A plain file, or a volume/partition nested inside one.
pub struct FileByteSource {
    file: File,
    size: u64,
    volume_offset: u64,
}

impl FileByteSource {
    pub fn new(file: File) -> io::Result<Self> {
        Self::with_volume_offset(file, 0)
    }

    pub fn with_volume_offset(mut file: File, volume_offset: u64) -> io::Result<Self> {
        let size = file.seek(SeekFrom::End(0))?;
        Ok(FileByteSource { file, size, volume_offset })
    }
}

impl ByteSource for FileByteSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_open(&self) -> bool {
        true
    }

    fn volume_offset(&self) -> u64 {
        self.volume_offset
    }
}

/// Small bounded least-recently-used cache of decrypted sectors, keyed
/// by plaintext sector offset.
pub struct SectorCache {
    capacity: usize,
    entries: Vec<(u64, Vec<u8>)>,
}

impl SectorCache {
    pub fn new(capacity: usize) -> Self {
        SectorCache { capacity: capacity.max(1), entries: Vec::new() }
    }

    fn get(&mut self, offset: u64) -> Option<Vec<u8>> {
        let pos = self.entries.iter().position(|(o, _)| *o == offset)?;
        let entry = self.entries.remove(pos);
        let data = entry.1.clone();
        self.entries.push(entry);
        Some(data)
    }

    fn insert(&mut self, offset: u64, data: Vec<u8>) {
        if let Some(pos) = self.entries.iter().position(|(o, _)| *o == offset) {
            self.entries.remove(pos);
        }
        self.entries.push((offset, data));
        while self.entries.len() > self.capacity {
            self.entries.remove(0);
        }
    }

    pub fn clear(&mut self) {
        for (_, data) in self.entries.iter_mut() {
            data.iter_mut().for_each(|b| *b = 0);
        }
        self.entries.clear();
    }
}

/// Describes the unencrypted-region overlay: the Win7/ToGo volume
/// header block (decrypted from a displaced ciphertext location) and
/// the raw, never-encrypted MBR sector at the primary metadata offset.
#[derive(Debug, Clone, Copy)]
pub struct Overlay {
    pub vhb_cipher_offset: u64,
    pub vhb_length: u64,
    pub first_metadata_offset: u64,
}

impl Overlay {
    pub fn identity(first_metadata_offset: u64) -> Self {
        Overlay { vhb_cipher_offset: 0, vhb_length: 0, first_metadata_offset }
    }

    fn map(&self, plaintext_sector_offset: u64) -> (u64, bool) {
        if plaintext_sector_offset < self.vhb_length {
            (self.vhb_cipher_offset + plaintext_sector_offset, false)
        } else {
            let passthrough = plaintext_sector_offset == self.first_metadata_offset;
            (plaintext_sector_offset, passthrough)
        }
    }
}

/// Reads `buf.len()` plaintext bytes (clamped to `volume_size`) starting
/// at `plaintext_offset`, decrypting sector-by-sector through `cache`.
#[allow(clippy::too_many_arguments)]
pub fn read_plaintext(
    source: &mut dyn ByteSource,
    cache: &mut SectorCache,
    ctx: &EncryptionContext,
    overlay: &Overlay,
    sector_size: u64,
    volume_size: u64,
    plaintext_offset: u64,
    buf: &mut [u8],
    abort: &AtomicBool,
) -> Result<usize> {
    if plaintext_offset >= volume_size {
        return Ok(0);
    }
    let remaining_volume = volume_size - plaintext_offset;
    let len = (buf.len() as u64).min(remaining_volume) as usize;

    let mut written = 0usize;
    let mut offset = plaintext_offset;
    while written < len {
        if abort.load(Ordering::Relaxed) {
            return Err(Error::Aborted);
        }
        let sector_offset = offset - (offset % sector_size);
        let in_sector = (offset - sector_offset) as usize;
        let to_copy = (sector_size as usize - in_sector).min(len - written);

        let sector = decrypted_sector(source, cache, ctx, overlay, sector_size, sector_offset)?;
        buf[written..written + to_copy].copy_from_slice(&sector[in_sector..in_sector + to_copy]);

        written += to_copy;
        offset += to_copy as u64;
    }
    Ok(written)
}

fn decrypted_sector(
    source: &mut dyn ByteSource,
    cache: &mut SectorCache,
    ctx: &EncryptionContext,
    overlay: &Overlay,
    sector_size: u64,
    sector_offset: u64,
) -> Result<Vec<u8>> {
    if let Some(cached) = cache.get(sector_offset) {
        return Ok(cached);
    }

    let (ciphertext_offset, passthrough) = overlay.map(sector_offset);
    let read_offset = ciphertext_offset.checked_add(source.volume_offset()).ok_or_else(|| Error::Io {
        position: ciphertext_offset,
        len: sector_size as usize,
        source: io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"),
    })?;

    if ciphertext_offset
        .checked_add(sector_size)
        .map(|end| end > source.size())
        .unwrap_or(true)
    {
        return Err(Error::Io {
            position: ciphertext_offset,
            len: sector_size as usize,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "read extends past end of source"),
        });
    }

    let mut sector = vec![0u8; sector_size as usize];
    let n = source
        .read_at(read_offset, &mut sector)
        .map_err(|e| Error::Io { position: read_offset, len: sector_size as usize, source: e })?;
    if n != sector.len() {
        return Err(Error::Io {
            position: read_offset,
            len: sector_size as usize,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "short read"),
        });
    }

    if !passthrough {
        ctx.decrypt_sectors(&mut sector, sector_size as usize, sector_offset)?;
    }

    cache.insert(sector_offset, sector.clone());
    Ok(sector)
}
