//! FVE metadata block reader: header parsing and the recursive
//! entry/value tree of a single metadata copy (picking which redundant
//! copy is canonical is the caller's job, not this module's). Grounded
//! in `libbde_metadata_header.c` for the header layout and in the
//! on-disk entry preface described in the external-interfaces table;
//! the numeric entry/value/protection type tags below come from the
//! public BitLocker metadata format documentation (the filtered
//! `original_source/` pack does not carry `libbde_definitions.h`, which
//! is where libbde itself defines them).

use std::fmt;

// Little-endian field reads for the metadata header and entry/value TLV stream.
use byteorder::{ByteOrder, LittleEndian};

const MAX_NESTING_DEPTH: u32 = 4;

/// Failure modes of the metadata header and entry/value stream parsers,
/// mirrored into the top-level `Error` via `From<MetadataError>` rather
/// than constructed directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    HeaderTooShort,
    UnsupportedVersion(u32),
    HeaderSizeMismatch(u32),
    SizeCopyMismatch,
    NestingTooDeep,
    EntrySizeOutOfBounds,
    ValueTooShort(&'static str),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetadataError::HeaderTooShort => write!(f, "metadata header shorter than 48 bytes"),
            MetadataError::UnsupportedVersion(v) => write!(f, "metadata header version {v}"),
            MetadataError::HeaderSizeMismatch(h) => write!(f, "metadata header_size {h} != 48"),
            MetadataError::SizeCopyMismatch => write!(f, "metadata_size_copy mismatch"),
            MetadataError::NestingTooDeep => write!(f, "entry nesting too deep"),
            MetadataError::EntrySizeOutOfBounds => write!(f, "entry size out of bounds"),
            MetadataError::ValueTooShort(what) => write!(f, "{what} payload too short"),
        }
    }
}

impl std::error::Error for MetadataError {}

type Result<T> = std::result::Result<T, MetadataError>;

mod tags {
    pub const ENTRY_VMK: u16 = 0x0002;
    pub const ENTRY_FVEK: u16 = 0x0003;
    pub const ENTRY_VALIDATION: u16 = 0x0004;
    pub const ENTRY_STARTUP_KEY: u16 = 0x0006;
    pub const ENTRY_DESCRIPTION: u16 = 0x0007;
    pub const ENTRY_VOLUME_HEADER_BLOCK: u16 = 0x000f;

    pub const VALUE_ERASED: u16 = 0x0000;
    pub const VALUE_KEY: u16 = 0x0001;
    pub const VALUE_UNICODE_STRING: u16 = 0x0002;
    pub const VALUE_STRETCH_KEY: u16 = 0x0003;
    pub const VALUE_USE_KEY: u16 = 0x0004;
    pub const VALUE_AES_CCM_ENCRYPTED_KEY: u16 = 0x0005;
    pub const VALUE_TPM_ENCODED_KEY: u16 = 0x0006;
    pub const VALUE_VALIDATION: u16 = 0x0007;
    pub const VALUE_VOLUME_MASTER_KEY: u16 = 0x0008;
    pub const VALUE_EXTERNAL_KEY: u16 = 0x0009;
    pub const VALUE_UPDATE: u16 = 0x000a;
    pub const VALUE_ERROR: u16 = 0x000b;
    pub const VALUE_OFFSET_AND_SIZE: u16 = 0x000f;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Property,
    Vmk,
    Fvek,
    Validation,
    StartupKey,
    Description,
    VolumeHeaderBlock,
    Unknown(u16),
}

impl From<u16> for EntryType {
    fn from(raw: u16) -> Self {
        match raw {
            tags::ENTRY_VMK => EntryType::Vmk,
            tags::ENTRY_FVEK => EntryType::Fvek,
            tags::ENTRY_VALIDATION => EntryType::Validation,
            tags::ENTRY_STARTUP_KEY => EntryType::StartupKey,
            tags::ENTRY_DESCRIPTION => EntryType::Description,
            tags::ENTRY_VOLUME_HEADER_BLOCK => EntryType::VolumeHeaderBlock,
            0 => EntryType::Property,
            other => EntryType::Unknown(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StretchKeyValue {
    pub encryption_method: u16,
    pub salt: [u8; 16],
    pub children: Vec<Entry>,
}

#[derive(Debug, Clone)]
pub struct AesCcmEncryptedKeyValue {
    pub nonce: [u8; 12],
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct VolumeMasterKeyValue {
    pub identifier: [u8; 16],
    pub last_modification_time: u64,
    pub protection_type: u16,
    pub children: Vec<Entry>,
}

#[derive(Debug, Clone)]
pub enum Value {
    Raw(Vec<u8>),
    Key(Vec<u8>),
    UnicodeString(String),
    StretchKey(StretchKeyValue),
    UseKey { encryption_method: u16, children: Vec<Entry> },
    AesCcmEncryptedKey(AesCcmEncryptedKeyValue),
    VolumeMasterKey(VolumeMasterKeyValue),
    ExternalKey(Vec<Entry>),
    OffsetAndSize { offset: u64, size: u64 },
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub entry_type: EntryType,
    pub value_type: u16,
    pub version: u16,
    pub value: Value,
}

impl Entry {
    /// Finds the first direct child of a container value carrying the
    /// given value-type tag.
    pub fn children(&self) -> &[Entry] {
        match &self.value {
            Value::StretchKey(s) => &s.children,
            Value::UseKey { children, .. } => children,
            Value::VolumeMasterKey(v) => &v.children,
            Value::ExternalKey(children) => children,
            _ => &[],
        }
    }

    pub fn find_by_value_type(&self, value_type: u16) -> Option<&Entry> {
        self.children().iter().find(|e| e.value_type == value_type)
    }
}

fn parse_entry_stream(bytes: &[u8], depth: u32) -> Result<Vec<Entry>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(MetadataError::NestingTooDeep);
    }
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let entry_size = LittleEndian::read_u16(&bytes[offset..offset + 2]) as usize;
        if entry_size == 0 {
            break;
        }
        if entry_size < 8 || offset + entry_size > bytes.len() {
            return Err(MetadataError::EntrySizeOutOfBounds);
        }
        let entry_type = LittleEndian::read_u16(&bytes[offset + 2..offset + 4]);
        let value_type = LittleEndian::read_u16(&bytes[offset + 4..offset + 6]);
        let version = LittleEndian::read_u16(&bytes[offset + 6..offset + 8]);
        let payload = &bytes[offset + 8..offset + entry_size];

        let value = parse_value(value_type, payload, depth)?;
        entries.push(Entry { entry_type: EntryType::from(entry_type), value_type, version, value });

        offset += entry_size;
    }
    Ok(entries)
}

fn parse_value(value_type: u16, payload: &[u8], depth: u32) -> Result<Value> {
    match value_type {
        tags::VALUE_ERASED => Ok(Value::Raw(payload.to_vec())),
        tags::VALUE_KEY => Ok(Value::Key(payload.to_vec())),
        tags::VALUE_UNICODE_STRING => Ok(Value::UnicodeString(decode_utf16le(payload))),
        tags::VALUE_STRETCH_KEY => {
            if payload.len() < 20 {
                return Err(MetadataError::ValueTooShort("StretchKey"));
            }
            let encryption_method = LittleEndian::read_u16(&payload[0..2]);
            let mut salt = [0u8; 16];
            salt.copy_from_slice(&payload[4..20]);
            let children = parse_entry_stream(&payload[20..], depth + 1)?;
            Ok(Value::StretchKey(StretchKeyValue { encryption_method, salt, children }))
        }
        tags::VALUE_USE_KEY => {
            if payload.len() < 4 {
                return Err(MetadataError::ValueTooShort("UseKey"));
            }
            let encryption_method = LittleEndian::read_u16(&payload[0..2]);
            let children = parse_entry_stream(&payload[4..], depth + 1)?;
            Ok(Value::UseKey { encryption_method, children })
        }
        tags::VALUE_AES_CCM_ENCRYPTED_KEY => {
            if payload.len() < 12 {
                return Err(MetadataError::ValueTooShort("AesCcmEncryptedKey"));
            }
            let mut nonce = [0u8; 12];
            nonce.copy_from_slice(&payload[0..12]);
            Ok(Value::AesCcmEncryptedKey(AesCcmEncryptedKeyValue { nonce, data: payload[12..].to_vec() }))
        }
        tags::VALUE_TPM_ENCODED_KEY | tags::VALUE_VALIDATION | tags::VALUE_UPDATE | tags::VALUE_ERROR => {
            Ok(Value::Raw(payload.to_vec()))
        }
        tags::VALUE_VOLUME_MASTER_KEY => {
            if payload.len() < 28 {
                return Err(MetadataError::ValueTooShort("VolumeMasterKey"));
            }
            let mut identifier = [0u8; 16];
            identifier.copy_from_slice(&payload[0..16]);
            let last_modification_time = LittleEndian::read_u64(&payload[16..24]);
            let protection_type = LittleEndian::read_u16(&payload[24..26]);
            let children = parse_entry_stream(&payload[28..], depth + 1)?;
            Ok(Value::VolumeMasterKey(VolumeMasterKeyValue {
                identifier,
                last_modification_time,
                protection_type,
                children,
            }))
        }
        tags::VALUE_EXTERNAL_KEY => Ok(Value::ExternalKey(parse_entry_stream(payload, depth + 1)?)),
        tags::VALUE_OFFSET_AND_SIZE => {
            if payload.len() < 16 {
                return Err(MetadataError::ValueTooShort("OffsetAndSize"));
            }
            Ok(Value::OffsetAndSize {
                offset: LittleEndian::read_u64(&payload[0..8]),
                size: LittleEndian::read_u64(&payload[8..16]),
            })
        }
        _ => Ok(Value::Raw(payload.to_vec())),
    }
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[derive(Debug, Clone)]
pub struct MetadataHeader {
    pub metadata_size: u32,
    pub volume_identifier: [u8; 16],
    pub encryption_method: u16,
    pub creation_time: u64,
}

pub fn parse_header(bytes: &[u8]) -> Result<MetadataHeader> {
    if bytes.len() < 48 {
        return Err(MetadataError::HeaderTooShort);
    }
    let metadata_size = LittleEndian::read_u32(&bytes[0x00..0x04]);
    let version = LittleEndian::read_u32(&bytes[0x04..0x08]);
    let header_size = LittleEndian::read_u32(&bytes[0x08..0x0c]);
    let metadata_size_copy = LittleEndian::read_u32(&bytes[0x0c..0x10]);

    if version != 1 {
        return Err(MetadataError::UnsupportedVersion(version));
    }
    if header_size != 48 {
        return Err(MetadataError::HeaderSizeMismatch(header_size));
    }
    if metadata_size_copy != metadata_size {
        return Err(MetadataError::SizeCopyMismatch);
    }

    let mut volume_identifier = [0u8; 16];
    volume_identifier.copy_from_slice(&bytes[0x10..0x20]);
    let encryption_method = LittleEndian::read_u16(&bytes[0x24..0x26]);
    let creation_time = LittleEndian::read_u64(&bytes[0x28..0x30]);

    Ok(MetadataHeader { metadata_size, volume_identifier, encryption_method, creation_time })
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub header: MetadataHeader,
    pub entries: Vec<Entry>,
}

impl Metadata {
    pub fn volume_master_keys(&self) -> Vec<&VolumeMasterKeyValue> {
        self.entries
            .iter()
            .filter_map(|e| match &e.value {
                Value::VolumeMasterKey(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn fvek_entry(&self) -> Option<&Entry> {
        self.entries.iter().find(|e| e.entry_type == EntryType::Fvek)
    }

    pub fn volume_header_block(&self) -> Option<(u64, u64)> {
        self.entries.iter().find_map(|e| match (&e.entry_type, &e.value) {
            (EntryType::VolumeHeaderBlock, Value::OffsetAndSize { offset, size }) => Some((*offset, *size)),
            _ => None,
        })
    }
}

/// Reads and parses one metadata copy at `offset`, given its full
/// `metadata_size` bytes already read from the byte source.
pub fn parse_metadata(bytes: &[u8]) -> Result<Metadata> {
    let header = parse_header(bytes)?;
    let entries = parse_entry_stream(&bytes[48..], 0)?;
    Ok(Metadata { header, entries })
}

pub use tags::{
    VALUE_AES_CCM_ENCRYPTED_KEY, VALUE_KEY, VALUE_STRETCH_KEY, VALUE_VOLUME_MASTER_KEY,
};

/// Parses a standalone entry stream such as a decrypted VMK/FVEK
/// payload, which is not itself bounded by the on-disk metadata's
/// nesting budget.
pub fn parse_entry_stream_public(bytes: &[u8]) -> Result<Vec<Entry>> {
    parse_entry_stream(bytes, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn sample_header(encryption_method: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 48];
        LittleEndian::write_u32(&mut buf[0..4], 48);
        LittleEndian::write_u32(&mut buf[4..8], 1);
        LittleEndian::write_u32(&mut buf[8..12], 48);
        LittleEndian::write_u32(&mut buf[12..16], 48);
        buf[0x10..0x20].copy_from_slice(&[0xaa; 16]);
        LittleEndian::write_u16(&mut buf[0x24..0x26], encryption_method);
        buf
    }

    #[test]
    fn parses_header_and_rejects_size_copy_mismatch() {
        let header = sample_header(0x8003);
        let parsed = parse_header(&header).unwrap();
        assert_eq!(parsed.encryption_method, 0x8003);

        let mut corrupted = header;
        LittleEndian::write_u32(&mut corrupted[12..16], 999);
        assert!(parse_header(&corrupted).is_err());
    }

    #[test]
    fn parses_nested_volume_master_key_with_stretch_key_and_ccm_entry() {
        let nonce = [7u8; 12];
        let ciphertext = vec![0u8; 44];
        let ccm_entry = entry_bytes(0, VALUE_AES_CCM_ENCRYPTED_KEY, &{
            let mut p = nonce.to_vec();
            p.extend_from_slice(&ciphertext);
            p
        });

        let mut stretch_payload = Vec::new();
        stretch_payload.extend_from_slice(&0x8003u16.to_le_bytes());
        stretch_payload.extend_from_slice(&0u16.to_le_bytes());
        stretch_payload.extend_from_slice(&[0x11u8; 16]);
        stretch_payload.extend_from_slice(&ccm_entry);
        let stretch_entry = entry_bytes(0, VALUE_STRETCH_KEY, &stretch_payload);

        let mut vmk_payload = Vec::new();
        vmk_payload.extend_from_slice(&[0x22u8; 16]);
        vmk_payload.extend_from_slice(&0u64.to_le_bytes());
        vmk_payload.extend_from_slice(&0x0800u16.to_le_bytes()); // RecoveryPassword
        vmk_payload.extend_from_slice(&0u16.to_le_bytes());
        vmk_payload.extend_from_slice(&stretch_entry);
        let vmk_entry = entry_bytes(0x0002, VALUE_VOLUME_MASTER_KEY, &vmk_payload);

        let mut metadata_bytes = sample_header(0x8003);
        metadata_bytes.extend_from_slice(&vmk_entry);

        let metadata = parse_metadata(&metadata_bytes).unwrap();
        let vmks = metadata.volume_master_keys();
        assert_eq!(vmks.len(), 1);
        assert_eq!(vmks[0].protection_type, 0x0800);

        let vmk_entry = &metadata.entries[0];
        let stretch = vmk_entry.find_by_value_type(VALUE_STRETCH_KEY).unwrap();
        if let Value::StretchKey(s) = &stretch.value {
            assert_eq!(s.salt, [0x11u8; 16]);
            let ccm = s.children.iter().find(|e| e.value_type == VALUE_AES_CCM_ENCRYPTED_KEY).unwrap();
            if let Value::AesCcmEncryptedKey(k) = &ccm.value {
                assert_eq!(k.nonce, nonce);
                assert_eq!(k.data.len(), 44);
            } else {
                panic!("expected AesCcmEncryptedKey value");
            }
        } else {
            panic!("expected StretchKey value");
        }
    }

    #[test]
    fn rejects_entry_nesting_beyond_depth_limit() {
        // Build 6 levels of StretchKey wrapping StretchKey, which exceeds
        // MAX_NESTING_DEPTH once unwound from the top-level parse.
        fn wrap(payload: Vec<u8>) -> Vec<u8> {
            let mut p = 0x8003u16.to_le_bytes().to_vec();
            p.extend_from_slice(&0u16.to_le_bytes());
            p.extend_from_slice(&[0u8; 16]);
            p.extend_from_slice(&payload);
            entry_bytes(0, VALUE_STRETCH_KEY, &p)
        }
        let mut bytes = entry_bytes(0, VALUE_KEY, &[0u8; 4]);
        for _ in 0..6 {
            bytes = wrap(bytes);
        }
        assert!(parse_entry_stream(&bytes, 0).is_err());
    }
}
