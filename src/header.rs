//! Volume header parser: detects the Vista/Win7/ToGo on-disk variant from
//! the first 512 bytes and extracts sector geometry plus the one to three
//! absolute byte offsets of the redundant FVE metadata blocks.

use std::fmt;

// Little-endian field reads for the boot-sector layout.
use byteorder::{ByteOrder, LittleEndian};
// VolumeHeader carries no secret material, but derives Zeroize for
// consistency with the other parsed structures it's handed alongside.
use zeroize::Zeroize;

const BITLOCKER_GUID: [u8; 16] = [
    0x49, 0x67, 0xd6, 0x3b, 0x2e, 0x29, 0xd8, 0x4a, 0x83, 0x99, 0xf6, 0xa3, 0x39, 0xe3, 0xd0, 0x01,
];

/// Failure modes of [`VolumeHeader::parse`], mirrored into the top-level
/// `Error` via `From<HeaderError>` rather than constructed directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    TooShort,
    MissingSignature,
    ImplausibleSectorSize(u16),
    UnrecognizedGuid,
    UnrecognizedBootEntryPoint,
    Overflow(&'static str),
    OutOfRange(&'static str),
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaderError::TooShort => write!(f, "volume header shorter than 512 bytes"),
            HeaderError::MissingSignature => write!(f, "missing -FVE-FS- signature"),
            HeaderError::ImplausibleSectorSize(n) => write!(f, "implausible bytes_per_sector {n}"),
            HeaderError::UnrecognizedGuid => write!(f, "unrecognized BitLocker identifier GUID"),
            HeaderError::UnrecognizedBootEntryPoint => write!(f, "unrecognized boot entry point"),
            HeaderError::Overflow(what) => write!(f, "{what} overflow"),
            HeaderError::OutOfRange(what) => write!(f, "{what} exceeds representable range"),
        }
    }
}

impl std::error::Error for HeaderError {}

type Result<T> = std::result::Result<T, HeaderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroize)]
pub enum VolumeVariant {
    Vista,
    Win7,
    ToGo,
}

#[derive(Debug, Clone, Zeroize)]
pub struct VolumeHeader {
    pub variant: VolumeVariant,
    pub bytes_per_sector: u16,
    pub volume_size: u64,
    pub metadata_size: u32,
    /// One to three absolute byte offsets of the redundant metadata
    /// blocks, in on-disk order (primary, second, third).
    pub metadata_offsets: Vec<u64>,
}

impl VolumeHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 512 {
            return Err(HeaderError::TooShort);
        }

        let variant = detect_variant(bytes)?;

        if variant != VolumeVariant::ToGo && &bytes[3..11] != b"-FVE-FS-" {
            return Err(HeaderError::MissingSignature);
        }

        let bytes_per_sector = LittleEndian::read_u16(&bytes[0x0b..0x0d]);
        if bytes_per_sector == 0 || bytes_per_sector > 4096 {
            return Err(HeaderError::ImplausibleSectorSize(bytes_per_sector));
        }

        let total_sectors_16 = LittleEndian::read_u16(&bytes[0x013..0x015]);
        let total_sectors_32 = LittleEndian::read_u32(&bytes[0x020..0x024]);

        let (metadata_size, metadata_offsets, total_sectors) = match variant {
            VolumeVariant::Vista => {
                let total_sectors_64 = LittleEndian::read_u64(&bytes[0x028..0x030]);
                let total_sectors = resolve_total_sectors(total_sectors_16, total_sectors_32, total_sectors_64);

                let sectors_per_cluster = bytes[0x00d] as u64;
                let cluster_size = sectors_per_cluster
                    .checked_mul(bytes_per_sector as u64)
                    .ok_or(HeaderError::Overflow("cluster size"))?;
                let first_metadata_cluster = LittleEndian::read_u64(&bytes[0x038..0x040]);
                let first_metadata_offset = first_metadata_cluster
                    .checked_mul(cluster_size)
                    .ok_or(HeaderError::Overflow("metadata offset"))?;

                (16384u32, vec![first_metadata_offset], total_sectors)
            }
            VolumeVariant::Win7 => {
                let total_sectors = resolve_total_sectors(total_sectors_16, total_sectors_32, 0);
                let offsets = vec![
                    LittleEndian::read_u64(&bytes[0x170..0x178]),
                    LittleEndian::read_u64(&bytes[0x178..0x180]),
                    LittleEndian::read_u64(&bytes[0x180..0x188]),
                ];
                (65536u32, offsets, total_sectors)
            }
            VolumeVariant::ToGo => {
                let total_sectors = resolve_total_sectors(total_sectors_16, total_sectors_32, 0);
                let offsets = vec![
                    LittleEndian::read_u64(&bytes[0x1b8..0x1c0]),
                    LittleEndian::read_u64(&bytes[0x1c0..0x1c8]),
                    LittleEndian::read_u64(&bytes[0x1c8..0x1d0]),
                ];
                (65536u32, offsets, total_sectors)
            }
        };

        let volume_size = total_sectors
            .checked_mul(bytes_per_sector as u64)
            .ok_or(HeaderError::Overflow("volume size"))?;
        if volume_size > i64::MAX as u64 {
            return Err(HeaderError::OutOfRange("volume size"));
        }
        for offset in &metadata_offsets {
            if *offset > i64::MAX as u64 {
                return Err(HeaderError::OutOfRange("metadata offset"));
            }
        }

        Ok(VolumeHeader {
            variant,
            bytes_per_sector,
            volume_size,
            metadata_size,
            metadata_offsets,
        })
    }
}

fn resolve_total_sectors(sectors_16: u16, sectors_32: u32, sectors_64: u64) -> u64 {
    if sectors_16 != 0 {
        sectors_16 as u64
    } else if sectors_32 != 0 {
        sectors_32 as u64
    } else {
        sectors_64
    }
}

fn detect_variant(bytes: &[u8]) -> Result<VolumeVariant> {
    match &bytes[0..3] {
        [0xEB, 0x52, 0x90] => Ok(VolumeVariant::Vista),
        [0xEB, 0x58, 0x90] => {
            if bytes[0x160..0x170] == BITLOCKER_GUID {
                Ok(VolumeVariant::Win7)
            } else if bytes[0x1a8..0x1b8] == BITLOCKER_GUID {
                Ok(VolumeVariant::ToGo)
            } else {
                Err(HeaderError::UnrecognizedGuid)
            }
        }
        _ => Err(HeaderError::UnrecognizedBootEntryPoint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vista_header(first_metadata_cluster: u64, total_sectors_32: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        buf[3..11].copy_from_slice(b"-FVE-FS-");
        LittleEndian::write_u16(&mut buf[0x0b..0x0d], 512);
        buf[0x00d] = 8; // sectors per cluster
        LittleEndian::write_u32(&mut buf[0x020..0x024], total_sectors_32);
        LittleEndian::write_u64(&mut buf[0x038..0x040], first_metadata_cluster);
        buf
    }

    fn win7_header(total_sectors_32: u32, offsets: [u64; 3]) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        buf[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        buf[3..11].copy_from_slice(b"-FVE-FS-");
        LittleEndian::write_u16(&mut buf[0x0b..0x0d], 512);
        LittleEndian::write_u32(&mut buf[0x020..0x024], total_sectors_32);
        buf[0x160..0x170].copy_from_slice(&BITLOCKER_GUID);
        LittleEndian::write_u64(&mut buf[0x170..0x178], offsets[0]);
        LittleEndian::write_u64(&mut buf[0x178..0x180], offsets[1]);
        LittleEndian::write_u64(&mut buf[0x180..0x188], offsets[2]);
        buf
    }

    #[test]
    fn parses_vista_variant() {
        let buf = vista_header(4, 209_715_200);
        let header = VolumeHeader::parse(&buf).unwrap();
        assert_eq!(header.variant, VolumeVariant::Vista);
        assert_eq!(header.metadata_size, 16384);
        assert_eq!(header.metadata_offsets.len(), 1);
        assert_eq!(header.metadata_offsets[0], 4 * 8 * 512);
    }

    #[test]
    fn parses_win7_variant() {
        let buf = win7_header(209_715_200, [0x10000, 0x20000, 0x30000]);
        let header = VolumeHeader::parse(&buf).unwrap();
        assert_eq!(header.variant, VolumeVariant::Win7);
        assert_eq!(header.metadata_size, 65536);
        assert_eq!(header.metadata_offsets, vec![0x10000, 0x20000, 0x30000]);
        assert_eq!(header.volume_size, 209_715_200 * 512);
    }

    #[test]
    fn rejects_unknown_boot_entry_point() {
        let buf = vec![0u8; 512];
        assert!(VolumeHeader::parse(&buf).is_err());
    }

    #[test]
    fn rejects_win7_without_bitlocker_guid() {
        let mut buf = win7_header(1000, [1, 2, 3]);
        buf[0x160..0x170].fill(0);
        assert!(VolumeHeader::parse(&buf).is_err());
    }
}
