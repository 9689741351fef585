//! Read-only access to the plaintext contents of a BitLocker Drive
//! Encryption (BDE) volume image: header and metadata parsing,
//! credential-driven VMK/FVEK unwrap, and byte-addressable sector I/O.
//!
//! [`Volume`] is the entry point. Open a [`ByteSource`] (a plain file via
//! [`FileByteSource`], or any other backing store), configure one or more
//! credentials, call [`Volume::unlock`], then read plaintext with
//! [`Volume::read`] / [`Volume::read_at`].

#![forbid(unsafe_code)]

// Declare modules.
mod aesprim;
mod credential;
mod diffuser;
mod encryption;
mod error;
mod header;
mod io;
mod metadata;
mod protector;
mod volume;

// Re-export the credential input types callers configure before unlock.
pub use credential::Password;
// Re-export the encryption-method enum surfaced by `Volume::encryption_method`.
pub use encryption::Method;
pub use error::{Error, Result};
// Re-export the detected on-disk variant (Vista/Win7/ToGo).
pub use header::VolumeVariant;
// Re-export the byte-source trait and its file-backed implementation.
pub use io::{ByteSource, FileByteSource};
// Re-export the protector enumeration types returned by `key_protectors`.
pub use protector::{ProtectionType, Protector};
pub use volume::Volume;
