//! Integrity check of a finished download

use crate::error::DownloadError;
use sha2::Digest;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

/// Digest algorithm, picked from the length of the expected hex string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha256,
}

impl HashKind {
    /// 32 hex digits select MD5, 64 select SHA-256
    pub fn from_hex(hex: &str) -> Option<Self> {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match hex.len() {
            32 => Some(Self::Md5),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Hash a stream, returning lowercase hex
    pub fn compute<R: Read>(&self, mut reader: R) -> std::io::Result<String> {
        let mut buffer = [0u8; 64 * 1024];

        match self {
            Self::Md5 => {
                let mut context = md5::Context::new();
                loop {
                    let n = reader.read(&mut buffer)?;
                    if n == 0 {
                        break;
                    }
                    context.consume(&buffer[..n]);
                }
                Ok(format!("{:x}", context.compute()))
            }
            Self::Sha256 => {
                let mut hasher = sha2::Sha256::new();
                loop {
                    let n = reader.read(&mut buffer)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
        }
    }
}

pub fn compute_file_hash(path: &Path, kind: HashKind) -> std::io::Result<String> {
    kind.compute(File::open(path)?)
}

/// Compare the digest of `path` against `expected`, ignoring case
pub fn verify_file_hash(path: &Path, expected: &str) -> Result<(), DownloadError> {
    let kind = HashKind::from_hex(expected)
        .ok_or_else(|| DownloadError::Config(format!("unsupported hash: {}", expected)))?;
    let actual = compute_file_hash(path, kind)?;

    if actual.eq_ignore_ascii_case(expected) {
        info!("{:?} of {} verified", kind, path.display());
        Ok(())
    } else {
        warn!("{:?} of {} is {}, expected {}", kind, path.display(), actual, expected);
        Err(DownloadError::HashMismatch {
            expected: expected.to_lowercase(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ABC_MD5: &str = "900150983cd24fb0d6963f7d28e17f72";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_hash_kind_from_hex() {
        assert_eq!(HashKind::from_hex(ABC_MD5), Some(HashKind::Md5));
        assert_eq!(HashKind::from_hex(ABC_SHA256), Some(HashKind::Sha256));
        assert_eq!(HashKind::from_hex(&ABC_MD5.to_uppercase()), Some(HashKind::Md5));
        assert_eq!(HashKind::from_hex("abc"), None);
        assert_eq!(HashKind::from_hex(&"z".repeat(32)), None);
    }

    #[test]
    fn test_compute_known_digests() {
        assert_eq!(HashKind::Md5.compute(&b"abc"[..]).unwrap(), ABC_MD5);
        assert_eq!(HashKind::Sha256.compute(&b"abc"[..]).unwrap(), ABC_SHA256);
    }

    #[test]
    fn test_verify_file_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        file.flush().unwrap();

        verify_file_hash(file.path(), ABC_MD5).unwrap();
        verify_file_hash(file.path(), &ABC_SHA256.to_uppercase()).unwrap();

        let err = verify_file_hash(file.path(), &"0".repeat(32)).unwrap_err();
        assert!(matches!(err, DownloadError::HashMismatch { ref actual, .. } if actual == ABC_MD5));
        assert_eq!(err.to_string(), "hash mismatch");
    }
}
