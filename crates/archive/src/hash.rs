//! Content hashing and hash-derived storage paths.
//!
//! Every entry is identified on disk by the MD5 of its bytes, fanned out into
//! at most 256 sub-directories by the first byte:
//!
//! ```
//! use moon_archive::hash::{Hashes, build_path};
//! let hashes = Hashes::digest(b"");
//! assert_eq!(
//!     build_path(&hashes.md5, ".png"),
//!     std::path::Path::new("d4/d41d8cd98f00b204e9800998ecf8427e.png"),
//! );
//! ```

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::PathBuf;

pub const MD5_LEN: usize = 16;
pub const SHA1_LEN: usize = 20;
pub const SHA256_LEN: usize = 32;

const BUFFER_SIZE: usize = 64 * 1024;

/// The three digests recorded for every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hashes {
    pub md5: [u8; MD5_LEN],
    pub sha1: [u8; SHA1_LEN],
    pub sha256: [u8; SHA256_LEN],
}

impl Hashes {
    pub fn digest(bytes: &[u8]) -> Self {
        Self {
            md5: Md5::digest(bytes).into(),
            sha1: Sha1::digest(bytes).into(),
            sha256: Sha256::digest(bytes).into(),
        }
    }

    /// Hash a stream in a single pass.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut md5 = Md5::new();
        let mut sha1 = Sha1::new();
        let mut sha256 = Sha256::new();
        let mut buffer = vec![0; BUFFER_SIZE];
        loop {
            let count = reader.read(&mut buffer).or_raise(|| ErrorKind::Io)?;
            if count == 0 {
                break;
            }
            md5.update(&buffer[..count]);
            sha1.update(&buffer[..count]);
            sha256.update(&buffer[..count]);
        }
        Ok(Self {
            md5: md5.finalize().into(),
            sha1: sha1.finalize().into(),
            sha256: sha256.finalize().into(),
        })
    }

    /// Build from raw digests supplied by someone else, checking that each
    /// one has exactly the right length.
    pub fn from_slices(md5: &[u8], sha1: &[u8], sha256: &[u8]) -> Result<Self> {
        Ok(Self {
            md5: <[u8; MD5_LEN]>::try_from(md5).or_raise(|| ErrorKind::Validation("md5 must be 16 bytes"))?,
            sha1: <[u8; SHA1_LEN]>::try_from(sha1).or_raise(|| ErrorKind::Validation("sha1 must be 20 bytes"))?,
            sha256: <[u8; SHA256_LEN]>::try_from(sha256).or_raise(|| ErrorKind::Validation("sha256 must be 32 bytes"))?,
        })
    }

    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    pub fn sha1_hex(&self) -> String {
        hex::encode(self.sha1)
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// Derive the storage path of an entry: `<first md5 byte>/<md5><extension>`,
/// both in lowercase hex.
///
/// The extension is appended as-is apart from ensuring a single leading dot.
pub fn build_path(md5: &[u8; MD5_LEN], extension: &str) -> PathBuf {
    let full = hex::encode(md5);
    let extension = extension.trim_start_matches('.');
    let file = match extension.is_empty() {
        true => full.clone(),
        false => format!("{full}.{extension}"),
    };
    PathBuf::from(&full[..2]).join(file)
}

/// Normalize a file extension for storage: lowercase with a single leading
/// dot. Anything but ASCII alphanumerics would end up inside a path, so it is
/// rejected.
pub fn normalize_extension(extension: &str) -> Result<String> {
    let bare = extension.trim().trim_start_matches('.');
    if bare.is_empty() {
        exn::bail!(ErrorKind::Validation("extension must not be empty"));
    }
    if !bare.chars().all(|c| c.is_ascii_alphanumeric()) {
        exn::bail!(ErrorKind::Validation("extension must be alphanumeric"));
    }
    Ok(format!(".{}", bare.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::Path;

    const HELLO: &[u8] = b"hello world";

    #[test]
    fn test_known_digests() {
        let hashes = Hashes::digest(HELLO);
        assert_eq!(hashes.md5_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(hashes.sha1_hex(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert_eq!(hashes.sha256_hex(), "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_reader_matches_digest() {
        let large: Vec<u8> = (0..BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();
        assert_eq!(Hashes::from_reader(&large[..]).unwrap(), Hashes::digest(&large));
        assert_eq!(Hashes::from_reader(HELLO).unwrap(), Hashes::digest(HELLO));
    }

    #[test]
    fn test_path_is_deterministic() {
        let first = build_path(&Hashes::digest(HELLO).md5, ".txt");
        let second = build_path(&Hashes::digest(HELLO).md5, ".txt");
        assert_eq!(first, second);
        assert_eq!(first, Path::new("5e/5eb63bbbe01eeed093cb22bb8f5acdc3.txt"));
    }

    #[rstest]
    #[case(".png", "5e/5eb63bbbe01eeed093cb22bb8f5acdc3.png")]
    #[case("png", "5e/5eb63bbbe01eeed093cb22bb8f5acdc3.png")]
    #[case("", "5e/5eb63bbbe01eeed093cb22bb8f5acdc3")]
    fn test_build_path_extension(#[case] extension: &str, #[case] expected: &str) {
        assert_eq!(build_path(&Hashes::digest(HELLO).md5, extension), Path::new(expected));
    }

    #[rstest]
    #[case(15, 20, 32)]
    #[case(17, 20, 32)]
    #[case(16, 19, 32)]
    #[case(16, 21, 32)]
    #[case(16, 20, 31)]
    #[case(16, 20, 33)]
    #[case(0, 0, 0)]
    fn test_from_slices_rejects_bad_lengths(#[case] md5: usize, #[case] sha1: usize, #[case] sha256: usize) {
        let err = Hashes::from_slices(&vec![0; md5], &vec![0; sha1], &vec![0; sha256]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
    }

    #[test]
    fn test_from_slices_accepts_exact_lengths() {
        let hashes = Hashes::digest(HELLO);
        assert_eq!(Hashes::from_slices(&hashes.md5, &hashes.sha1, &hashes.sha256).unwrap(), hashes);
    }

    #[rstest]
    #[case(".PNG", ".png")]
    #[case("jpeg", ".jpeg")]
    #[case(" ..webm ", ".webm")]
    fn test_normalize_extension(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_extension(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("tar.gz")]
    #[case("../x")]
    #[case("p g")]
    fn test_normalize_extension_rejects(#[case] input: &str) {
        assert!(normalize_extension(input).is_err());
    }
}
