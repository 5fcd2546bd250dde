//! Checksum computation and verification.
//!
//! Downloaded artifacts are verified against the checksums their lockfiles
//! declare. Verification reads the file once, updating one hasher per named
//! algorithm in a single streaming pass.
//!
//! The policy: if any named digest matches and none mismatch, the file is
//! accepted. Any computed mismatch is a hard failure, even if a different
//! algorithm matched. Algorithms we cannot compute are skipped with a
//! warning; a skipped algorithm is neither a match nor a mismatch.

use crate::core::Cachi2Error;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::digest::DynDigest;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 10240;

/// A cryptographic algorithm and a hex-encoded checksum calculated by that
/// algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChecksumInfo {
    /// Lowercase algorithm name, e.g. `sha256`.
    pub algorithm: String,
    /// Lowercase hex digest.
    pub hexdigest: String,
}

impl ChecksumInfo {
    pub fn new(algorithm: impl AsRef<str>, hexdigest: impl AsRef<str>) -> Self {
        Self {
            algorithm: algorithm.as_ref().to_lowercase(),
            hexdigest: hexdigest.as_ref().to_lowercase(),
        }
    }

    /// Parse an `algorithm:hexdigest` pair.
    pub fn from_pair(pair: &str) -> Result<Self, Cachi2Error> {
        let (algorithm, hexdigest) = pair.split_once(':').ok_or_else(|| {
            Cachi2Error::InvalidInput(format!("expected 'algorithm:digest', got {pair:?}"))
        })?;
        Ok(Self::new(algorithm, hexdigest))
    }

    /// Return the Subresource Integrity representation of this checksum.
    ///
    /// npm and yarn use this format in their lockfiles.
    pub fn to_sri(&self) -> String {
        let bytes = hex::decode(&self.hexdigest).unwrap_or_default();
        format!("{}-{}", self.algorithm, BASE64.encode(bytes))
    }

    /// Convert a Subresource Integrity value (`sha512-<base64>`) to a
    /// `ChecksumInfo`.
    pub fn from_sri(sri: &str) -> Result<Self, Cachi2Error> {
        let (algorithm, b64) = sri.split_once('-').ok_or_else(|| {
            Cachi2Error::InvalidInput(format!("invalid integrity value: {sri:?}"))
        })?;
        let bytes = BASE64.decode(b64).map_err(|e| {
            Cachi2Error::InvalidInput(format!("invalid integrity value {sri:?}: {e}"))
        })?;
        Ok(Self::new(algorithm, hex::encode(bytes)))
    }
}

impl fmt::Display for ChecksumInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hexdigest)
    }
}

fn make_hasher(algorithm: &str) -> Option<Box<dyn DynDigest>> {
    match algorithm {
        "sha512" => Some(Box::new(sha2::Sha512::default())),
        "sha384" => Some(Box::new(sha2::Sha384::default())),
        "sha256" => Some(Box::new(sha2::Sha256::default())),
        "sha224" => Some(Box::new(sha2::Sha224::default())),
        "sha1" => Some(Box::new(sha1::Sha1::default())),
        "md5" => Some(Box::new(md5::Md5::default())),
        _ => None,
    }
}

/// Algorithms [`must_match_any_checksum`] can compute.
pub fn supported_algorithms() -> &'static [&'static str] {
    &["md5", "sha1", "sha224", "sha256", "sha384", "sha512"]
}

/// Verify that the file matches the expected checksums.
///
/// Succeeds when at least one expected digest matches and no computed digest
/// mismatches. Unsupported algorithms are skipped with a warning.
///
/// # Errors
/// [`Cachi2Error::ChecksumMismatch`] when any computed digest differs from
/// every expected digest of its algorithm, or when nothing could be verified
/// at all.
pub fn must_match_any_checksum(
    file_path: &Path,
    expected_checksums: &[ChecksumInfo],
) -> Result<(), Cachi2Error> {
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.display().to_string());

    // Group expected digests by algorithm; one hasher per algorithm.
    let mut expected_by_algorithm: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for checksum in expected_checksums {
        expected_by_algorithm
            .entry(checksum.algorithm.as_str())
            .or_default()
            .insert(checksum.hexdigest.as_str());
    }

    let mut hashers: Vec<(&str, Box<dyn DynDigest>)> = Vec::new();
    for &algorithm in expected_by_algorithm.keys() {
        match make_hasher(algorithm) {
            Some(hasher) => hashers.push((algorithm, hasher)),
            None => warn!(
                "{file_name}: {algorithm} checksum not supported (supported: {})",
                supported_algorithms().join(", ")
            ),
        }
    }

    let mut file = std::fs::File::open(file_path)?;
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        for (_, hasher) in &mut hashers {
            hasher.update(&buffer[..n]);
        }
    }

    let mut matches = 0usize;
    let mut mismatches: Vec<(String, String)> = Vec::new();
    for (algorithm, hasher) in hashers {
        let digest = hex::encode(hasher.finalize());
        if expected_by_algorithm[algorithm].contains(digest.as_str()) {
            debug!("{file_name}: {algorithm} checksum matches: {digest}");
            matches += 1;
        } else {
            warn!("{file_name}: {algorithm} checksum does not match (got: {digest})");
            mismatches.push((algorithm.to_string(), digest));
        }
    }

    if !mismatches.is_empty() || matches == 0 {
        return Err(Cachi2Error::ChecksumMismatch {
            file_name,
            expected: expected_checksums.iter().map(ToString::to_string).collect(),
            actual: mismatches
                .into_iter()
                .map(|(algorithm, digest)| format!("{algorithm}:{digest}"))
                .collect(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn spam_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("spam.txt");
        fs::write(&path, "spam").unwrap();
        path
    }

    fn sha256_of(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn test_single_match_passes() {
        let temp = tempdir().unwrap();
        let path = spam_file(temp.path());
        let checksum = ChecksumInfo::new("sha256", sha256_of(b"spam"));
        must_match_any_checksum(&path, &[checksum]).unwrap();
    }

    #[test]
    fn test_mismatch_fails_even_if_other_algorithm_matches() {
        let temp = tempdir().unwrap();
        let path = spam_file(temp.path());
        let good = ChecksumInfo::new("sha256", sha256_of(b"spam"));
        let bad = ChecksumInfo::new("sha1", "0".repeat(40));
        let err = must_match_any_checksum(&path, &[good, bad]).unwrap_err();
        assert!(matches!(err, Cachi2Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_multiple_digests_for_one_algorithm() {
        let temp = tempdir().unwrap();
        let path = spam_file(temp.path());
        // one of the two sha256 candidates matches -> no mismatch recorded
        let candidates = [
            ChecksumInfo::new("sha256", sha256_of(b"spam")),
            ChecksumInfo::new("sha256", sha256_of(b"eggs")),
        ];
        must_match_any_checksum(&path, &candidates).unwrap();
    }

    #[test]
    fn test_unsupported_algorithm_alone_fails() {
        let temp = tempdir().unwrap();
        let path = spam_file(temp.path());
        let unknown = ChecksumInfo::new("crc32", "deadbeef");
        let err = must_match_any_checksum(&path, &[unknown]).unwrap_err();
        assert!(matches!(err, Cachi2Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_unsupported_algorithm_is_skipped_when_another_matches() {
        let temp = tempdir().unwrap();
        let path = spam_file(temp.path());
        let checksums = [
            ChecksumInfo::new("crc32", "deadbeef"),
            ChecksumInfo::new("sha256", sha256_of(b"spam")),
        ];
        must_match_any_checksum(&path, &checksums).unwrap();
    }

    #[test]
    fn test_sri_round_trip() {
        let info = ChecksumInfo::new("sha512", "cafe".repeat(32));
        let sri = info.to_sri();
        assert!(sri.starts_with("sha512-"));
        assert_eq!(ChecksumInfo::from_sri(&sri).unwrap(), info);
    }

    #[test]
    fn test_from_sri_known_value() {
        // base64("\xca\xfe") == "yv4="
        let info = ChecksumInfo::from_sri("sha256-yv4=").unwrap();
        assert_eq!(info, ChecksumInfo::new("sha256", "cafe"));
    }

    #[test]
    fn test_from_pair() {
        let info = ChecksumInfo::from_pair("SHA256:ABCDEF").unwrap();
        assert_eq!(info.algorithm, "sha256");
        assert_eq!(info.hexdigest, "abcdef");
        assert!(ChecksumInfo::from_pair("no-colon").is_err());
    }

    #[test]
    fn test_checksum_display() {
        let info = ChecksumInfo::new("sha256", "abc123");
        assert_eq!(info.to_string(), "sha256:abc123");
    }
}
