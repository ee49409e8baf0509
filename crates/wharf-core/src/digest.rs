//! Content digests and streaming verification

use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::tarsum::TarsumHasher;

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("Invalid digest: {0}")]
    Invalid(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
    /// Tarsum over a tar stream, sha256-based. A distinct label: a
    /// tarsum digest never compares equal to a plain sha256 digest.
    TarsumV1Sha256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
            Algorithm::TarsumV1Sha256 => "tarsum.v1+sha256",
        }
    }

    /// Length of the hex-encoded value for this algorithm
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 | Algorithm::TarsumV1Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl FromStr for Algorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            "tarsum.v1+sha256" => Ok(Algorithm::TarsumV1Sha256),
            other => Err(DigestError::Invalid(format!(
                "unknown digest algorithm: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content digest: an algorithm label plus a lowercase hex value.
///
/// Two digests are equal iff both fields match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn new(algorithm: Algorithm, hex: String) -> Result<Self, DigestError> {
        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(DigestError::Invalid(format!("{}:{}", algorithm, hex)));
        }
        Ok(Self { algorithm, hex })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (label, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::Invalid(format!("missing algorithm prefix: {}", s)))?;
        let algorithm: Algorithm = label.parse()?;
        Digest::new(algorithm, hex.to_string())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

#[derive(Clone, Debug)]
enum Inner {
    Sha256(Sha256),
    Sha512(Sha512),
    Tarsum(TarsumHasher),
}

/// Streaming digest computation.
///
/// Callers feed bytes incrementally and finalize once. The verifier is
/// `Clone` so an in-flight hash can be finalized speculatively (a failed
/// upload commit keeps the running state for the retry).
#[derive(Clone, Debug)]
pub struct Verifier {
    algorithm: Algorithm,
    inner: Inner,
}

impl Verifier {
    pub fn new(algorithm: Algorithm) -> Self {
        let inner = match algorithm {
            Algorithm::Sha256 => Inner::Sha256(Sha256::new()),
            Algorithm::Sha512 => Inner::Sha512(Sha512::new()),
            Algorithm::TarsumV1Sha256 => Inner::Tarsum(TarsumHasher::new()),
        };
        Self { algorithm, inner }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Feed bytes into the hash. Callers serialize writes; a verifier is
    /// never shared between writers.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Sha256(h) => h.update(data),
            Inner::Sha512(h) => h.update(data),
            Inner::Tarsum(h) => h.update(data),
        }
    }

    /// Finalize a copy of the running state into a digest.
    pub fn digest(&self) -> Digest {
        let hex = match self.inner.clone() {
            Inner::Sha256(h) => hex::encode(h.finalize()),
            Inner::Sha512(h) => hex::encode(h.finalize()),
            Inner::Tarsum(h) => h.finalize(),
        };
        Digest {
            algorithm: self.algorithm,
            hex,
        }
    }

    /// Compare the finalized digest against an expected one in constant
    /// time.
    pub fn verify(&self, expected: &Digest) -> bool {
        let computed = self.digest();
        computed.algorithm == expected.algorithm
            && constant_time_eq(computed.hex.as_bytes(), expected.hex.as_bytes())
    }
}

/// Compute the digest of a byte slice in one shot
pub fn digest_of(algorithm: Algorithm, data: &[u8]) -> Digest {
    let mut verifier = Verifier::new(algorithm);
    verifier.update(data);
    verifier.digest()
}

/// Constant-time comparison to prevent timing side channels
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_and_display_roundtrip() {
        let raw = format!("sha256:{}", EMPTY_SHA256);
        let digest: Digest = raw.parse().unwrap();
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert_eq!(digest.to_string(), raw);
    }

    #[test]
    fn test_parse_rejects_malformed_digests() {
        assert!("e3b0c442".parse::<Digest>().is_err());
        assert!("md5:abcd".parse::<Digest>().is_err());
        assert!(format!("sha256:{}", &EMPTY_SHA256[..60]).parse::<Digest>().is_err());
        assert!(format!("sha256:{}", EMPTY_SHA256.to_uppercase())
            .parse::<Digest>()
            .is_err());
        assert!("sha256:zzb0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse::<Digest>()
            .is_err());
    }

    #[test]
    fn test_tarsum_label_is_distinct_from_sha256() {
        let a = Digest::new(Algorithm::Sha256, EMPTY_SHA256.to_string()).unwrap();
        let b = Digest::new(Algorithm::TarsumV1Sha256, EMPTY_SHA256.to_string()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_input_digest() {
        let verifier = Verifier::new(Algorithm::Sha256);
        assert_eq!(verifier.digest().hex(), EMPTY_SHA256);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut verifier = Verifier::new(Algorithm::Sha256);
        verifier.update(b"hello ");
        verifier.update(b"world");

        assert_eq!(verifier.digest(), digest_of(Algorithm::Sha256, b"hello world"));
    }

    #[test]
    fn test_digest_survives_finalize() {
        let mut verifier = Verifier::new(Algorithm::Sha256);
        verifier.update(b"hello");

        // Finalizing is non-destructive; more bytes can follow
        let first = verifier.digest();
        assert_eq!(first, digest_of(Algorithm::Sha256, b"hello"));

        verifier.update(b" world");
        assert_eq!(verifier.digest(), digest_of(Algorithm::Sha256, b"hello world"));
    }

    #[test]
    fn test_verify_checks_algorithm_and_value() {
        let mut verifier = Verifier::new(Algorithm::Sha256);
        verifier.update(b"hello");

        let good = digest_of(Algorithm::Sha256, b"hello");
        let wrong_value = digest_of(Algorithm::Sha256, b"other");
        assert!(verifier.verify(&good));
        assert!(!verifier.verify(&wrong_value));

        let wrong_algo = Digest::new(Algorithm::TarsumV1Sha256, good.hex().to_string()).unwrap();
        assert!(!verifier.verify(&wrong_algo));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_sha512_digest_length() {
        let digest = digest_of(Algorithm::Sha512, b"hello");
        assert_eq!(digest.hex().len(), 128);
        assert_eq!(digest.to_string().len(), "sha512:".len() + 128);
    }
}
