//! Content digests in the OCI `algorithm:encoded` form.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha512};

use crate::error::ChunkedError;

/// Digest of the empty byte string, used for empty regular files that carry
/// no digest in the TOC.
pub const SHA256_EMPTY: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A parsed and validated content digest such as `sha256:abcd...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    encoded: String,
}

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    /// SHA-256, the canonical algorithm.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl Algorithm {
    fn name(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Start a new streaming digest with this algorithm.
    pub fn digester(self) -> Digester {
        match self {
            Algorithm::Sha256 => Digester::Sha256(Sha256::new()),
            Algorithm::Sha512 => Digester::Sha512(Sha512::new()),
        }
    }
}

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn sha256(data: &[u8]) -> Self {
        let mut d = Algorithm::Sha256.digester();
        d.update(data);
        d.finish()
    }

    /// Algorithm name, e.g. `sha256`.
    pub fn algorithm(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Algorithm of this digest.
    pub fn algorithm_kind(&self) -> Algorithm {
        self.algorithm
    }

    /// Lowercase hex encoding of the hash.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Check `data` against this digest, using the algorithm it names.
    pub fn verify(&self, what: &str, data: &[u8]) -> crate::Result<()> {
        let mut d = self.algorithm.digester();
        d.update(data);
        d.finish().ensure_eq(what, self)
    }

    /// Error with [`ChunkedError::DigestMismatch`] unless `self == expected`.
    pub fn ensure_eq(&self, what: &str, expected: &Digest) -> crate::Result<()> {
        if self != expected {
            return Err(ChunkedError::DigestMismatch {
                what: what.to_string(),
                expected: expected.to_string(),
                actual: self.to_string(),
            });
        }
        Ok(())
    }
}

impl FromStr for Digest {
    type Err = ChunkedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alg, encoded) = s
            .split_once(':')
            .ok_or_else(|| ChunkedError::Format(format!("invalid digest {s:?}: missing ':'")))?;
        let algorithm = match alg {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            other => {
                return Err(ChunkedError::Format(format!(
                    "invalid digest {s:?}: unsupported algorithm {other:?}"
                )));
            }
        };
        if encoded.len() != algorithm.hex_len()
            || !encoded
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(ChunkedError::Format(format!(
                "invalid digest {s:?}: bad encoding"
            )));
        }
        Ok(Digest {
            algorithm,
            encoded: encoded.to_string(),
        })
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.encoded)
    }
}

/// Streaming hasher producing a [`Digest`]. Implements [`Write`] so it can be
/// used as the sink of `io::copy` or teed with a destination file.
#[derive(Clone)]
pub enum Digester {
    /// SHA-256 state.
    Sha256(Sha256),
    /// SHA-512 state.
    Sha512(Sha512),
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Digester::Sha256(_) => f.write_str("Digester(sha256)"),
            Digester::Sha512(_) => f.write_str("Digester(sha512)"),
        }
    }
}

impl Digester {
    /// Feed more data.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Sha256(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    /// Finish and return the digest.
    pub fn finish(self) -> Digest {
        let (algorithm, encoded) = match self {
            Digester::Sha256(h) => (Algorithm::Sha256, format!("{:x}", h.finalize())),
            Digester::Sha512(h) => (Algorithm::Sha512, format!("{:x}", h.finalize())),
        };
        Digest { algorithm, encoded }
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
