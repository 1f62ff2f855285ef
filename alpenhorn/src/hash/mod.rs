//! Hashing utilities.
//!
//! The Data Index records an MD5 digest for every archived file. MD5 is
//! not used for anything security-sensitive here: it is a fixture of the
//! archive format and of the external transfer tools (`bbcp -E md5=`),
//! which report source-side MD5 sums.

#[cfg(test)]
mod tests;

use std::path::Path;

use displaydoc::Display;
use md5::{Digest, Md5};
use serde::{de, ser, Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::AlpenhornResult;

/// Chunk size for streaming file hashing.
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// A content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hash {
    /// An MD5 digest.
    Md5([u8; 16]),
}

/// A hashing error.
#[derive(Debug, Display)]
pub enum Error {
    /// Invalid hexadecimal hash: {0}
    InvalidHexHash(hex::FromHexError),

    /// Invalid length for MD5 string: Must be {expected} characters, got {actual}.
    InvalidHashStringLength { expected: usize, actual: usize },
}

impl Hash {
    /// Convenience function to generate an MD5 digest from a slice.
    pub fn md5_from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        Self::Md5(hasher.finalize().into())
    }

    /// Computes the MD5 digest of a file, streaming it in 1 MiB chunks.
    ///
    /// The file is not held open by the returned value.
    pub async fn md5_from_file(path: &Path) -> AlpenhornResult<Self> {
        let mut file = File::open(path).await?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; HASH_CHUNK_SIZE];

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(Self::Md5(hasher.finalize().into()))
    }

    /// Parses a hexadecimal representation of an MD5 digest.
    ///
    /// This is the canonical representation of hashes in the Data Index.
    pub fn from_hex(s: &str) -> AlpenhornResult<Self> {
        if s.len() != 32 {
            return Err(Error::InvalidHashStringLength {
                expected: 32,
                actual: s.len(),
            }
            .into());
        }

        let v = hex::decode(s).map_err(Error::InvalidHexHash)?;
        Ok(Self::Md5(v.try_into().unwrap()))
    }

    /// Returns the digest in hexadecimal format.
    pub fn to_hex(&self) -> String {
        hex::encode(self.data())
    }

    fn data(&self) -> &[u8] {
        match self {
            Self::Md5(d) => d,
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    /// Deserializes a hexadecimal hash string.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;

        String::deserialize(deserializer)
            .and_then(|s| Self::from_hex(&s).map_err(|e| Error::custom(e.to_string())))
    }
}

impl Serialize for Hash {
    /// Serializes a hash into a hexadecimal hash string.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}
