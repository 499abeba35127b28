use std::{
    fs,
    io::{BufReader, Read},
    path::Path,
};

use core::{fmt::Display, str::FromStr};
use hex::encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use grid_error::Result;

/// Number of hex characters in an encoded SHA-256 digest.
const HEX_LEN: usize = 64;

/// Identifies a shader artifact by the SHA-256 digest of its exact
/// bytes. The hex string doubles as the artifact's on-disk filename
/// and its identity on the wire.
#[derive(
    Debug, Clone, PartialEq, Eq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContentHash(String);

impl FromStr for ContentHash {
    type Err = hex::FromHexError;

    /// Only a full-length hex string is accepted. Hashes arrive from
    /// untrusted peers and become filenames, so anything else is
    /// rejected before it can reach the filesystem.
    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        if s.len() != HEX_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        hex::decode(s)?;
        Ok(ContentHash(s.to_lowercase()))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ContentHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ContentHash(encode(hasher.finalize()))
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(ContentHash(encode(hasher.finalize())))
    }

    pub fn from_path<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        log::debug!(
            "Computing SHA-256 hash for file: {:?}",
            file_path.as_ref()
        );

        let file = fs::File::open(file_path)?;
        Self::from_reader(file)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
