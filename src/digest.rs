//! Content digests used as deduplication keys.

use std::fmt;

use md5::{Digest, Md5};

/// MD5 digest of a rendered tile image.
///
/// MD5 is used for compatibility with existing stores, where digests are
/// persisted as 32 lowercase hex characters (blob file names and the
/// `idmap.md5` column). Collision resistance against adversarial input is
/// not a concern here: the inputs are images we rendered ourselves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; 16]);

impl ContentDigest {
    pub fn of(data: &[u8]) -> Self {
        let hash = Md5::digest(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash);
        ContentDigest(bytes)
    }

    /// Parses the 32-character hex form. Uppercase is accepted.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(ContentDigest(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}
