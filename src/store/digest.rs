use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::error::Error;

/// 32-byte SHA-256 digest identifying a blob in the store.
///
/// Equality and ordering are bytewise on the raw form; the hex projection is
/// only used for paths and wire formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const LEN: usize = 32;

    pub fn new(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase 64-char hex projection.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex: &str) -> crate::Result<Self> {
        let raw = hex::decode(hex)
            .map_err(|_| Error::InvalidRequest(format!("malformed hash: {hex:?}")))?;
        let raw: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::InvalidRequest(format!("malformed hash: {hex:?}")))?;
        Ok(Self(raw))
    }

    /// Digest of an in-memory buffer.
    pub fn of_bytes(data: impl AsRef<[u8]>) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data.as_ref());
        hasher.finalize()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.hex())
    }
}

impl serde::Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = <String as serde::Deserialize>::deserialize(deserializer)?;
        Digest::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Streaming SHA-256, the chunked counterpart of [`Digest::of_bytes`].
pub struct Hasher(Sha256);

impl Hasher {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub fn finalize(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

#[cfg(test)]
mod test {
    use super::Digest;

    #[test]
    fn hex_round_trip() {
        let digest = Digest::of_bytes(b"hello\n");
        let parsed = Digest::from_hex(&digest.hex()).unwrap();
        assert_eq!(digest, parsed);
        assert_eq!(digest.hex().len(), 64);
    }

    #[test]
    fn known_vector() {
        // sha256 of the empty string
        assert_eq!(
            Digest::of_bytes(b"").hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(Digest::from_hex("zz").is_err());
        assert!(Digest::from_hex("abcd").is_err());
    }
}
