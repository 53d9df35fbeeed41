use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

const LENGTH: usize = 32;

#[derive(PartialEq, Clone, Copy, Debug, thiserror::Error)]
#[error("invalid length, expected: {expected:?}, got: {got:?}")]
pub struct InvalidLength {
    expected: usize,
    got: usize,
}

/// The 32-byte preimage whose on-chain disclosure is the atomicity hinge
/// of the swap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Secret(#[serde(with = "serde_bytes_array")] [u8; LENGTH]);

impl Secret {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; LENGTH];
        rng.fill_bytes(&mut bytes);

        Secret(bytes)
    }

    pub fn from_vec(vec: &[u8]) -> Result<Secret, InvalidLength> {
        if vec.len() != LENGTH {
            return Err(InvalidLength {
                expected: LENGTH,
                got: vec.len(),
            });
        }
        let mut data = [0; LENGTH];
        data.copy_from_slice(vec);

        Ok(Secret(data))
    }

    pub fn as_raw_secret(&self) -> &[u8; LENGTH] {
        &self.0
    }

    pub fn into_raw_secret(self) -> [u8; LENGTH] {
        self.0
    }
}

impl From<[u8; LENGTH]> for Secret {
    fn from(secret: [u8; LENGTH]) -> Self {
        Secret(secret)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl fmt::LowerHex for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(hex::encode(&self.0).as_str())
    }
}

impl FromStr for Secret {
    type Err = FromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vec = hex::decode(s)?;
        let secret = Self::from_vec(&vec)?;

        Ok(secret)
    }
}

#[derive(PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum FromStrError {
    #[error("failed to decode bytes as hex")]
    HexDecode(#[from] hex::FromHexError),
    #[error("failed to construct secret from bytes")]
    FromVec(#[from] InvalidLength),
}

/// SHA-256 of a [`Secret`], the HTLC hash lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretHash(#[serde(with = "serde_bytes_array")] [u8; LENGTH]);

impl SecretHash {
    pub fn new(secret: Secret) -> Self {
        let hash = Sha256::digest(secret.as_raw_secret()).into();

        SecretHash(hash)
    }

    pub fn from_vec(vec: &[u8]) -> Result<Self, InvalidLength> {
        if vec.len() != LENGTH {
            return Err(InvalidLength {
                expected: LENGTH,
                got: vec.len(),
            });
        }
        let mut data = [0; LENGTH];
        data.copy_from_slice(vec);

        Ok(SecretHash(data))
    }

    pub fn as_raw(&self) -> &[u8; LENGTH] {
        &self.0
    }

    pub fn into_raw(self) -> [u8; LENGTH] {
        self.0
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHash({:x})", self)
    }
}

impl fmt::Display for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::LowerHex for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(hex::encode(&self.0).as_str())
    }
}

mod serde_bytes_array {
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: &[u8] = de::Deserialize::deserialize(deserializer)?;
        if bytes.len() != 32 {
            return Err(de::Error::invalid_length(bytes.len(), &"32 bytes"));
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(bytes);

        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_of_known_secret() {
        let secret = Secret::from(*b"hello world, you are beautiful!!");

        assert_eq!(
            format!("{}", SecretHash::new(secret)),
            "68d627971643a6f97f27c58957826fcba853ec2077fd10ec6b93d8e61deb4cec"
        );
    }

    #[test]
    fn invalid_length_from_str() {
        let result =
            Secret::from_str("68d627971643a6f97f27c58957826fcba853ec2077fd10ec6b93d8e61deb4c");

        assert!(result.is_err());
    }

    #[test]
    fn secret_hash_is_stable_under_cbor_roundtrip() {
        let hash = SecretHash::new(Secret::from([7u8; 32]));

        let bytes = serde_cbor::to_vec(&hash).unwrap();
        let decoded: SecretHash = serde_cbor::from_slice(&bytes).unwrap();

        assert_eq!(decoded, hash);
    }
}
