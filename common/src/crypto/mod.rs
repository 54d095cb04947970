use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize, Serializer as SerdeSerializer};

use crate::{
    config::{BLS_PUBLIC_KEY_SIZE, BLS_SIGNATURE_SIZE},
    serializer::{Reader, ReaderError, Serializer, Writer},
};

/// BLS12-381 public key as found in deposit data and the key registry.
///
/// The daemon never verifies BLS signatures; keys are opaque 48-byte
/// identifiers compared for equality only.
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct BlsPublicKey([u8; BLS_PUBLIC_KEY_SIZE]);

impl BlsPublicKey {
    pub const fn new(bytes: [u8; BLS_PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0; BLS_PUBLIC_KEY_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; BLS_PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, InvalidKeyLength> {
        let bytes: [u8; BLS_PUBLIC_KEY_SIZE] = slice
            .try_into()
            .map_err(|_| InvalidKeyLength(slice.len()))?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid BLS key length: {0}")]
pub struct InvalidKeyLength(pub usize);

impl FromStr for BlsPublicKey {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| "invalid hex string")?;
        Self::from_slice(&bytes).map_err(|_| "invalid public key length")
    }
}

impl Display for BlsPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: SerdeSerializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(SerdeError::custom)
    }
}

impl Serializer for BlsPublicKey {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self(reader.read_array()?))
    }

    fn size(&self) -> usize {
        BLS_PUBLIC_KEY_SIZE
    }
}

/// BLS12-381 signature attached to a deposit. Opaque to the daemon.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct BlsSignature([u8; BLS_SIGNATURE_SIZE]);

impl BlsSignature {
    pub const fn new(bytes: [u8; BLS_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0; BLS_SIGNATURE_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; BLS_SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, InvalidKeyLength> {
        let bytes: [u8; BLS_SIGNATURE_SIZE] = slice
            .try_into()
            .map_err(|_| InvalidKeyLength(slice.len()))?;
        Ok(Self(bytes))
    }
}

impl Display for BlsSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: SerdeSerializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let stripped = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(stripped).map_err(SerdeError::custom)?;
        Self::from_slice(&bytes).map_err(SerdeError::custom)
    }
}

impl Serializer for BlsSignature {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self(reader.read_array()?))
    }

    fn size(&self) -> usize {
        BLS_SIGNATURE_SIZE
    }
}
