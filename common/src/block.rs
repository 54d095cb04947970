use std::fmt::{self, Display, Formatter};

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

/// Canonical reference to an EL block. Immutable once produced; every
/// cached artifact is tagged with one so reorgs are detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
}

impl BlockRef {
    pub fn new(number: u64, hash: B256, timestamp: u64) -> Self {
        Self {
            number,
            hash,
            timestamp,
        }
    }
}

impl Display for BlockRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

impl Serializer for BlockRef {
    fn write(&self, writer: &mut Writer) {
        self.number.write(writer);
        self.hash.write(writer);
        self.timestamp.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            number: u64::read(reader)?,
            hash: B256::read(reader)?,
            timestamp: u64::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.number.size() + self.hash.size() + self.timestamp.size()
    }
}
