use std::cmp::Ordering;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::{
    block::BlockRef,
    crypto::{BlsPublicKey, BlsSignature},
    serializer::{Reader, ReaderError, Serializer, Writer},
};

/// A single `DepositEvent` log emitted by the deposit contract.
///
/// Content-addressable by `(block.hash, log_index)`: for a given pair the
/// event is unique and immutable. Events order by `(block.number, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub pubkey: BlsPublicKey,
    /// Withdrawal credentials the deposit was made with
    pub wc: B256,
    /// Deposit amount in gwei
    pub amount: u64,
    pub signature: BlsSignature,
    pub block: BlockRef,
    pub log_index: u32,
    pub tx_hash: B256,
}

impl DepositEvent {
    /// Identity of the event within the chain history
    pub fn id(&self) -> (B256, u32) {
        (self.block.hash, self.log_index)
    }
}

impl PartialOrd for DepositEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DepositEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.block.number, self.log_index).cmp(&(other.block.number, other.log_index))
    }
}

impl Serializer for DepositEvent {
    fn write(&self, writer: &mut Writer) {
        self.pubkey.write(writer);
        self.wc.write(writer);
        self.amount.write(writer);
        self.signature.write(writer);
        self.block.write(writer);
        self.log_index.write(writer);
        self.tx_hash.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            pubkey: BlsPublicKey::read(reader)?,
            wc: B256::read(reader)?,
            amount: u64::read(reader)?,
            signature: BlsSignature::read(reader)?,
            block: BlockRef::read(reader)?,
            log_index: u32::read(reader)?,
            tx_hash: B256::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.pubkey.size()
            + self.wc.size()
            + self.amount.size()
            + self.signature.size()
            + self.block.size()
            + self.log_index.size()
            + self.tx_hash.size()
    }
}
