use alloy::{rpc::types::Log, sol};
use alloy_primitives::B256;
use alloy_sol_types::SolEvent;
use guardian_common::{
    block::BlockRef,
    crypto::{BlsPublicKey, BlsSignature},
    deposit::DepositEvent,
};
use thiserror::Error;

// The three contracts the daemon talks to, reduced to the members of their
// ABIs the daemon consumes.
sol! {
    /// Compact signature as the security module verifies it on-chain
    struct PauseSignature {
        bytes32 r;
        bytes32 vs;
    }

    #[sol(rpc)]
    interface IDepositContract {
        event DepositEvent(
            bytes pubkey,
            bytes withdrawal_credentials,
            bytes amount,
            bytes signature,
            bytes index
        );

        function get_deposit_root() external view returns (bytes32);
    }

    #[sol(rpc)]
    interface IDepositSecurityModule {
        function ATTEST_MESSAGE_PREFIX() external view returns (bytes32);
        function PAUSE_MESSAGE_PREFIX() external view returns (bytes32);
        function getGuardians() external view returns (address[] memory);
        function getMaxDeposits() external view returns (uint256);
        function pauseDeposits(
            uint256 blockNumber,
            uint256 stakingModuleId,
            PauseSignature memory sig
        ) external;
    }

    #[sol(rpc)]
    interface IStakingRouter {
        function getStakingModuleIds() external view returns (uint256[] memory);
        function getStakingModuleIsActive(uint256 stakingModuleId) external view returns (bool);
        function getStakingModuleNonce(uint256 stakingModuleId) external view returns (uint256);
        function getStakingModuleLastDepositBlock(uint256 stakingModuleId) external view returns (uint256);
        function getWithdrawalCredentials() external view returns (bytes32);
    }
}

#[derive(Debug, Error)]
pub enum LogDecodeError {
    #[error("log is missing block metadata")]
    MissingBlockMeta,
    #[error("abi decoding failed: {0}")]
    Abi(String),
    #[error("unexpected {field} length {len}")]
    FieldLength { field: &'static str, len: usize },
}

// The deposit contract emits amount and index as 8-byte little-endian
// byte strings, not as uint256
fn read_le_u64(field: &'static str, bytes: &[u8]) -> Result<u64, LogDecodeError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| LogDecodeError::FieldLength {
        field,
        len: bytes.len(),
    })?;
    Ok(u64::from_le_bytes(array))
}

/// Decode a raw `DepositEvent` log into the cache's event model
pub fn decode_deposit_log(log: &Log) -> Result<DepositEvent, LogDecodeError> {
    let decoded = IDepositContract::DepositEvent::decode_log_data(log.data())
        .map_err(|e| LogDecodeError::Abi(e.to_string()))?;

    let pubkey = BlsPublicKey::from_slice(&decoded.pubkey).map_err(|e| {
        LogDecodeError::FieldLength {
            field: "pubkey",
            len: e.0,
        }
    })?;
    let signature = BlsSignature::from_slice(&decoded.signature).map_err(|e| {
        LogDecodeError::FieldLength {
            field: "signature",
            len: e.0,
        }
    })?;
    if decoded.withdrawal_credentials.len() != 32 {
        return Err(LogDecodeError::FieldLength {
            field: "withdrawal_credentials",
            len: decoded.withdrawal_credentials.len(),
        });
    }
    let wc = B256::from_slice(&decoded.withdrawal_credentials);
    let amount = read_le_u64("amount", &decoded.amount)?;

    let block_number = log.block_number.ok_or(LogDecodeError::MissingBlockMeta)?;
    let block_hash = log.block_hash.ok_or(LogDecodeError::MissingBlockMeta)?;
    let log_index = log.log_index.ok_or(LogDecodeError::MissingBlockMeta)? as u32;
    let tx_hash = log
        .transaction_hash
        .ok_or(LogDecodeError::MissingBlockMeta)?;

    Ok(DepositEvent {
        pubkey,
        wc,
        amount,
        signature,
        block: BlockRef::new(
            block_number,
            block_hash,
            log.block_timestamp.unwrap_or_default(),
        ),
        log_index,
        tx_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256, Bytes};

    fn raw_log(amount_bytes: Vec<u8>) -> Log {
        let event = IDepositContract::DepositEvent {
            pubkey: Bytes::from(vec![0xaa; 48]),
            withdrawal_credentials: Bytes::from(vec![0x01; 32]),
            amount: Bytes::from(amount_bytes),
            signature: Bytes::from(vec![0xbb; 96]),
            index: Bytes::from(vec![0x00; 8]),
        };
        Log {
            inner: alloy_primitives::Log {
                address: address!("00000000219ab540356cbb839cbe05303d7705fa"),
                data: event.encode_log_data(),
            },
            block_hash: Some(b256!(
                "00000000000000000000000000000000000000000000000000000000000000aa"
            )),
            block_number: Some(11_052_984),
            block_timestamp: Some(1_700_000_000),
            transaction_hash: Some(B256::ZERO),
            transaction_index: Some(0),
            log_index: Some(7),
            removed: false,
        }
    }

    #[test]
    fn decodes_amount_little_endian() {
        // 32 ETH in gwei, 0x0773594000
        let event = decode_deposit_log(&raw_log(32_000_000_000u64.to_le_bytes().to_vec())).unwrap();
        assert_eq!(event.amount, 32_000_000_000);
        assert_eq!(event.block.number, 11_052_984);
        assert_eq!(event.log_index, 7);
        assert_eq!(event.pubkey.as_bytes(), &[0xaa; 48]);
    }

    #[test]
    fn rejects_malformed_amount() {
        let err = decode_deposit_log(&raw_log(vec![0x01; 7])).unwrap_err();
        assert!(matches!(
            err,
            LogDecodeError::FieldLength { field: "amount", .. }
        ));
    }
}
