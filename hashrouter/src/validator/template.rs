//! Block header templates and the messages that carry them.

use std::str::FromStr;

use bitcoin::block::{Header as BlockHeader, Version};
use bitcoin::hash_types::{BlockHash, TxMerkleNode};
use bitcoin::pow::{CompactTarget, Target};
use serde::{Deserialize, Serialize};

use super::ShareError;

/// Everything in a block header except the nonce.
///
/// Supplied by the chain-tip tracker and replaced wholesale whenever a new
/// block template arrives. The timestamp here is the template's own; shares
/// carry their own `ntime`, which takes its place when hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeaderTemplate {
    pub version: Version,
    pub prev_blockhash: BlockHash,
    pub merkle_root: TxMerkleNode,
    pub time: u32,
    pub bits: CompactTarget,
}

impl BlockHeaderTemplate {
    /// Get the network difficulty target encoded in the template.
    pub fn target(&self) -> Target {
        Target::from_compact(self.bits)
    }

    /// Complete the header with a submitted nonce and timestamp.
    pub fn header(&self, nonce: u32, time: u32) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_blockhash: self.prev_blockhash,
            merkle_root: self.merkle_root,
            time,
            bits: self.bits,
            nonce,
        }
    }

    /// Double SHA-256 of the completed header.
    pub fn block_hash(&self, nonce: u32, time: u32) -> BlockHash {
        self.header(nonce, time).block_hash()
    }
}

/// Block template update as delivered by the template feed.
///
/// All fields are hex strings: `version`, `time` and `bits` are big-endian
/// numbers with an optional `0x` prefix; the hashes are in the usual
/// byte-reversed display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTemplateUpdate {
    pub version: String,
    pub previous_block_hash: String,
    pub merkle_root: String,
    pub time: String,
    pub bits: String,
}

impl TryFrom<&BlockTemplateUpdate> for BlockHeaderTemplate {
    type Error = ShareError;

    fn try_from(update: &BlockTemplateUpdate) -> Result<Self, Self::Error> {
        let malformed = |field: &str, e: &dyn std::fmt::Display| {
            ShareError::MalformedTemplate(format!("{field}: {e}"))
        };

        Ok(Self {
            version: Version::from_consensus(
                parse_hex_u32(&update.version).map_err(|e| malformed("version", &e))? as i32,
            ),
            prev_blockhash: BlockHash::from_str(&update.previous_block_hash)
                .map_err(|e| malformed("previousBlockHash", &e))?,
            merkle_root: TxMerkleNode::from_str(&update.merkle_root)
                .map_err(|e| malformed("merkleRoot", &e))?,
            time: parse_hex_u32(&update.time).map_err(|e| malformed("time", &e))?,
            bits: CompactTarget::from_consensus(
                parse_hex_u32(&update.bits).map_err(|e| malformed("bits", &e))?,
            ),
        })
    }
}

/// Request to start validating shares for a new contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewValidatorRequest {
    pub template: BlockTemplateUpdate,
    /// Share difficulty as compact bits; defaults to the template's bits.
    #[serde(default)]
    pub difficulty: Option<String>,
    /// Contracted rate in hashes per second.
    pub hash_rate: u64,
    /// Number of accepted shares after which the contract is fulfilled.
    /// Zero means unlimited.
    pub limit: u64,
    /// Pool user the hashrate is being allocated to.
    pub pool_user: String,
}

/// Parse a big-endian hex number, with or without a `0x` prefix.
pub(crate) fn parse_hex_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16)
}
