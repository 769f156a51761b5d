//! Independent validation of submitted shares.
//!
//! A [`ShareValidator`] tracks one hashrate contract. For every share the
//! miner submits while the contract's destination is active, it rebuilds the
//! block header from the current template plus the submitted nonce and
//! timestamp, hashes it, and compares the result to the contract's share
//! target. Accepted shares drive the delivered-hashrate estimate and the
//! contract limit.
//!
//! All comparisons happen on 256-bit integers; a hash is read as a
//! little-endian number exactly as Bitcoin consensus does.

mod registry;
mod template;

use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};
use ruint::aliases::U256;
use thiserror::Error;
use tokio::time::Instant;

use crate::types::HashRate;

pub use registry::{ShareValidators, ValidatorEvent, ValidatorSnapshot};
pub use template::{BlockHeaderTemplate, BlockTemplateUpdate, NewValidatorRequest};

/// Reasons a share is not counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShareError {
    /// The submitting worker is not the pool user the contract pays for.
    #[error("hashrate hijacking suspected: unexpected pool user {credential}")]
    CredentialMismatch { credential: String },

    /// The nonce or timestamp could not be turned into a header.
    #[error("cannot compute share hash: {0}")]
    HashComputation(String),

    /// The contract already reached its limit.
    #[error("contract hash limit already reached")]
    ContractClosed,

    #[error("malformed block template: {0}")]
    MalformedTemplate(String),
}

/// Result of checking one share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareOutcome {
    /// Hash meets the share target.
    pub accepted: bool,
    /// This share brought the contract to its limit; the caller should
    /// start the closeout.
    pub limit_reached: bool,
    pub hash: BlockHash,
}

/// Share validation and hashrate accounting for one contract.
#[derive(Debug)]
pub struct ShareValidator {
    template: BlockHeaderTemplate,
    started_at: Instant,
    hashes_analyzed: u64,
    target: Target,
    contract_hash_rate: HashRate,
    hash_limit: u64,
    pool_credential: String,
    closed: bool,
}

impl ShareValidator {
    /// Create a validator whose share target is the compact `difficulty`.
    ///
    /// `hash_limit` counts accepted shares; zero means unlimited.
    pub fn new(
        template: BlockHeaderTemplate,
        difficulty: CompactTarget,
        contract_hash_rate: HashRate,
        hash_limit: u64,
        pool_credential: impl Into<String>,
    ) -> Self {
        Self {
            template,
            started_at: Instant::now(),
            hashes_analyzed: 0,
            target: Target::from_compact(difficulty),
            contract_hash_rate,
            hash_limit,
            pool_credential: pool_credential.into(),
            closed: false,
        }
    }

    /// Build a validator from a contract start request.
    pub fn from_request(request: &NewValidatorRequest) -> Result<Self, ShareError> {
        let template = BlockHeaderTemplate::try_from(&request.template)?;
        let difficulty = match &request.difficulty {
            Some(bits) => CompactTarget::from_consensus(
                template::parse_hex_u32(bits)
                    .map_err(|e| ShareError::MalformedTemplate(format!("difficulty: {e}")))?,
            ),
            None => template.bits,
        };

        Ok(Self::new(
            template,
            difficulty,
            HashRate::from_hashes_per_second(request.hash_rate),
            request.limit,
            request.pool_user.clone(),
        ))
    }

    /// Check a submitted share.
    ///
    /// `nonce` and `time` are hex strings as they appear in `mining.submit`.
    /// Counters change only when the share is accepted.
    pub fn submit_share(
        &mut self,
        credential: &str,
        nonce: &str,
        time: &str,
    ) -> Result<ShareOutcome, ShareError> {
        if self.closed {
            return Err(ShareError::ContractClosed);
        }
        if credential != self.pool_credential {
            return Err(ShareError::CredentialMismatch {
                credential: credential.to_string(),
            });
        }

        let nonce = template::parse_hex_u32(nonce)
            .map_err(|e| ShareError::HashComputation(format!("nonce {nonce:?}: {e}")))?;
        let time = template::parse_hex_u32(time)
            .map_err(|e| ShareError::HashComputation(format!("time {time:?}: {e}")))?;

        let hash = self.template.block_hash(nonce, time);
        let accepted = Target::from_le_bytes(hash.to_byte_array()) <= self.target;
        if accepted {
            self.hashes_analyzed += 1;
        }

        let limit_reached = self.hash_limit > 0 && self.hashes_analyzed >= self.hash_limit;
        if limit_reached {
            self.closed = true;
        }

        Ok(ShareOutcome {
            accepted,
            limit_reached,
            hash,
        })
    }

    /// Estimate delivered hashrate from accepted shares.
    ///
    /// Each accepted share stands for roughly `2^exponent` hash attempts,
    /// where `exponent` is [`Self::difficulty_exponent`]. The estimate is
    /// that work, times the shares accepted, over whole seconds elapsed
    /// since the validator started. Returns zero until a full second has
    /// passed.
    pub fn estimate_hashrate(&self) -> HashRate {
        let elapsed = self.started_at.elapsed().as_secs();
        if elapsed == 0 {
            return HashRate::ZERO;
        }

        let per_share = U256::from(1u8) << self.difficulty_exponent();
        let total = per_share.saturating_mul(U256::from(self.hashes_analyzed));
        let rate = total / U256::from(elapsed);
        HashRate::from_hashes_per_second(u64::try_from(rate).unwrap_or(u64::MAX))
    }

    /// Number of leading zero bits the share target demands of a hash.
    pub fn difficulty_exponent(&self) -> usize {
        U256::from_le_bytes(self.target.to_le_bytes()).leading_zeros()
    }

    /// Swap in a new block template. Counters carry over.
    pub fn update_block_header_template(&mut self, template: BlockHeaderTemplate) {
        self.template = template;
    }

    pub fn template(&self) -> &BlockHeaderTemplate {
        &self.template
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn hashes_analyzed(&self) -> u64 {
        self.hashes_analyzed
    }

    pub fn contract_hash_rate(&self) -> HashRate {
        self.contract_hash_rate
    }

    pub fn hash_limit(&self) -> u64 {
        self.hash_limit
    }

    pub fn pool_credential(&self) -> &str {
        &self.pool_credential
    }

    /// Whether the contract limit has been reached.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
