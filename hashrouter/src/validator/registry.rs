//! Registry of active share validators, keyed by contract identity.
//!
//! The relay identifies a contract by the pool user of the destination that
//! is active when a share arrives. Each validator sits behind its own lock so
//! that sessions submitting for different contracts never contend.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{
    BlockHeaderTemplate, BlockTemplateUpdate, NewValidatorRequest, ShareError, ShareOutcome,
    ShareValidator,
};
use crate::stratum_v1::SubmitParams;
use crate::tracing::prelude::*;
use crate::types::HashRate;

/// Events for the component that manages contracts on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatorEvent {
    /// The contract delivered its allocated shares and should be closed out.
    ContractClosed {
        contract: String,
        hashes_analyzed: u64,
        hash_limit: u64,
    },
}

/// Point-in-time view of one validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSnapshot {
    pub hashes_analyzed: u64,
    pub estimated_hash_rate: HashRate,
    pub contract_hash_rate: HashRate,
    pub closed: bool,
}

/// Shared, cloneable registry of validators.
#[derive(Clone)]
pub struct ShareValidators {
    validators: Arc<RwLock<HashMap<String, Arc<Mutex<ShareValidator>>>>>,
    events: mpsc::UnboundedSender<ValidatorEvent>,
}

impl ShareValidators {
    /// Create an empty registry and the receiving end of its event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ValidatorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let registry = Self {
            validators: Arc::new(RwLock::new(HashMap::new())),
            events,
        };
        (registry, rx)
    }

    /// Start tracking a contract, replacing any validator it already had.
    pub fn insert(&self, contract: impl Into<String>, validator: ShareValidator) {
        let contract = contract.into();
        debug!(
            contract = %contract,
            limit = validator.hash_limit(),
            rate = %validator.contract_hash_rate(),
            "Registering share validator"
        );
        self.validators
            .write()
            .insert(contract, Arc::new(Mutex::new(validator)));
    }

    /// Start tracking the contract described by `request`, keyed by its
    /// pool user.
    pub fn create(&self, request: &NewValidatorRequest) -> Result<(), ShareError> {
        let validator = ShareValidator::from_request(request)?;
        self.insert(request.pool_user.clone(), validator);
        Ok(())
    }

    /// Stop tracking a contract. Returns whether it was tracked.
    pub fn remove(&self, contract: &str) -> bool {
        self.validators.write().remove(contract).is_some()
    }

    pub fn contains(&self, contract: &str) -> bool {
        self.validators.read().contains_key(contract)
    }

    /// Check a share against the contract's validator.
    ///
    /// Returns `None` when no validator is registered for `contract`. When
    /// the share brings the contract to its limit, a
    /// [`ValidatorEvent::ContractClosed`] is emitted.
    pub fn submit(
        &self,
        contract: &str,
        submit: &SubmitParams,
    ) -> Option<Result<ShareOutcome, ShareError>> {
        let validator = self.validators.read().get(contract).cloned()?;
        let mut validator = validator.lock();

        let result = validator.submit_share(&submit.worker_name, &submit.nonce, &submit.ntime);
        if let Ok(outcome) = &result {
            trace!(
                contract,
                job_id = %submit.job_id,
                accepted = outcome.accepted,
                hash = %outcome.hash,
                "Checked share"
            );
            if outcome.limit_reached {
                info!(
                    contract,
                    shares = validator.hashes_analyzed(),
                    estimated = %validator.estimate_hashrate(),
                    "Contract hash limit reached"
                );
                // Nobody listening means nobody can close the contract; the
                // validator stays closed either way.
                let _ = self.events.send(ValidatorEvent::ContractClosed {
                    contract: contract.to_string(),
                    hashes_analyzed: validator.hashes_analyzed(),
                    hash_limit: validator.hash_limit(),
                });
            }
        }

        Some(result)
    }

    /// Apply a new block template to every validator.
    ///
    /// Returns how many validators were updated.
    pub fn update_template(&self, update: &BlockTemplateUpdate) -> Result<usize, ShareError> {
        let template = BlockHeaderTemplate::try_from(update)?;
        let validators = self.validators.read();
        for validator in validators.values() {
            validator.lock().update_block_header_template(template);
        }
        debug!(
            prev_blockhash = %template.prev_blockhash,
            validators = validators.len(),
            "Applied new block template"
        );
        Ok(validators.len())
    }

    pub fn snapshot(&self, contract: &str) -> Option<ValidatorSnapshot> {
        let validator = self.validators.read().get(contract).cloned()?;
        let validator = validator.lock();
        Some(ValidatorSnapshot {
            hashes_analyzed: validator.hashes_analyzed(),
            estimated_hash_rate: validator.estimate_hashrate(),
            contract_hash_rate: validator.contract_hash_rate(),
            closed: validator.is_closed(),
        })
    }
}
