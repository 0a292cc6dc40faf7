use std::sync::Arc;

use alloy::primitives::TxHash;
use metrics::counter;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CallDescriptor;
use super::GasPolicy;
use super::TxAttempt;
use super::TxSigner;
use crate::chain::ChainClient;
use crate::chain::ChainError;
use crate::chain::TxRequest;
use crate::ContractError;

/// How a submission loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The node accepted this transaction.
    Sent(TxHash),
    /// A replacement bounced with "nonce too low" after the gas price had
    /// already been raised: one of the earlier sends most likely landed.
    LikelyLanded { nonce: u64, candidates: Vec<TxHash> },
}

/// Signs and sends one transaction, replacing it at a higher gas price with
/// the same nonce when sending fails.
#[derive(Clone)]
pub struct TxSubmitter {
    client: Arc<dyn ChainClient>,
    policy: GasPolicy,
}

impl TxSubmitter {
    pub fn new(
        client: Arc<dyn ChainClient>,
        policy: GasPolicy,
    ) -> Self {
        Self { client, policy }
    }

    /// Gas price to start a fresh cycle from.
    pub async fn starting_gas_price(&self) -> Result<u128, ContractError> {
        if self.policy.base_gas_price > 0 {
            return Ok(self.policy.base_gas_price);
        }
        Ok(self.client.gas_price().await?)
    }

    /// Drive `attempt` until the node accepts a transaction or the retry
    /// budget is spent. Escalation reuses the pinned nonce, so at most one of
    /// the transactions sent here can ever be mined.
    pub async fn submit(
        &self,
        signer: &TxSigner,
        call: &CallDescriptor,
        attempt: &mut TxAttempt,
    ) -> Result<SubmitOutcome, ContractError> {
        loop {
            let nonce = match attempt.nonce {
                Some(nonce) => nonce,
                None => {
                    let nonce = self.client.pending_nonce(signer.address()).await?;
                    attempt.nonce = Some(nonce);
                    nonce
                },
            };

            let request = TxRequest {
                from: signer.address(),
                to: call.to,
                input: call.input.clone(),
                value: call.value,
                nonce,
                gas_price: attempt.gas_price,
                gas_limit: self.policy.gas_limit,
            };
            let signed = signer.sign(request).await?;
            attempt.submissions += 1;

            debug!(
                "submitting transaction. method: {} to: {:?} nonce: {} gas_price: {} submission: {}",
                call.method, call.to, nonce, attempt.gas_price, attempt.submissions,
            );
            counter!("mefs_tx_submitted_total", "method" => call.method).increment(1);

            let result = self.client.send_raw_transaction(&signed).await;
            let err = match result {
                Ok(hash) => {
                    info!(
                        "transaction sent. method: {} hash: {} nonce: {}",
                        call.method, hash, nonce
                    );
                    return Ok(SubmitOutcome::Sent(hash));
                },
                Err(ChainError::AlreadyKnown) => {
                    debug!("transaction {} already in the pool", signed.hash);
                    return Ok(SubmitOutcome::Sent(signed.hash));
                },
                Err(ChainError::NonceTooLow) if attempt.escalated() => {
                    warn!(
                        "nonce {} consumed after gas escalation, an earlier submission landed. method: {}",
                        nonce, call.method
                    );
                    return Ok(SubmitOutcome::LikelyLanded {
                        nonce,
                        candidates: attempt.sent.clone(),
                    });
                },
                Err(err @ (ChainError::InsufficientFunds | ChainError::Signing(_))) => {
                    counter!("mefs_tx_failed_total", "reason" => "rejected").increment(1);
                    return Err(err.into());
                },
                Err(err) => err,
            };

            // The node may have accepted it even though we saw an error.
            attempt.sent.push(signed.hash);
            attempt.last_error = Some(err.clone());

            if attempt.submissions > self.policy.max_submit_retries {
                counter!("mefs_tx_failed_total", "reason" => "submit_retries").increment(1);
                return Err(ContractError::RetriesExhausted {
                    operation: "submit transaction",
                    attempts: attempt.submissions,
                    last: err.to_string(),
                });
            }

            if err == ChainError::NonceTooLow {
                // Our nonce was stale before anything of ours went out.
                warn!("nonce {} is stale, refreshing. method: {}", nonce, call.method);
                attempt.nonce = None;
                attempt.sent.clear();
            } else {
                attempt.gas_price = attempt.gas_price.saturating_add(self.policy.price_increment);
                counter!("mefs_tx_escalations_total", "method" => call.method).increment(1);
                warn!(
                    "submission failed, replacing. method: {} nonce: {} next_gas_price: {} error: {}",
                    call.method, nonce, attempt.gas_price, err
                );
            }

            tokio::time::sleep(self.policy.retry_delay()).await;
        }
    }
}
