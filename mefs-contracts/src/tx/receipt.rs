use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::TxHash;
use metrics::counter;
use metrics::histogram;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::GasPolicy;
use super::SubmitOutcome;
use crate::chain::ChainClient;
use crate::chain::TxReceipt;
use crate::ContractError;

/// Polls for receipts and classifies the outcome.
#[derive(Clone)]
pub struct ReceiptWaiter {
    client: Arc<dyn ChainClient>,
    policy: GasPolicy,
}

impl ReceiptWaiter {
    pub fn new(
        client: Arc<dyn ChainClient>,
        policy: GasPolicy,
    ) -> Self {
        Self { client, policy }
    }

    /// Wait until `hash` is mined.
    ///
    /// A failed receipt is [`ContractError::TxFail`]: the caller decides
    /// whether to run another cycle.
    pub async fn confirm(
        &self,
        hash: TxHash,
    ) -> Result<TxReceipt, ContractError> {
        self.confirm_any(&[hash]).await?.ok_or_else(|| {
            counter!("mefs_tx_failed_total", "reason" => "confirm_retries").increment(1);
            ContractError::RetriesExhausted {
                operation: "confirm transaction",
                attempts: self.policy.max_confirm_retries.max(1),
                last: format!("no receipt for {hash}"),
            }
        })
    }

    /// Confirm whatever a submission loop ended with.
    pub async fn confirm_outcome(
        &self,
        outcome: &SubmitOutcome,
    ) -> Result<TxReceipt, ContractError> {
        match outcome {
            SubmitOutcome::Sent(hash) => self.confirm(*hash).await,
            SubmitOutcome::LikelyLanded { nonce, candidates } => {
                match self.confirm_any(candidates).await? {
                    Some(receipt) => Ok(receipt),
                    None => {
                        counter!("mefs_tx_failed_total", "reason" => "unconfirmed").increment(1);
                        Err(ContractError::Unconfirmed { nonce: *nonce })
                    },
                }
            },
        }
    }

    /// Poll every hash in `candidates` until one of them is mined. They all
    /// share a nonce, so at most one can be.
    ///
    /// `Ok(None)` once the poll budget is spent without a receipt.
    pub async fn confirm_any(
        &self,
        candidates: &[TxHash],
    ) -> Result<Option<TxReceipt>, ContractError> {
        if candidates.is_empty() {
            return Ok(None);
        }

        let started = Instant::now();
        let polls = self.policy.max_confirm_retries.max(1);
        for poll in 1..=polls {
            for hash in candidates {
                match self.client.transaction_receipt(*hash).await {
                    Ok(Some(receipt)) if receipt.success => {
                        histogram!("mefs_tx_confirm_duration_seconds")
                            .record(started.elapsed().as_secs_f64());
                        info!(
                            "transaction confirmed. hash: {} block: {}",
                            hash, receipt.block_number
                        );
                        return Ok(Some(receipt));
                    },
                    Ok(Some(_)) => {
                        counter!("mefs_tx_failed_total", "reason" => "reverted").increment(1);
                        warn!("transaction {} mined with failure status", hash);
                        return Err(ContractError::TxFail(*hash));
                    },
                    Ok(None) => {},
                    Err(err) if err.is_transient() => {
                        warn!("receipt lookup failed. hash: {} error: {}", hash, err);
                    },
                    Err(err) => return Err(err.into()),
                }
            }

            debug!(
                "no receipt yet. candidates: {} poll: {}/{}",
                candidates.len(),
                poll,
                polls
            );
            if poll < polls {
                tokio::time::sleep(self.policy.poll_interval()).await;
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::Address;
    use alloy::primitives::Bytes;
    use alloy::primitives::U256;
    use alloy::signers::local::PrivateKeySigner;

    use super::*;
    use crate::chain::SimulatedChain;
    use crate::tx::CallDescriptor;
    use crate::tx::TxAttempt;
    use crate::tx::TxSigner;
    use crate::tx::TxSubmitter;

    async fn send(
        chain: &Arc<SimulatedChain>,
        policy: &GasPolicy,
    ) -> TxHash {
        let signer = TxSigner::new(PrivateKeySigner::random(), chain.chain_id_value());
        chain.fund(signer.address(), U256::from(1_000u64));
        let submitter = TxSubmitter::new(chain.clone(), policy.clone());
        let call = CallDescriptor {
            method: "transfer",
            to: Some(Address::ZERO),
            input: Bytes::new(),
            value: U256::from(1u64),
        };
        match submitter
            .submit(&signer, &call, &mut TxAttempt::new(policy.base_gas_price))
            .await
            .unwrap()
        {
            SubmitOutcome::Sent(hash) => hash,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_waits_for_receipt() {
        let chain = Arc::new(SimulatedChain::new());
        let policy = GasPolicy::default();
        chain.delay_receipts(3);
        let hash = send(&chain, &policy).await;

        let waiter = ReceiptWaiter::new(chain.clone(), policy);
        let receipt = waiter.confirm(hash).await.unwrap();

        assert!(receipt.success);
        assert_eq!(receipt.hash, hash);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverted_receipt_is_tx_fail() {
        let chain = Arc::new(SimulatedChain::new());
        let policy = GasPolicy::default();
        chain.revert_next(1);
        let hash = send(&chain, &policy).await;

        let waiter = ReceiptWaiter::new(chain.clone(), policy);
        assert!(matches!(
            waiter.confirm(hash).await,
            Err(ContractError::TxFail(h)) if h == hash
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_is_bounded() {
        let chain = Arc::new(SimulatedChain::new());
        let policy = GasPolicy {
            max_confirm_retries: 4,
            ..GasPolicy::default()
        };
        let waiter = ReceiptWaiter::new(chain.clone(), policy);

        assert!(matches!(
            waiter.confirm(TxHash::repeat_byte(9)).await,
            Err(ContractError::RetriesExhausted { attempts: 4, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_likely_landed_without_receipt_is_unconfirmed() {
        let chain = Arc::new(SimulatedChain::new());
        let policy = GasPolicy {
            max_confirm_retries: 2,
            ..GasPolicy::default()
        };
        let waiter = ReceiptWaiter::new(chain.clone(), policy);
        let outcome = SubmitOutcome::LikelyLanded {
            nonce: 3,
            candidates: vec![TxHash::repeat_byte(1)],
        };

        assert!(matches!(
            waiter.confirm_outcome(&outcome).await,
            Err(ContractError::Unconfirmed { nonce: 3 })
        ));
    }
}
