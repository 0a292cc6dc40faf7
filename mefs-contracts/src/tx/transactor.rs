use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tracing::info;
use tracing::warn;

use super::CallDescriptor;
use super::GasPolicy;
use super::KeyLocks;
use super::ReceiptWaiter;
use super::SubmitOutcome;
use super::TxAttempt;
use super::TxSigner;
use super::TxSubmitter;
use crate::chain::ChainClient;
use crate::chain::TxReceipt;
use crate::ContractError;

enum TxState {
    Building,
    Submitting(CallDescriptor),
    Confirming(CallDescriptor, SubmitOutcome),
    Succeeded(TxReceipt),
    Failed(ContractError),
}

/// Runs one logical transaction to a confirmed receipt:
/// build, submit, confirm, and start over with a higher gas price when the
/// mined transaction failed.
#[derive(Clone)]
pub struct Transactor {
    submitter: TxSubmitter,
    waiter: ReceiptWaiter,
    policy: GasPolicy,
    locks: KeyLocks,
}

impl Transactor {
    pub fn new(
        client: Arc<dyn ChainClient>,
        policy: GasPolicy,
    ) -> Self {
        Self {
            submitter: TxSubmitter::new(client.clone(), policy.clone()),
            waiter: ReceiptWaiter::new(client, policy.clone()),
            policy,
            locks: KeyLocks::default(),
        }
    }

    pub fn policy(&self) -> &GasPolicy {
        &self.policy
    }

    /// Send a fixed call.
    pub async fn transact(
        &self,
        signer: &TxSigner,
        call: CallDescriptor,
    ) -> Result<TxReceipt, ContractError> {
        self.transact_with(signer, move || {
            let call = call.clone();
            async move { Ok(call) }
        })
        .await
    }

    /// Send a call rebuilt at the start of every cycle, so preconditions and
    /// prices are read fresh after a failed attempt. An error from `build`
    /// ends the operation without sending anything.
    pub async fn transact_with<F, Fut>(
        &self,
        signer: &TxSigner,
        mut build: F,
    ) -> Result<TxReceipt, ContractError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CallDescriptor, ContractError>>,
    {
        let _guard = self.locks.acquire(signer.address()).await;

        let mut cycles = 0;
        let mut gas_price = None;
        let mut state = TxState::Building;
        loop {
            state = match state {
                TxState::Building => {
                    match build().await {
                        Ok(call) => TxState::Submitting(call),
                        Err(err) => TxState::Failed(err),
                    }
                },
                TxState::Submitting(call) => {
                    let price = match gas_price {
                        Some(price) => Ok(price),
                        None => self.submitter.starting_gas_price().await,
                    };
                    match price {
                        Ok(price) => {
                            let mut attempt = TxAttempt::new(price);
                            match self.submitter.submit(signer, &call, &mut attempt).await {
                                Ok(outcome) => {
                                    gas_price = Some(attempt.gas_price);
                                    TxState::Confirming(call, outcome)
                                },
                                Err(err) => TxState::Failed(err),
                            }
                        },
                        Err(err) => TxState::Failed(err),
                    }
                },
                TxState::Confirming(call, outcome) => {
                    match self.waiter.confirm_outcome(&outcome).await {
                        Ok(receipt) => TxState::Succeeded(receipt),
                        Err(ContractError::TxFail(hash)) => {
                            cycles += 1;
                            if cycles > self.policy.max_tx_fail_retries {
                                TxState::Failed(ContractError::RetriesExhausted {
                                    operation: call.method,
                                    attempts: cycles,
                                    last: format!("transaction {hash} failed on chain"),
                                })
                            } else {
                                warn!(
                                    "transaction failed on chain, starting over. method: {} hash: {} cycle: {}/{}",
                                    call.method, hash, cycles, self.policy.max_tx_fail_retries
                                );
                                gas_price = gas_price
                                    .map(|price| price.saturating_add(self.policy.price_increment));
                                tokio::time::sleep(self.policy.retry_delay()).await;
                                TxState::Building
                            }
                        },
                        Err(err) => TxState::Failed(err),
                    }
                },
                TxState::Succeeded(receipt) => {
                    info!(
                        "transaction succeeded. hash: {} block: {} signer: {}",
                        receipt.hash,
                        receipt.block_number,
                        signer.address()
                    );
                    return Ok(receipt);
                },
                TxState::Failed(err) => {
                    counter!("mefs_tx_operations_failed_total").increment(1);
                    return Err(err);
                },
            };
        }
    }
}
