use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::primitives::Bytes;
use alloy::primitives::U256;
use alloy::sol_types::SolCall;

use crate::chain::ChainClient;
use crate::chain::TxReceipt;
use crate::tx::CallDescriptor;
use crate::tx::GasPolicy;
use crate::tx::Transactor;
use crate::tx::TxSigner;
use crate::ContractError;

/// Handle on one chain: bounded-retry reads and confirmed writes.
///
/// Cheap to clone; clones share the per-key submission locks.
#[derive(Clone)]
pub struct Ledger {
    client: Arc<dyn ChainClient>,
    policy: GasPolicy,
    transactor: Transactor,
}

impl Ledger {
    pub fn new(
        client: Arc<dyn ChainClient>,
        policy: GasPolicy,
    ) -> Self {
        let transactor = Transactor::new(client.clone(), policy.clone());
        Self {
            client,
            policy,
            transactor,
        }
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    pub fn policy(&self) -> &GasPolicy {
        &self.policy
    }

    /// Call a view function, retrying transient node errors.
    pub async fn read<C: SolCall>(
        &self,
        to: Address,
        call: &C,
    ) -> Result<C::Return, ContractError> {
        let input: Bytes = call.abi_encode().into();
        let client = &self.client;
        let data = self
            .policy
            .read_policy()
            .retry(C::SIGNATURE, move || {
                let input = input.clone();
                async move { Ok(client.call(None, to, input).await?) }
            })
            .await?;

        C::abi_decode_returns(&data, true).map_err(|e| {
            ContractError::Decode {
                method: C::SIGNATURE,
                reason: e.to_string(),
            }
        })
    }

    pub async fn transact(
        &self,
        signer: &TxSigner,
        call: CallDescriptor,
    ) -> Result<TxReceipt, ContractError> {
        self.transactor.transact(signer, call).await
    }

    /// See [`Transactor::transact_with`].
    pub async fn transact_with<F, Fut>(
        &self,
        signer: &TxSigner,
        build: F,
    ) -> Result<TxReceipt, ContractError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<CallDescriptor, ContractError>>,
    {
        self.transactor.transact_with(signer, build).await
    }

    /// Deploy and return the new contract's address.
    pub async fn deploy(
        &self,
        signer: &TxSigner,
        call: CallDescriptor,
    ) -> Result<Address, ContractError> {
        let receipt = self.transact(signer, call).await?;
        receipt
            .contract_address
            .ok_or(ContractError::NoContractAddress(receipt.hash))
    }

    pub async fn now(&self) -> Result<u64, ContractError> {
        let client = &self.client;
        self.policy
            .read_policy()
            .retry("latest timestamp", move || {
                async move { Ok(client.latest_timestamp().await?) }
            })
            .await
    }

    pub async fn balance(
        &self,
        account: Address,
    ) -> Result<U256, ContractError> {
        let client = &self.client;
        self.policy
            .read_policy()
            .retry("balance", move || {
                async move { Ok(client.balance(account).await?) }
            })
            .await
    }

    /// Whether `account` holds live contract code.
    pub async fn has_code(
        &self,
        account: Address,
    ) -> Result<bool, ContractError> {
        let client = &self.client;
        let code = self
            .policy
            .read_policy()
            .retry("code", move || {
                async move { Ok(client.code_at(account).await?) }
            })
            .await?;
        Ok(!code.is_empty())
    }
}

/// Abandon `operation` once `deadline` elapses. Dropping the future stops
/// whatever retry loop or sleep it was in.
pub async fn with_deadline<T, E, Fut>(
    deadline: Duration,
    operation: Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<ContractError>,
{
    tokio::time::timeout(deadline, operation)
        .await
        .map_err(|_| E::from(ContractError::Cancelled))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::Indexer;
    use crate::chain::SimulatedChain;

    #[tokio::test(start_paused = true)]
    async fn test_read_survives_flaky_node() {
        let chain = Arc::new(SimulatedChain::new());
        let indexer = chain.install_indexer();
        chain.fail_reads(3);

        let ledger = Ledger::new(chain.clone(), GasPolicy::default());
        let entry = ledger
            .read(
                indexer,
                &Indexer::getCall {
                    key: "keeper".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(entry.addr, Address::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_gives_up() {
        let chain = Arc::new(SimulatedChain::new());
        let indexer = chain.install_indexer();
        chain.fail_reads(100);

        let policy = GasPolicy {
            max_read_retries: 3,
            ..GasPolicy::default()
        };
        let ledger = Ledger::new(chain.clone(), policy);
        let result = ledger
            .read(
                indexer,
                &Indexer::getCall {
                    key: "keeper".to_string(),
                },
            )
            .await;

        assert!(matches!(
            result,
            Err(ContractError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_retry_loop() {
        let chain = Arc::new(SimulatedChain::new());
        let indexer = chain.install_indexer();
        chain.fail_reads(u32::MAX);

        let ledger = Ledger::new(chain.clone(), GasPolicy::default());
        let result = with_deadline(
            Duration::from_secs(2),
            ledger.read(
                indexer,
                &Indexer::getCall {
                    key: "keeper".to_string(),
                },
            ),
        )
        .await;

        assert!(matches!(result, Err(ContractError::Cancelled)));
    }
}
