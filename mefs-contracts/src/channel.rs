//! Payment channels: a payer deposits into a channel contract, hands the
//! payee signed vouchers off-chain, and the payee cashes the best one in.
//! If the payee never does, the payer reclaims the deposit some time after
//! expiry.

use alloy::primitives::Address;
use alloy::primitives::U256;
use alloy::sol_types::SolConstructor;
use mefs_auth::PaymentVoucher;
use mefs_auth::SignatureError;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::bindings::Channel;
use crate::chain::TxReceipt;
use crate::directory::CHANNEL_KEY;
use crate::tx::CallDescriptor;
use crate::tx::TxSigner;
use crate::ContractError;
use crate::DirectoryResolver;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelState {
    pub address: Address,
    pub payer: Address,
    pub payee: Address,
    pub balance: U256,
    /// Unix seconds after which the payer may reclaim the balance.
    pub expiry: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SettlementAction {
    Close,
    Timeout,
    Wait,
}

/// Which side of a channel a settling account is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ChannelRole {
    Payer,
    Payee,
    Other,
}

impl ChannelState {
    pub fn role_of(
        &self,
        account: Address,
    ) -> ChannelRole {
        if account == self.payee {
            ChannelRole::Payee
        } else if account == self.payer {
            ChannelRole::Payer
        } else {
            ChannelRole::Other
        }
    }
}

/// What `caller` should do with a live channel at `now`.
///
/// The contract accepts the payee's close for as long as the channel exists,
/// so a payee holding a voucher always closes, even past expiry. The payer
/// leaves the payee `margin` seconds after expiry before reclaiming the
/// deposit. Anyone else, including a payee with nothing to cash in, may time
/// the channel out once it has expired.
pub fn decide(
    state: &ChannelState,
    caller: Address,
    now: u64,
    voucher: Option<&PaymentVoucher>,
    margin: u64,
) -> SettlementAction {
    let expired = now >= state.expiry;
    match (state.role_of(caller), voucher) {
        (ChannelRole::Payee, Some(_)) => SettlementAction::Close,
        (ChannelRole::Payer, _) if now >= state.expiry.saturating_add(margin) => {
            SettlementAction::Timeout
        },
        (ChannelRole::Payer, _) => SettlementAction::Wait,
        _ if expired => SettlementAction::Timeout,
        _ => SettlementAction::Wait,
    }
}

#[derive(Clone)]
pub struct PaymentChannels {
    directory: DirectoryResolver,
}

impl PaymentChannels {
    pub fn new(directory: DirectoryResolver) -> Self {
        Self { directory }
    }

    /// Open a channel to `payee` unless the payer already has a live one.
    pub async fn open(
        &self,
        payer: &TxSigner,
        payee: Address,
        duration: u64,
        deposit: U256,
    ) -> Result<Address, ContractError> {
        match self.find(payer.address(), payee).await {
            Ok(channel) => {
                info!("reusing channel {} from {} to {}", channel, payer.address(), payee);
                return Ok(channel);
            },
            Err(ContractError::NotDeployedChannel { .. }) => {},
            Err(err) => return Err(err),
        }
        if deposit.is_zero() {
            return Err(ContractError::InsufficientDeposit {
                deposit,
                required: U256::from(1u8),
            });
        }
        self.directory.prepare_publish(CHANNEL_KEY, payer).await?;

        let args = Channel::constructorCall {
            payee,
            duration: U256::from(duration),
        }
        .abi_encode();
        let call = CallDescriptor::deploy("Channel", &self.directory.artifacts().channel, args)
            .with_value(deposit);
        let channel = self.directory.ledger().deploy(payer, call).await?;
        self.directory.publish(CHANNEL_KEY, payer, channel).await?;

        info!(
            "opened channel {} from {} to {}. deposit: {} duration: {}s",
            channel,
            payer.address(),
            payee,
            deposit,
            duration
        );
        Ok(channel)
    }

    /// The payer's most recent live channel to `payee`.
    pub async fn find(
        &self,
        payer: Address,
        payee: Address,
    ) -> Result<Address, ContractError> {
        let history = match self.directory.history(CHANNEL_KEY, payer).await {
            Ok(history) => history,
            Err(err) if err.is_not_deployed() => {
                return Err(ContractError::NotDeployedChannel { payer, payee });
            },
            Err(err) => return Err(err),
        };

        for channel in history.into_iter().rev() {
            if !self.directory.ledger().has_code(channel).await? {
                debug!("skipping settled channel {}", channel);
                continue;
            }
            if self.state(channel).await?.payee == payee {
                return Ok(channel);
            }
        }
        Err(ContractError::NotDeployedChannel { payer, payee })
    }

    pub async fn state(
        &self,
        channel: Address,
    ) -> Result<ChannelState, ContractError> {
        let ledger = self.directory.ledger();
        if !ledger.has_code(channel).await? {
            return Err(ContractError::ChannelClosed(channel));
        }
        let info = ledger.read(channel, &Channel::getInfoCall {}).await?;
        Ok(ChannelState {
            address: channel,
            payer: info.payer,
            payee: info.payee,
            balance: info.balance,
            expiry: info.expiry.saturating_to(),
        })
    }

    /// Check a received voucher before trusting it: the right channel, the
    /// payer's signature, and covered by the balance.
    pub async fn verify_voucher(
        &self,
        channel: Address,
        voucher: &PaymentVoucher,
    ) -> Result<ChannelState, ContractError> {
        if voucher.channel != channel {
            return Err(SignatureError::WrongChannel {
                got: voucher.channel,
                expected: channel,
            }
            .into());
        }
        let state = self.state(channel).await?;
        voucher.verify(state.payer)?;
        if voucher.value > state.balance {
            return Err(ContractError::VoucherExceedsBalance {
                value: voucher.value,
                balance: state.balance,
            });
        }
        Ok(state)
    }

    /// Cash `voucher` in. Only the payee may.
    pub async fn close(
        &self,
        payee: &TxSigner,
        voucher: &PaymentVoucher,
    ) -> Result<TxReceipt, ContractError> {
        let channel = voucher.channel;
        let receipt = self
            .directory
            .ledger()
            .transact_with(payee, || {
                async move {
                    let state = self.verify_voucher(channel, voucher).await?;
                    if state.payee != payee.address() {
                        return Err(ContractError::NotPayee {
                            channel,
                            caller: payee.address(),
                            payee: state.payee,
                        });
                    }
                    Ok(CallDescriptor::call(
                        channel,
                        &Channel::closeChannelCall {
                            value: voucher.value,
                            sig: voucher.signature.clone(),
                        },
                    ))
                }
            })
            .await?;

        info!("closed channel {} for {}", channel, voucher.value);
        Ok(receipt)
    }

    /// Return the whole balance to the payer once the channel expired.
    pub async fn timeout(
        &self,
        signer: &TxSigner,
        channel: Address,
    ) -> Result<TxReceipt, ContractError> {
        let ledger = self.directory.ledger();
        let receipt = ledger
            .transact_with(signer, || {
                async move {
                    let state = self.state(channel).await?;
                    let now = ledger.now().await?;
                    if now < state.expiry {
                        return Err(ContractError::ChannelNotExpired {
                            channel,
                            expiry: state.expiry,
                            now,
                        });
                    }
                    Ok(CallDescriptor::call(channel, &Channel::channelTimeoutCall {}))
                }
            })
            .await?;

        info!("timed out channel {}", channel);
        Ok(receipt)
    }

    /// Decide what to do with `channel` now and do it.
    pub async fn settle(
        &self,
        signer: &TxSigner,
        channel: Address,
        voucher: Option<&PaymentVoucher>,
        margin: u64,
    ) -> Result<SettlementAction, ContractError> {
        let state = self.state(channel).await?;
        let now = self.directory.ledger().now().await?;
        let action = decide(&state, signer.address(), now, voucher, margin);

        match (action, voucher) {
            (SettlementAction::Close, Some(voucher)) => {
                self.close(signer, voucher).await?;
            },
            (SettlementAction::Timeout, _) => {
                self.timeout(signer, channel).await?;
            },
            _ => {
                debug!(
                    "channel {} not ready to settle. now: {} expiry: {}",
                    channel, now, state.expiry
                );
            },
        }
        Ok(action)
    }
}
