//! The atomic swap state machine.
//!
//! One instance drives one swap. All progress happens in [`AtomicSwap::tick`]:
//! every externally triggered event (an RPC reply, a confirmed kernel, an
//! inbound peer bundle) ends in a parameter-store write followed by a
//! re-tick, and the tick advances the automaton as far as the persisted
//! state allows. Crash recovery is therefore free: a fresh process
//! resumes from the store alone.

pub mod channel;
mod kernel;
mod lock_tx;
mod shared_tx;

use self::{channel::PeerChannel, lock_tx::LockTxBuilder, shared_tx::SharedTxBuilder};
use crate::{
    beam::{self, Amount, BeamNode, Height},
    bitcoind::{sat_to_btc, BitcoindRpc, ConnectionFailed, TransactionInput},
    crypto::KeyChain,
    database::ParamStore,
    htlc::HtlcContract,
    params::{ParameterId, SetTxParameter, SubTxId},
    secret::Secret,
    swap_id::SwapId,
    timestamp::Timestamp,
};
use anyhow::{anyhow, Context, Result};
use bitcoin::{
    consensus::encode::{deserialize, serialize_hex},
    Network, PrivateKey,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{convert::TryFrom, sync::Arc};

pub const BEAM_LOCK_TIME_BLOCKS: Height = 24 * 60;
pub const BTC_LOCK_TIME_SECS: u64 = 2 * 24 * 60 * 60;
pub const BTC_MIN_TX_CONFIRMATIONS: u32 = 6;
pub const PROTO_VERSION: u32 = 1;

/// Chain B withdrawal size estimate for fee computation, in vbytes.
const WITHDRAW_TX_VSIZE: u64 = 300;
const MAX_INPUT_SEQUENCE: u32 = u32::MAX;

/// Top-level automaton state, persisted as a small integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum State {
    Initial = 0,
    Invitation = 1,
    BuildingBeamLockTx = 2,
    BuildingBeamRefundTx = 3,
    BuildingBeamRedeemTx = 4,
    BuildingLockTx = 5,
    BuildingRefundTx = 6,
    BuildingRedeemTx = 7,
    HandlingContractTx = 8,
    SendingRefundTx = 9,
    SendingRedeemTx = 10,
    SendingBeamLockTx = 11,
    SendingBeamRedeemTx = 12,
    SendingBeamRefundTx = 13,
    CompleteSwap = 14,
    Cancelled = 15,
    Failed = 16,
}

impl From<State> for u8 {
    fn from(state: State) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for State {
    type Error = crate::params::UnknownId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use State::*;

        let state = match value {
            0 => Initial,
            1 => Invitation,
            2 => BuildingBeamLockTx,
            3 => BuildingBeamRefundTx,
            4 => BuildingBeamRedeemTx,
            5 => BuildingLockTx,
            6 => BuildingRefundTx,
            7 => BuildingRedeemTx,
            8 => HandlingContractTx,
            9 => SendingRefundTx,
            10 => SendingRedeemTx,
            11 => SendingBeamLockTx,
            12 => SendingBeamRedeemTx,
            13 => SendingBeamRefundTx,
            14 => CompleteSwap,
            15 => Cancelled,
            16 => Failed,
            _ => return Err(crate::params::UnknownId(value)),
        };

        Ok(state)
    }
}

/// Per-sub-transaction negotiation state on Chain A. Strictly monotone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SubTxState {
    Initial = 0,
    Invitation = 1,
    SharedUtxoProofPart2 = 2,
    Constructed = 3,
}

impl From<SubTxState> for u8 {
    fn from(state: SubTxState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for SubTxState {
    type Error = crate::params::UnknownId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let state = match value {
            0 => SubTxState::Initial,
            1 => SubTxState::Invitation,
            2 => SubTxState::SharedUtxoProofPart2,
            3 => SubTxState::Constructed,
            _ => return Err(crate::params::UnknownId(value)),
        };

        Ok(state)
    }
}

/// Chain B transaction construction state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SwapTxState {
    Initial = 0,
    CreatingTx = 1,
    Constructed = 2,
}

impl From<SwapTxState> for u8 {
    fn from(state: SwapTxState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for SwapTxState {
    type Error = crate::params::UnknownId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let state = match value {
            0 => SwapTxState::Initial,
            1 => SwapTxState::CreatingTx,
            2 => SwapTxState::Constructed,
            _ => return Err(crate::params::UnknownId(value)),
        };

        Ok(state)
    }
}

/// Why a swap ended up in a terminal failure state.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum FailureReason {
    #[error("failed to dispatch parameters to the peer")]
    FailedToSendParameters = 0,
    #[error("transaction was not accepted by the network")]
    FailedToRegister = 1,
    #[error("locally built transaction is invalid")]
    InvalidTransaction = 2,
    #[error("peer signature is invalid")]
    PeerSignatureInvalid = 3,
    #[error("chain RPC failed")]
    RpcError = 4,
    #[error("locktime expired")]
    Expired = 5,
}

impl From<FailureReason> for u8 {
    fn from(reason: FailureReason) -> u8 {
        reason as u8
    }
}

impl TryFrom<u8> for FailureReason {
    type Error = crate::params::UnknownId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use FailureReason::*;

        let reason = match value {
            0 => FailedToSendParameters,
            1 => FailedToRegister,
            2 => InvalidTransaction,
            3 => PeerSignatureInvalid,
            4 => RpcError,
            5 => Expired,
            _ => return Err(crate::params::UnknownId(value)),
        };

        Ok(reason)
    }
}

/// What a single tick amounted to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Tick {
    /// Waiting for an external event; re-tick when one arrives.
    Suspended,
    Completed,
    Cancelled,
    Failed(FailureReason),
}

enum Step {
    Goto(State),
    Suspend,
}

/// Narrow capability surface the transaction builders work against.
pub(crate) struct SwapCtx<'a> {
    pub id: SwapId,
    pub store: &'a ParamStore,
    pub keychain: &'a KeyChain,
    pub wallet: &'a dyn beam::Wallet,
    pub channel: &'a dyn PeerChannel,
}

impl SwapCtx<'_> {
    pub fn get<T: DeserializeOwned>(&self, sub: SubTxId, id: ParameterId) -> Result<Option<T>> {
        self.store.get(self.id, sub, id)
    }

    pub fn get_mandatory<T: DeserializeOwned>(&self, sub: SubTxId, id: ParameterId) -> Result<T> {
        self.store.get_mandatory(self.id, sub, id)
    }

    pub fn put<T: Serialize>(&self, sub: SubTxId, id: ParameterId, value: &T) -> Result<bool> {
        self.store.put(self.id, sub, id, value, true)
    }

    pub fn sub_state(&self, sub: SubTxId) -> Result<SubTxState> {
        Ok(self
            .get(sub, ParameterId::State)?
            .unwrap_or(SubTxState::Initial))
    }

    pub fn set_sub_state(&self, sub: SubTxId, state: SubTxState) -> Result<()> {
        let current = self.sub_state(sub)?;
        if state < current {
            return Err(anyhow!(
                "refusing to move {:?} backwards from {:?} to {:?}",
                sub,
                current,
                state
            ));
        }

        self.put(sub, ParameterId::State, &state)?;
        tracing::debug!("{} {:?} is now {:?}", self.id, sub, state);

        Ok(())
    }

    pub fn message(&self, sub: SubTxId) -> SetTxParameter {
        SetTxParameter::new(self.id, sub)
    }

    pub async fn send(&self, msg: SetTxParameter) -> Result<()> {
        self.channel
            .send(msg)
            .await
            .context(FailureReason::FailedToSendParameters)
    }
}

/// Parameters fixed when a swap is created.
#[derive(Clone, Debug)]
pub struct CreateParams {
    /// Chain A value moved into the shared output.
    pub amount: Amount,
    /// Chain A lock transaction fee.
    pub fee: Amount,
    /// Chain B value in satoshi.
    pub swap_amount: u64,
    pub swap_coin: String,
    pub is_sender: bool,
    pub is_initiator: bool,
    pub create_time: Timestamp,
}

pub struct AtomicSwap {
    pub id: SwapId,
    pub store: ParamStore,
    pub keychain: KeyChain,
    pub wallet: Arc<dyn beam::Wallet>,
    pub node: Arc<dyn BeamNode>,
    pub bitcoind: Arc<dyn BitcoindRpc>,
    pub channel: Arc<dyn PeerChannel>,
    pub network: Network,
    /// Chain B fee rate in satoshi per 1000 vbytes.
    pub btc_fee_rate: u64,
}

impl AtomicSwap {
    pub fn create(&self, params: &CreateParams) -> Result<()> {
        let sub = SubTxId::Default;

        self.store.put(self.id, sub, ParameterId::Amount, &params.amount, false)?;
        self.store.put(self.id, sub, ParameterId::Fee, &params.fee, false)?;
        self.store.put(
            self.id,
            sub,
            ParameterId::AtomicSwapAmount,
            &params.swap_amount,
            false,
        )?;
        self.store.put(
            self.id,
            sub,
            ParameterId::AtomicSwapCoin,
            &params.swap_coin,
            false,
        )?;
        self.store.put(self.id, sub, ParameterId::IsSender, &params.is_sender, false)?;
        self.store.put(
            self.id,
            sub,
            ParameterId::IsInitiator,
            &params.is_initiator,
            false,
        )?;
        self.store.put(
            self.id,
            sub,
            ParameterId::CreateTime,
            &params.create_time,
            false,
        )?;
        self.store
            .put(self.id, sub, ParameterId::State, &State::Initial, true)?;

        Ok(())
    }

    pub fn state(&self) -> Result<State> {
        Ok(self
            .get::<State>(SubTxId::Default, ParameterId::State)?
            .unwrap_or(State::Initial))
    }

    /// Advances the automaton as far as the persisted state allows.
    pub async fn tick(&self) -> Result<Tick> {
        loop {
            let state = self.state()?;

            let step = match state {
                State::CompleteSwap => {
                    tracing::info!("{} swap completed", self.id);
                    return Ok(Tick::Completed);
                }
                State::Cancelled => return Ok(Tick::Cancelled),
                State::Failed => {
                    let reason = self
                        .get(SubTxId::Default, ParameterId::FailureReason)?
                        .unwrap_or(FailureReason::RpcError);
                    return Ok(Tick::Failed(reason));
                }
                State::Initial => self.handle_initial().await,
                State::Invitation => self.handle_invitation().await,
                State::BuildingLockTx => self.handle_building_lock_tx().await,
                State::BuildingBeamLockTx => self.handle_building_beam_lock_tx().await,
                State::BuildingBeamRefundTx => self.handle_building_beam_refund_tx().await,
                State::BuildingBeamRedeemTx => self.handle_building_beam_redeem_tx().await,
                State::HandlingContractTx => self.handle_handling_contract_tx().await,
                State::BuildingRefundTx => self.handle_building_refund_tx().await,
                State::BuildingRedeemTx => self.handle_building_redeem_tx().await,
                State::SendingBeamLockTx => self.handle_sending_beam_lock_tx().await,
                State::SendingBeamRedeemTx => self.handle_sending_beam_redeem_tx().await,
                State::SendingBeamRefundTx => self.handle_sending_beam_refund_tx().await,
                State::SendingRedeemTx => self.handle_sending_external_withdraw(SubTxId::Redeem).await,
                State::SendingRefundTx => self.handle_sending_external_withdraw(SubTxId::Refund).await,
            };

            match step {
                Ok(Step::Goto(next)) => self.set_state(next)?,
                Ok(Step::Suspend) => return Ok(Tick::Suspended),
                Err(err) => return self.on_error(err),
            }
        }
    }

    async fn handle_initial(&self) -> Result<Step> {
        if self
            .get::<String>(SubTxId::Default, ParameterId::AtomicSwapAddress)?
            .is_none()
        {
            let address = match rpc_result(self.bitcoind.get_raw_change_address().await)? {
                Some(address) => address,
                None => return Ok(Step::Suspend),
            };
            self.put(SubTxId::Default, ParameterId::AtomicSwapAddress, &address)?;
        }

        if self.is_initiator()?
            && self
                .get::<Height>(SubTxId::Default, ParameterId::MinHeight)?
                .is_none()
        {
            let tip = match self.node.get_tip().await {
                Ok(tip) => tip,
                Err(err) => {
                    tracing::warn!("{} failed to fetch tip: {:#}", self.id, err);
                    return Ok(Step::Suspend);
                }
            };
            self.put(SubTxId::Default, ParameterId::MinHeight, &tip)?;
        }

        Ok(Step::Goto(State::Invitation))
    }

    async fn handle_invitation(&self) -> Result<Step> {
        let ctx = self.ctx();
        let own_address: String =
            self.get_mandatory(SubTxId::Default, ParameterId::AtomicSwapAddress)?;

        if self.is_initiator()? {
            let msg = ctx
                .message(SubTxId::Default)
                .with(ParameterId::Amount, &self.amount()?)?
                .with(ParameterId::IsSender, &!self.is_sender()?)?
                .with(ParameterId::AtomicSwapAmount, &self.swap_amount()?)?
                .with(
                    ParameterId::AtomicSwapCoin,
                    &self.get_mandatory::<String>(SubTxId::Default, ParameterId::AtomicSwapCoin)?,
                )?
                .with(ParameterId::CreateTime, &self.create_time()?)?
                .with(ParameterId::AtomicSwapPeerAddress, &own_address)?
                .with(ParameterId::PeerProtoVersion, &PROTO_VERSION)?;
            ctx.send(msg).await?;
        } else {
            // The counterparty needs our payment address to assemble the
            // contract on its side.
            let msg = ctx
                .message(SubTxId::Default)
                .with(ParameterId::AtomicSwapPeerAddress, &own_address)?
                .with(ParameterId::PeerProtoVersion, &PROTO_VERSION)?;
            ctx.send(msg).await?;
        }

        Ok(Step::Goto(if self.is_beam_owner()? {
            State::BuildingBeamLockTx
        } else {
            State::BuildingLockTx
        }))
    }

    async fn handle_building_lock_tx(&self) -> Result<Step> {
        if self.swap_tx_state(SubTxId::Lock)? == SwapTxState::Constructed {
            return Ok(Step::Goto(State::BuildingBeamLockTx));
        }

        // The hash-lock secret is born here, before anything observable
        // happens on either chain.
        if self
            .get::<Secret>(SubTxId::BeamRedeem, ParameterId::PreImage)?
            .is_none()
        {
            let preimage = Secret::generate(&mut rand::thread_rng());
            self.put(SubTxId::BeamRedeem, ParameterId::PreImage, &preimage)?;
        }

        let contract = match self.contract()? {
            Some(contract) => contract,
            None => return Ok(Step::Suspend),
        };

        let script = contract.script()?;
        let address = bitcoin::Address::p2sh(&script, self.network)?;
        let bare = bitcoin::Transaction {
            version: 2,
            lock_time: 0,
            input: vec![],
            output: vec![bitcoin::TxOut {
                value: self.swap_amount()?,
                script_pubkey: address.script_pubkey(),
            }],
        };

        self.set_swap_tx_state(SubTxId::Lock, SwapTxState::CreatingTx)?;

        let funded =
            match rpc_result(self.bitcoind.fund_raw_transaction(&serialize_hex(&bare)).await)? {
                Some(funded) => funded,
                None => return Ok(Step::Suspend),
            };
        self.put(
            SubTxId::Lock,
            ParameterId::AtomicSwapExternalTxOutputIndex,
            &funded.value_output_index(),
        )?;

        let signed = match rpc_result(self.bitcoind.sign_raw_transaction(&funded.hex).await)? {
            Some(signed) => signed,
            None => return Ok(Step::Suspend),
        };
        if !signed.complete {
            return Err(anyhow!("node could not fully sign the lock transaction")
                .context(FailureReason::RpcError));
        }

        self.put(SubTxId::Lock, ParameterId::RawTransaction, &signed.hex)?;
        self.set_swap_tx_state(SubTxId::Lock, SwapTxState::Constructed)?;

        Ok(Step::Goto(State::BuildingBeamLockTx))
    }

    async fn handle_building_beam_lock_tx(&self) -> Result<Step> {
        let (fee, min_height) = match self.lock_kernel_params()? {
            Some(params) => params,
            None => return Ok(Step::Suspend),
        };

        let ctx = self.ctx();
        let builder = LockTxBuilder::new(
            &ctx,
            self.amount()?,
            fee,
            min_height,
            self.is_sender()?,
            self.is_initiator()?,
        );

        if builder.advance().await? != SubTxState::Constructed {
            return Ok(Step::Suspend);
        }

        if self.is_sender()? && !builder.build_transaction()?.is_valid() {
            return Err(anyhow!("negotiated lock transaction does not validate")
                .context(FailureReason::InvalidTransaction));
        }

        Ok(Step::Goto(State::BuildingBeamRefundTx))
    }

    async fn handle_building_beam_refund_tx(&self) -> Result<Step> {
        match self.advance_shared_tx(SubTxId::BeamRefund).await? {
            SubTxState::Constructed => Ok(Step::Goto(State::BuildingBeamRedeemTx)),
            _ => Ok(Step::Suspend),
        }
    }

    async fn handle_building_beam_redeem_tx(&self) -> Result<Step> {
        match self.advance_shared_tx(SubTxId::BeamRedeem).await? {
            SubTxState::Constructed => Ok(Step::Goto(State::HandlingContractTx)),
            _ => Ok(Step::Suspend),
        }
    }

    async fn handle_handling_contract_tx(&self) -> Result<Step> {
        if !self.is_beam_owner()? {
            let raw: String = self.get_mandatory(SubTxId::Lock, ParameterId::RawTransaction)?;
            if !self.register_external_tx(SubTxId::Lock, &raw).await? {
                return Ok(Step::Suspend);
            }

            let txid: String =
                self.get_mandatory(SubTxId::Lock, ParameterId::AtomicSwapExternalTxId)?;
            let vout: u32 = self.get_mandatory(
                SubTxId::Lock,
                ParameterId::AtomicSwapExternalTxOutputIndex,
            )?;

            let ctx = self.ctx();
            let msg = ctx
                .message(SubTxId::Lock)
                .with(ParameterId::AtomicSwapExternalTxId, &txid)?
                .with(ParameterId::AtomicSwapExternalTxOutputIndex, &vout)?;
            ctx.send(msg).await?;

            return Ok(Step::Goto(State::BuildingRefundTx));
        }

        // Chain A owner: wait for the counterparty's contract to confirm,
        // bailing out cleanly if it never appears in time.
        let external = self.get::<String>(SubTxId::Lock, ParameterId::AtomicSwapExternalTxId)?;
        let (txid, vout) = match external {
            Some(txid) => (
                txid,
                self.get_mandatory::<u32>(
                    SubTxId::Lock,
                    ParameterId::AtomicSwapExternalTxOutputIndex,
                )?,
            ),
            None => return self.contract_wait_or_cancel().await,
        };

        let confirmations = match rpc_result(self.bitcoind.get_tx_out(&txid, vout).await)? {
            Some(Some(out)) => out.confirmations,
            Some(None) => 0,
            None => return Ok(Step::Suspend),
        };

        if confirmations < BTC_MIN_TX_CONFIRMATIONS {
            return self.contract_wait_or_cancel().await;
        }

        Ok(Step::Goto(State::SendingBeamLockTx))
    }

    /// Keep waiting for the Chain B contract unless the Chain A clock has
    /// run past the point where continuing would be unsafe.
    async fn contract_wait_or_cancel(&self) -> Result<Step> {
        if self.beam_locktime_expired().await? {
            tracing::info!("{} counterparty contract never confirmed, cancelling", self.id);
            self.put(
                SubTxId::Default,
                ParameterId::FailureReason,
                &FailureReason::Expired,
            )?;
            return Ok(Step::Goto(State::Cancelled));
        }

        Ok(Step::Suspend)
    }

    async fn handle_building_refund_tx(&self) -> Result<Step> {
        match self.build_external_withdraw(SubTxId::Refund).await? {
            SwapTxState::Constructed => Ok(Step::Goto(State::SendingBeamLockTx)),
            _ => Ok(Step::Suspend),
        }
    }

    async fn handle_building_redeem_tx(&self) -> Result<Step> {
        match self.build_external_withdraw(SubTxId::Redeem).await? {
            SwapTxState::Constructed => Ok(Step::Goto(State::SendingRedeemTx)),
            _ => Ok(Step::Suspend),
        }
    }

    async fn handle_sending_beam_lock_tx(&self) -> Result<Step> {
        if self.is_sender()? {
            let (fee, min_height) = self
                .lock_kernel_params()?
                .ok_or_else(|| anyhow!("lock kernel parameters disappeared"))?;
            let ctx = self.ctx();
            let builder = LockTxBuilder::new(
                &ctx,
                self.amount()?,
                fee,
                min_height,
                true,
                self.is_initiator()?,
            );

            let tx = builder.build_transaction()?;
            if !tx.is_valid() {
                return Err(anyhow!("lock transaction does not validate")
                    .context(FailureReason::InvalidTransaction));
            }

            if !self.send_beam_sub_tx(SubTxId::BeamLock, tx).await? {
                return Ok(Step::Suspend);
            }
        }

        if !self.is_sub_tx_completed(SubTxId::BeamLock).await? {
            // The Chain B owner has its contract on chain already; if the
            // Chain A lock never lands it reclaims through the refund
            // branch once the contract locktime passes.
            if !self.is_beam_owner()? && Timestamp::now() >= self.htlc_locktime()? {
                return Ok(Step::Goto(State::SendingRefundTx));
            }
            return Ok(Step::Suspend);
        }

        tracing::debug!("{} lock tx completed", self.id);

        Ok(Step::Goto(State::SendingBeamRedeemTx))
    }

    async fn handle_sending_beam_redeem_tx(&self) -> Result<Step> {
        if self.is_beam_owner()? {
            if self.beam_locktime_expired().await? {
                tracing::debug!("{} beam locktime expired", self.id);
                return Ok(Step::Goto(State::SendingBeamRefundTx));
            }

            if self
                .get::<Secret>(SubTxId::BeamRedeem, ParameterId::PreImage)?
                .is_none()
            {
                let kernel_id =
                    self.get_mandatory(SubTxId::BeamRedeem, ParameterId::KernelId)?;
                let kernel = match self.node.get_kernel(kernel_id).await {
                    Ok(kernel) => kernel,
                    Err(err) => {
                        tracing::warn!("{} failed to fetch kernel: {:#}", self.id, err);
                        return Ok(Step::Suspend);
                    }
                };

                let preimage = match kernel.and_then(|kernel| kernel.preimage) {
                    Some(preimage) => preimage,
                    None => return Ok(Step::Suspend),
                };
                self.put(SubTxId::BeamRedeem, ParameterId::PreImage, &preimage)?;
                tracing::debug!("{} recovered preimage from chain", self.id);
            }

            return Ok(Step::Goto(State::BuildingRedeemTx));
        }

        // Owner of the Chain A redeem: publish it, revealing the secret.
        let builder_ctx = self.ctx();
        let builder = self.shared_tx_builder(&builder_ctx, SubTxId::BeamRedeem)?;
        let tx = builder.build_transaction()?;
        if !tx.is_valid() {
            return Err(anyhow!("redeem transaction does not validate")
                .context(FailureReason::InvalidTransaction));
        }

        if !self.send_beam_sub_tx(SubTxId::BeamRedeem, tx).await?
            || !self.is_sub_tx_completed(SubTxId::BeamRedeem).await?
        {
            if Timestamp::now() >= self.htlc_locktime()? {
                return Ok(Step::Goto(State::SendingRefundTx));
            }
            return Ok(Step::Suspend);
        }

        tracing::debug!("{} redeem tx completed", self.id);

        Ok(Step::Goto(State::CompleteSwap))
    }

    async fn handle_sending_beam_refund_tx(&self) -> Result<Step> {
        // The refund kernel's min height makes early broadcast pointless.
        if !self.beam_locktime_expired().await? {
            return Ok(Step::Suspend);
        }

        let builder_ctx = self.ctx();
        let builder = self.shared_tx_builder(&builder_ctx, SubTxId::BeamRefund)?;
        let tx = builder.build_transaction()?;
        if !tx.is_valid() {
            return Err(anyhow!("refund transaction does not validate")
                .context(FailureReason::InvalidTransaction));
        }

        if !self.send_beam_sub_tx(SubTxId::BeamRefund, tx).await?
            || !self.is_sub_tx_completed(SubTxId::BeamRefund).await?
        {
            return Ok(Step::Suspend);
        }

        tracing::debug!("{} refund tx completed", self.id);

        Ok(Step::Goto(State::CompleteSwap))
    }

    /// Broadcast a signed Chain B withdrawal and wait for its output to
    /// confirm.
    async fn handle_sending_external_withdraw(&self, sub: SubTxId) -> Result<Step> {
        if sub == SubTxId::Refund && Timestamp::now() < self.htlc_locktime()? {
            return Ok(Step::Suspend);
        }

        let raw: String = self.get_mandatory(sub, ParameterId::RawTransaction)?;
        if !self.register_external_tx(sub, &raw).await? {
            return Ok(Step::Suspend);
        }

        let txid: String = self.get_mandatory(sub, ParameterId::AtomicSwapExternalTxId)?;
        let confirmed = match rpc_result(self.bitcoind.get_tx_out(&txid, 0).await)? {
            Some(Some(out)) => out.confirmations >= 1,
            Some(None) => false,
            None => return Ok(Step::Suspend),
        };

        if !confirmed {
            return Ok(Step::Suspend);
        }

        Ok(Step::Goto(State::CompleteSwap))
    }

    async fn advance_shared_tx(&self, sub: SubTxId) -> Result<SubTxState> {
        let ctx = self.ctx();
        let params = match self.shared_tx_params(sub)? {
            Some(params) => params,
            None => return ctx.sub_state(sub),
        };

        SharedTxBuilder::new(
            &ctx,
            sub,
            params.amount,
            params.fee,
            params.min_height,
            params.is_owner,
        )
        .advance()
        .await
    }

    fn shared_tx_builder<'a>(
        &self,
        ctx: &'a SwapCtx<'a>,
        sub: SubTxId,
    ) -> Result<SharedTxBuilder<'a>> {
        let params = self
            .shared_tx_params(sub)?
            .ok_or_else(|| anyhow!("{:?} parameters are not negotiated yet", sub))?;

        Ok(SharedTxBuilder::new(
            ctx,
            sub,
            params.amount,
            params.fee,
            params.min_height,
            params.is_owner,
        ))
    }

    fn shared_tx_params(&self, sub: SubTxId) -> Result<Option<SharedTxParams>> {
        let is_owner = match sub {
            SubTxId::BeamRefund => self.is_sender()?,
            SubTxId::BeamRedeem => !self.is_sender()?,
            _ => return Err(anyhow!("{:?} does not spend the shared output", sub)),
        };

        let fee = match self.get::<Amount>(sub, ParameterId::Fee)? {
            Some(fee) => fee,
            None if is_owner => self.get_mandatory(SubTxId::Default, ParameterId::Fee)?,
            None => return Ok(None),
        };

        let min_height = match self.get::<Height>(sub, ParameterId::MinHeight)? {
            Some(height) => height,
            None if is_owner => {
                let lock_height = match self.lock_kernel_params()? {
                    Some((_, height)) => height,
                    None => return Ok(None),
                };
                match sub {
                    SubTxId::BeamRefund => lock_height + BEAM_LOCK_TIME_BLOCKS,
                    _ => lock_height,
                }
            }
            None => return Ok(None),
        };

        Ok(Some(SharedTxParams {
            amount: self.amount()?.saturating_sub(fee),
            fee,
            min_height,
            is_owner,
        }))
    }

    async fn build_external_withdraw(&self, sub: SubTxId) -> Result<SwapTxState> {
        if self.swap_tx_state(sub)? == SwapTxState::Constructed {
            return Ok(SwapTxState::Constructed);
        }

        let lock_txid: String =
            match self.get(SubTxId::Lock, ParameterId::AtomicSwapExternalTxId)? {
                Some(txid) => txid,
                None => return self.swap_tx_state(sub),
            };
        let lock_vout: u32 = self.get_mandatory(
            SubTxId::Lock,
            ParameterId::AtomicSwapExternalTxOutputIndex,
        )?;
        let own_address: String =
            self.get_mandatory(SubTxId::Default, ParameterId::AtomicSwapAddress)?;

        if self
            .get::<String>(sub, ParameterId::RawTransaction)?
            .is_none()
        {
            let fee = self.btc_fee_rate * WITHDRAW_TX_VSIZE / 1000;
            let value = self
                .swap_amount()?
                .checked_sub(fee)
                .ok_or_else(|| anyhow!("contract value does not cover the withdrawal fee"))?;

            let inputs = vec![TransactionInput {
                txid: lock_txid,
                vout: lock_vout,
                sequence: MAX_INPUT_SEQUENCE - 1,
            }];
            let outputs = vec![(own_address.clone(), sat_to_btc(value))];
            let locktime = if sub == SubTxId::Refund {
                Some(self.htlc_locktime()?.into_secs() as u32)
            } else {
                None
            };

            let raw = match rpc_result(
                self.bitcoind.create_raw_transaction(inputs, outputs, locktime).await,
            )? {
                Some(raw) => raw,
                None => return self.swap_tx_state(sub),
            };

            self.put(sub, ParameterId::RawTransaction, &raw)?;
            self.set_swap_tx_state(sub, SwapTxState::CreatingTx)?;
        }

        let wif = match rpc_result(self.bitcoind.dump_priv_key(&own_address).await)? {
            Some(wif) => wif,
            None => return self.swap_tx_state(sub),
        };
        let key = PrivateKey::from_wif(&wif).context("node returned an invalid WIF key")?;

        let contract = self
            .contract()?
            .ok_or_else(|| anyhow!("contract parameters are incomplete"))?;
        let script = contract.script()?;

        let raw: String = self.get_mandatory(sub, ParameterId::RawTransaction)?;
        let mut tx: bitcoin::Transaction =
            deserialize(&hex::decode(&raw).context("withdrawal hex is invalid")?)
                .context("withdrawal does not deserialize")?;

        let signature = crate::htlc::sign_input(&tx, 0, &script, &key)?;
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let pubkey = key.public_key(&secp);

        let input_script = if sub == SubTxId::Redeem {
            let preimage: Secret =
                self.get_mandatory(SubTxId::BeamRedeem, ParameterId::PreImage)?;
            contract.redeem_input_script(&signature, &pubkey, &preimage)?
        } else {
            contract.refund_input_script(&signature, &pubkey)?
        };

        tx.input[0].script_sig = input_script;

        self.put(sub, ParameterId::RawTransaction, &serialize_hex(&tx))?;
        self.set_swap_tx_state(sub, SwapTxState::Constructed)?;

        Ok(SwapTxState::Constructed)
    }

    /// Broadcast through the Chain B node, once. `TransactionRegistered`
    /// is only written after the node's verdict, so a crash in between
    /// leads to a harmless re-broadcast.
    async fn register_external_tx(&self, sub: SubTxId, raw: &str) -> Result<bool> {
        match self.get::<bool>(sub, ParameterId::TransactionRegistered)? {
            Some(true) => return Ok(true),
            Some(false) => {
                return Err(anyhow!("{:?} broadcast was rejected", sub)
                    .context(FailureReason::FailedToRegister))
            }
            None => {}
        }

        let txid = match self.bitcoind.send_raw_transaction(raw).await {
            Ok(txid) => txid,
            Err(err) if err.downcast_ref::<ConnectionFailed>().is_some() => {
                tracing::debug!("{} broadcast did not reach the node: {:#}", self.id, err);
                return Ok(false);
            }
            Err(err) => return Err(err.context(FailureReason::FailedToRegister)),
        };

        let registered = !txid.is_empty();
        self.put(sub, ParameterId::TransactionRegistered, &registered)?;
        if !registered {
            return Err(anyhow!("{:?} broadcast was rejected", sub)
                .context(FailureReason::FailedToRegister));
        }

        self.put(sub, ParameterId::AtomicSwapExternalTxId, &txid)?;

        Ok(true)
    }

    /// Broadcast through the Chain A gateway, once.
    async fn send_beam_sub_tx(&self, sub: SubTxId, tx: beam::Transaction) -> Result<bool> {
        match self.get::<bool>(sub, ParameterId::TransactionRegistered)? {
            Some(true) => return Ok(true),
            Some(false) => {
                return Err(anyhow!("{:?} broadcast was rejected", sub)
                    .context(FailureReason::FailedToRegister))
            }
            None => {}
        }

        let accepted = match self.node.register_tx(self.id, tx).await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("{} failed to reach the node: {:#}", self.id, err);
                return Ok(false);
            }
        };

        self.put(sub, ParameterId::TransactionRegistered, &accepted)?;
        if !accepted {
            return Err(anyhow!("{:?} broadcast was rejected", sub)
                .context(FailureReason::FailedToRegister));
        }

        Ok(true)
    }

    /// Checks the kernel proof, caching the proof height under the
    /// sub-transaction that owns the kernel.
    async fn is_sub_tx_completed(&self, sub: SubTxId) -> Result<bool> {
        if self
            .get::<Height>(sub, ParameterId::KernelProofHeight)?
            .is_some()
        {
            return Ok(true);
        }

        let kernel_id = self.get_mandatory(sub, ParameterId::KernelId)?;
        let height = match self.node.confirm_kernel(kernel_id).await {
            Ok(height) => height,
            Err(err) => {
                tracing::warn!("{} failed to confirm kernel: {:#}", self.id, err);
                return Ok(false);
            }
        };

        match height {
            Some(height) => {
                self.put(sub, ParameterId::KernelProofHeight, &height)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn beam_locktime_expired(&self) -> Result<bool> {
        let min_height = match self.lock_kernel_params()? {
            Some((_, height)) => height,
            None => return Ok(false),
        };

        let tip = match self.node.get_tip().await {
            Ok(tip) => tip,
            Err(err) => {
                tracing::warn!("{} failed to fetch tip: {:#}", self.id, err);
                return Ok(false);
            }
        };

        Ok(tip > min_height + BEAM_LOCK_TIME_BLOCKS)
    }

    /// The Chain B contract as this side sees it. `None` until the peer's
    /// address and the lock image are known.
    fn contract(&self) -> Result<Option<HtlcContract>> {
        let own: String = self.get_mandatory(SubTxId::Default, ParameterId::AtomicSwapAddress)?;
        let peer: String =
            match self.get(SubTxId::Default, ParameterId::AtomicSwapPeerAddress)? {
                Some(peer) => peer,
                None => return Ok(None),
            };

        let lock_image = if let Some(preimage) =
            self.get::<Secret>(SubTxId::BeamRedeem, ParameterId::PreImage)?
        {
            crate::secret::SecretHash::new(preimage)
        } else {
            match self.get(SubTxId::BeamRedeem, ParameterId::PeerLockImage)? {
                Some(image) => image,
                None => return Ok(None),
            }
        };

        // The refund branch always pays the Chain B owner, the redeem
        // branch always pays the Chain A owner.
        let (refund_address, redeem_address) = if self.is_beam_owner()? {
            (peer, own)
        } else {
            (own, peer)
        };

        Ok(Some(HtlcContract::new(
            &refund_address,
            &redeem_address,
            self.htlc_locktime()?,
            lock_image,
        )?))
    }

    fn lock_kernel_params(&self) -> Result<Option<(Amount, Height)>> {
        let fee = match self.get::<Amount>(SubTxId::BeamLock, ParameterId::Fee)? {
            Some(fee) => Some(fee),
            None => self.get(SubTxId::Default, ParameterId::Fee)?,
        };
        let min_height = match self.get::<Height>(SubTxId::BeamLock, ParameterId::MinHeight)? {
            Some(height) => Some(height),
            None => self.get(SubTxId::Default, ParameterId::MinHeight)?,
        };

        Ok(match (fee, min_height) {
            (Some(fee), Some(min_height)) => Some((fee, min_height)),
            _ => None,
        })
    }

    fn htlc_locktime(&self) -> Result<Timestamp> {
        Ok(self.create_time()?.plus(BTC_LOCK_TIME_SECS))
    }

    fn on_error(&self, err: anyhow::Error) -> Result<Tick> {
        let reason = match err.downcast_ref::<FailureReason>() {
            Some(reason) => *reason,
            None => return Err(err),
        };

        if self.commit_point_passed()? {
            // Funds are on chain; terminating now would strand them. The
            // locktime fallbacks in the sending states are the way out,
            // so stay in place and let the next tick retry.
            tracing::warn!("{} error past the commit point: {:#}", self.id, err);
            return Ok(Tick::Suspended);
        }

        tracing::warn!("{} failed: {:#}", self.id, err);
        self.put(SubTxId::Default, ParameterId::FailureReason, &reason)?;
        self.set_state(State::Failed)?;

        Ok(Tick::Failed(reason))
    }

    /// Whether either chain has seen an irreversible action.
    fn commit_point_passed(&self) -> Result<bool> {
        for sub in &[SubTxId::BeamLock, SubTxId::Lock] {
            if self.get::<bool>(*sub, ParameterId::TransactionRegistered)? == Some(true) {
                return Ok(true);
            }
        }

        Ok(self
            .get::<Height>(SubTxId::BeamLock, ParameterId::KernelProofHeight)?
            .is_some())
    }

    fn ctx(&self) -> SwapCtx<'_> {
        SwapCtx {
            id: self.id,
            store: &self.store,
            keychain: &self.keychain,
            wallet: self.wallet.as_ref(),
            channel: self.channel.as_ref(),
        }
    }

    fn set_state(&self, state: State) -> Result<()> {
        self.put(SubTxId::Default, ParameterId::State, &state)?;
        tracing::info!("{} entering {:?}", self.id, state);

        Ok(())
    }

    fn swap_tx_state(&self, sub: SubTxId) -> Result<SwapTxState> {
        Ok(self
            .get(sub, ParameterId::State)?
            .unwrap_or(SwapTxState::Initial))
    }

    fn set_swap_tx_state(&self, sub: SubTxId, state: SwapTxState) -> Result<()> {
        self.put(sub, ParameterId::State, &state)?;

        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, sub: SubTxId, id: ParameterId) -> Result<Option<T>> {
        self.store.get(self.id, sub, id)
    }

    fn get_mandatory<T: DeserializeOwned>(&self, sub: SubTxId, id: ParameterId) -> Result<T> {
        self.store.get_mandatory(self.id, sub, id)
    }

    fn put<T: Serialize>(&self, sub: SubTxId, id: ParameterId, value: &T) -> Result<bool> {
        self.store.put(self.id, sub, id, value, true)
    }

    fn is_sender(&self) -> Result<bool> {
        self.get_mandatory(SubTxId::Default, ParameterId::IsSender)
    }

    fn is_beam_owner(&self) -> Result<bool> {
        self.is_sender()
    }

    fn is_initiator(&self) -> Result<bool> {
        self.get_mandatory(SubTxId::Default, ParameterId::IsInitiator)
    }

    fn amount(&self) -> Result<Amount> {
        self.get_mandatory(SubTxId::Default, ParameterId::Amount)
    }

    fn swap_amount(&self) -> Result<u64> {
        self.get_mandatory(SubTxId::Default, ParameterId::AtomicSwapAmount)
    }

    fn create_time(&self) -> Result<Timestamp> {
        self.get_mandatory(SubTxId::Default, ParameterId::CreateTime)
    }
}

struct SharedTxParams {
    amount: Amount,
    fee: Amount,
    min_height: Height,
    is_owner: bool,
}

/// Distinguishes transport loss (`None`, retried on the next tick) from
/// node-reported errors, which fail the swap.
fn rpc_result<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.downcast_ref::<ConnectionFailed>().is_some() => {
            tracing::debug!("transient RPC failure: {:#}", err);
            Ok(None)
        }
        Err(err) => Err(err.context(FailureReason::RpcError)),
    }
}
