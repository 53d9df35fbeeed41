//! Typed parameter identifiers, the peer message envelope and the
//! idempotent inbound application path.

use crate::{database::ParamStore, swap_id::SwapId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// The six logical sub-transactions of a swap, plus the default slot the
/// top-level state lives under. Persisted as small integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SubTxId {
    Default = 1,
    BeamLock = 2,
    BeamRefund = 3,
    BeamRedeem = 4,
    Lock = 5,
    Refund = 6,
    Redeem = 7,
}

impl From<SubTxId> for u8 {
    fn from(sub: SubTxId) -> u8 {
        sub as u8
    }
}

impl TryFrom<u8> for SubTxId {
    type Error = UnknownId;

    fn try_from(value: u8) -> Result<Self, UnknownId> {
        let sub = match value {
            1 => SubTxId::Default,
            2 => SubTxId::BeamLock,
            3 => SubTxId::BeamRefund,
            4 => SubTxId::BeamRedeem,
            5 => SubTxId::Lock,
            6 => SubTxId::Refund,
            7 => SubTxId::Redeem,
            _ => return Err(UnknownId(value)),
        };

        Ok(sub)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
#[error("unknown id {0}")]
pub struct UnknownId(pub u8);

/// Everything a swap persists or exchanges, one id per value. Persisted
/// and transmitted as small integers for forward compatibility.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ParameterId {
    State = 0,
    IsSender = 1,
    IsInitiator = 2,
    CreateTime = 3,
    Amount = 4,
    Fee = 5,
    MinHeight = 6,
    PreImage = 7,
    KernelId = 8,
    KernelProofHeight = 9,
    TransactionRegistered = 10,
    RawTransaction = 11,
    FailureReason = 12,
    Inputs = 13,
    Outputs = 14,
    Offset = 15,
    SharedBlindingFactor = 16,
    SharedSeed = 17,
    SharedCoinId = 18,
    SharedBulletProof = 19,
    PeerPublicExcess = 20,
    PeerPublicNonce = 21,
    PeerSignature = 22,
    PeerOffset = 23,
    PeerPublicSharedBlindingFactor = 24,
    PeerSharedBulletProofPart2 = 25,
    PeerSharedBulletProofPart3 = 26,
    PeerSharedBulletProofMSig = 27,
    PeerLockImage = 28,
    PeerProtoVersion = 29,
    AtomicSwapAmount = 30,
    AtomicSwapCoin = 31,
    AtomicSwapAddress = 32,
    AtomicSwapPeerAddress = 33,
    AtomicSwapExternalTxId = 34,
    AtomicSwapExternalTxOutputIndex = 35,
}

impl ParameterId {
    /// Whether an inbound bundle may set this parameter. Everything else
    /// is local state the peer has no business writing.
    fn is_peer_settable(self) -> bool {
        use ParameterId::*;

        matches!(
            self,
            IsSender
                | CreateTime
                | Amount
                | Fee
                | MinHeight
                | PeerPublicExcess
                | PeerPublicNonce
                | PeerSignature
                | PeerOffset
                | PeerPublicSharedBlindingFactor
                | PeerSharedBulletProofPart2
                | PeerSharedBulletProofPart3
                | PeerSharedBulletProofMSig
                | PeerLockImage
                | PeerProtoVersion
                | AtomicSwapAmount
                | AtomicSwapCoin
                | AtomicSwapPeerAddress
                | AtomicSwapExternalTxId
                | AtomicSwapExternalTxOutputIndex
        )
    }
}

impl From<ParameterId> for u8 {
    fn from(id: ParameterId) -> u8 {
        id as u8
    }
}

impl TryFrom<u8> for ParameterId {
    type Error = UnknownId;

    fn try_from(value: u8) -> Result<Self, UnknownId> {
        use ParameterId::*;

        let id = match value {
            0 => State,
            1 => IsSender,
            2 => IsInitiator,
            3 => CreateTime,
            4 => Amount,
            5 => Fee,
            6 => MinHeight,
            7 => PreImage,
            8 => KernelId,
            9 => KernelProofHeight,
            10 => TransactionRegistered,
            11 => RawTransaction,
            12 => FailureReason,
            13 => Inputs,
            14 => Outputs,
            15 => Offset,
            16 => SharedBlindingFactor,
            17 => SharedSeed,
            18 => SharedCoinId,
            19 => SharedBulletProof,
            20 => PeerPublicExcess,
            21 => PeerPublicNonce,
            22 => PeerSignature,
            23 => PeerOffset,
            24 => PeerPublicSharedBlindingFactor,
            25 => PeerSharedBulletProofPart2,
            26 => PeerSharedBulletProofPart3,
            27 => PeerSharedBulletProofMSig,
            28 => PeerLockImage,
            29 => PeerProtoVersion,
            30 => AtomicSwapAmount,
            31 => AtomicSwapCoin,
            32 => AtomicSwapAddress,
            33 => AtomicSwapPeerAddress,
            34 => AtomicSwapExternalTxId,
            35 => AtomicSwapExternalTxOutputIndex,
            _ => return Err(UnknownId(value)),
        };

        Ok(id)
    }
}

/// A labelled parameter bundle travelling between the two parties.
///
/// Values are the canonical CBOR encoding of their typed form; ids are
/// raw on the wire so that receivers can skip ones they do not know.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SetTxParameter {
    pub tx_id: SwapId,
    pub sub_tx: SubTxId,
    pub parameters: Vec<(u8, Vec<u8>)>,
}

impl SetTxParameter {
    pub fn new(tx_id: SwapId, sub_tx: SubTxId) -> Self {
        SetTxParameter {
            tx_id,
            sub_tx,
            parameters: Vec::new(),
        }
    }

    pub fn with<T: Serialize>(mut self, id: ParameterId, value: &T) -> Result<Self> {
        let bytes = serde_cbor::to_vec(value)
            .with_context(|| format!("failed to encode parameter {:?}", id))?;
        self.parameters.push((id.into(), bytes));

        Ok(self)
    }
}

/// Writes an inbound bundle into the store. Unknown and non-peer-settable
/// ids are ignored; re-writing an identical value is a no-op. Returns
/// whether anything changed, so callers only tick the state machine on
/// actual progress.
pub fn apply_peer_message(store: &ParamStore, msg: &SetTxParameter) -> Result<bool> {
    let mut changed = false;

    for (raw_id, bytes) in &msg.parameters {
        let id = match ParameterId::try_from(*raw_id) {
            Ok(id) => id,
            Err(_) => {
                tracing::debug!("ignoring unknown parameter id {}", raw_id);
                continue;
            }
        };

        if !id.is_peer_settable() {
            tracing::warn!("peer attempted to set local parameter {:?}", id);
            continue;
        }

        changed |= store.put_raw(msg.tx_id, msg.sub_tx, id, bytes, true)?;
    }

    Ok(changed)
}
