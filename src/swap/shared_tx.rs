//! Two-round co-signing of the kernels that spend the shared output:
//! the owner invites, the cosigner confirms, the owner finalizes and is
//! the only party able to broadcast.

use super::{
    kernel::{kernel_path, KernelSigner, PeerKernel},
    FailureReason, SubTxState, SwapCtx,
};
use crate::{
    beam::{Amount, Coin, Height, Input, KernelSignature, Output, Transaction},
    crypto,
    params::{ParameterId, SubTxId},
    secret::SecretHash,
};
use anyhow::{anyhow, Result};
use curve25519_dalek::scalar::Scalar;

pub(crate) struct SharedTxBuilder<'a> {
    ctx: &'a SwapCtx<'a>,
    sub: SubTxId,
    /// The withdrawn value, `amountA − fee`.
    amount: Amount,
    fee: Amount,
    min_height: Height,
    is_owner: bool,
}

impl<'a> SharedTxBuilder<'a> {
    pub fn new(
        ctx: &'a SwapCtx<'a>,
        sub: SubTxId,
        amount: Amount,
        fee: Amount,
        min_height: Height,
        is_owner: bool,
    ) -> Self {
        SharedTxBuilder {
            ctx,
            sub,
            amount,
            fee,
            min_height,
            is_owner,
        }
    }

    pub async fn advance(&self) -> Result<SubTxState> {
        let ctx = self.ctx;
        let mut state = ctx.sub_state(self.sub)?;
        if state == SubTxState::Constructed {
            return Ok(state);
        }

        let shared_blinding = match self.shared_blinding()? {
            Some(blinding) => blinding,
            None => return Ok(state),
        };

        let hash_lock = if self.sub == SubTxId::BeamRedeem {
            match self.lock_image()? {
                Some(image) => Some(image),
                None => return Ok(state),
            }
        } else {
            None
        };

        if state == SubTxState::Initial {
            self.init_outputs()?;
        }

        let signer = self.signer(hash_lock)?;

        let peer = match self.peer_kernel()? {
            Some(peer) => peer,
            None => {
                if state == SubTxState::Initial && self.is_owner {
                    self.send_invitation(&signer, hash_lock).await?;
                    ctx.set_sub_state(self.sub, SubTxState::Invitation)?;
                    state = SubTxState::Invitation;
                }
                return Ok(state);
            }
        };

        let peer_signature: Option<Scalar> = ctx.get(self.sub, ParameterId::PeerSignature)?;
        let peer_signature = match peer_signature {
            Some(signature) => signature,
            None => {
                if state == SubTxState::Initial && !self.is_owner {
                    // The invited cosigner replies with everything the
                    // owner needs and is done.
                    let partial = signer.sign_partial(&peer);
                    let offset = self.published_offset(&shared_blinding);
                    ctx.put(self.sub, ParameterId::Offset, &offset)?;

                    let msg = ctx
                        .message(self.sub)
                        .with(ParameterId::PeerPublicExcess, &signer.public_excess())?
                        .with(ParameterId::PeerPublicNonce, &signer.public_nonce())?
                        .with(ParameterId::PeerSignature, &partial)?
                        .with(ParameterId::PeerOffset, &offset)?;
                    ctx.send(msg).await?;

                    ctx.put(self.sub, ParameterId::KernelId, &signer.kernel(&peer).id())?;
                    ctx.set_sub_state(self.sub, SubTxState::Constructed)?;
                    return Ok(SubTxState::Constructed);
                }
                return Ok(state);
            }
        };

        if !signer.verify_peer(&peer_signature, &peer) {
            return Err(FailureReason::PeerSignatureInvalid.into());
        }

        let offset = self.published_offset(&shared_blinding);
        ctx.put(self.sub, ParameterId::Offset, &offset)?;
        ctx.put(self.sub, ParameterId::KernelId, &signer.kernel(&peer).id())?;
        ctx.set_sub_state(self.sub, SubTxState::Constructed)?;

        Ok(SubTxState::Constructed)
    }

    /// The finished withdrawal; only the owner can assemble it.
    pub fn build_transaction(&self) -> Result<Transaction> {
        let ctx = self.ctx;

        let shared_blinding = self
            .shared_blinding()?
            .ok_or_else(|| anyhow!("shared output parameters are missing"))?;

        let hash_lock = if self.sub == SubTxId::BeamRedeem {
            self.lock_image()?
        } else {
            None
        };

        let out_coins: Vec<Coin> = ctx.get_mandatory(self.sub, ParameterId::Outputs)?;
        let signer = self.signer(hash_lock)?;
        let peer = self
            .peer_kernel()?
            .ok_or_else(|| anyhow!("withdrawal is not fully negotiated"))?;
        let peer_signature: Scalar = ctx.get_mandatory(self.sub, ParameterId::PeerSignature)?;

        let mut kernel = signer.kernel(&peer);
        kernel.signature = Some(KernelSignature {
            nonce: signer.public_nonce() + peer.nonce,
            s: signer.sign_partial(&peer) + peer_signature,
        });
        if self.sub == SubTxId::BeamRedeem {
            // Publishing the kernel is what reveals the preimage.
            kernel.preimage =
                Some(ctx.get_mandatory(SubTxId::BeamRedeem, ParameterId::PreImage)?);
        }

        let peer_share: curve25519_dalek::ristretto::RistrettoPoint =
            ctx.get_mandatory(SubTxId::BeamLock, ParameterId::PeerPublicSharedBlindingFactor)?;
        let input_commitment = crypto::value_tag(self.amount + self.fee)
            + crypto::to_public(&shared_blinding)
            + peer_share;

        let own_offset = self.published_offset(&shared_blinding);
        let peer_offset: Scalar = ctx.get_mandatory(self.sub, ParameterId::PeerOffset)?;

        Ok(Transaction {
            inputs: vec![Input {
                commitment: input_commitment,
            }],
            outputs: out_coins
                .iter()
                .map(|coin| Output::new(coin.amount, &ctx.keychain.coin_key(coin.id)))
                .collect(),
            kernels: vec![kernel],
            offset: own_offset + peer_offset,
        })
    }

    fn shared_blinding(&self) -> Result<Option<Scalar>> {
        let blinding = self
            .ctx
            .get(SubTxId::BeamLock, ParameterId::SharedBlindingFactor)?;
        let peer_share: Option<curve25519_dalek::ristretto::RistrettoPoint> = self
            .ctx
            .get(SubTxId::BeamLock, ParameterId::PeerPublicSharedBlindingFactor)?;

        Ok(match (blinding, peer_share) {
            (Some(blinding), Some(_)) => Some(blinding),
            _ => None,
        })
    }

    /// The redeem kernel's lock image: the preimage holder hashes its own
    /// secret, the counterparty uses the image the holder sent along with
    /// the invitation.
    fn lock_image(&self) -> Result<Option<SecretHash>> {
        if let Some(preimage) = self
            .ctx
            .get(SubTxId::BeamRedeem, ParameterId::PreImage)?
        {
            return Ok(Some(SecretHash::new(preimage)));
        }

        self.ctx.get(self.sub, ParameterId::PeerLockImage)
    }

    fn init_outputs(&self) -> Result<()> {
        let ctx = self.ctx;
        if ctx.get::<Vec<Coin>>(self.sub, ParameterId::Outputs)?.is_some() {
            return Ok(());
        }

        let outputs = if self.is_owner {
            vec![ctx.wallet.allocate_coin(self.amount)?]
        } else {
            Vec::new()
        };
        ctx.put(self.sub, ParameterId::Outputs, &outputs)?;

        Ok(())
    }

    fn signer(&self, hash_lock: Option<SecretHash>) -> Result<KernelSigner> {
        let ctx = self.ctx;

        let out_coins: Vec<Coin> = ctx
            .get(self.sub, ParameterId::Outputs)?
            .unwrap_or_default();

        let mut blinding_sum = Scalar::ZERO;
        for coin in &out_coins {
            blinding_sum += ctx.keychain.coin_key(coin.id);
        }

        let path = kernel_path(ctx.id, self.sub);
        let excess = blinding_sum + ctx.keychain.kernel_offset(&path);
        let nonce = ctx.keychain.kernel_nonce(&path);

        Ok(KernelSigner::new(
            self.fee,
            self.min_height,
            hash_lock,
            excess,
            nonce,
        ))
    }

    /// The published offset share, bumped by the shared blinding: the
    /// spent joint output's blinding cancels out of the kernel excess.
    fn published_offset(&self, shared_blinding: &Scalar) -> Scalar {
        let path = kernel_path(self.ctx.id, self.sub);

        self.ctx.keychain.kernel_offset(&path) + shared_blinding
    }

    fn peer_kernel(&self) -> Result<Option<PeerKernel>> {
        let excess = self.ctx.get(self.sub, ParameterId::PeerPublicExcess)?;
        let nonce = self.ctx.get(self.sub, ParameterId::PeerPublicNonce)?;

        Ok(match (excess, nonce) {
            (Some(excess), Some(nonce)) => Some(PeerKernel { excess, nonce }),
            _ => None,
        })
    }

    async fn send_invitation(
        &self,
        signer: &KernelSigner,
        hash_lock: Option<SecretHash>,
    ) -> Result<()> {
        let ctx = self.ctx;

        ctx.put(self.sub, ParameterId::Fee, &self.fee)?;
        ctx.put(self.sub, ParameterId::MinHeight, &self.min_height)?;

        let mut msg = ctx
            .message(self.sub)
            .with(ParameterId::Fee, &self.fee)?
            .with(ParameterId::MinHeight, &self.min_height)?
            .with(ParameterId::PeerPublicExcess, &signer.public_excess())?
            .with(ParameterId::PeerPublicNonce, &signer.public_nonce())?;

        if let Some(image) = hash_lock {
            msg = msg.with(ParameterId::PeerLockImage, &image)?;
        }

        ctx.send(msg).await
    }
}
