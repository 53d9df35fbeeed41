//! Three-round construction of the jointly owned output and the lock
//! transaction that creates it.
//!
//! Round 1 exchanges kernel excesses and nonces, round 2 exchanges the
//! shared-proof `Part2` material together with partial signatures and
//! offsets, round 3 completes the proof. Only the sender ever holds the
//! finished transaction.

use super::{
    kernel::{kernel_path, KernelSigner, PeerKernel},
    FailureReason, SubTxState, SwapCtx,
};
use crate::{
    beam::{Amount, Coin, Height, Input, KernelSignature, Output, Transaction},
    crypto::{
        self,
        range_proof::{self, ProofMultiSig, ProofPart2, ProofPart3, RangeProof},
    },
    params::ParameterId,
};
use anyhow::{anyhow, Result};
use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};

use crate::params::SubTxId;

const SUB: SubTxId = SubTxId::BeamLock;

pub(crate) struct LockTxBuilder<'a> {
    ctx: &'a SwapCtx<'a>,
    amount: Amount,
    fee: Amount,
    min_height: Height,
    is_sender: bool,
    is_initiator: bool,
}

struct SharedParams {
    blinding: Scalar,
    seed: [u8; 32],
}

impl<'a> LockTxBuilder<'a> {
    pub fn new(
        ctx: &'a SwapCtx<'a>,
        amount: Amount,
        fee: Amount,
        min_height: Height,
        is_sender: bool,
        is_initiator: bool,
    ) -> Self {
        LockTxBuilder {
            ctx,
            amount,
            fee,
            min_height,
            is_sender,
            is_initiator,
        }
    }

    pub async fn advance(&self) -> Result<SubTxState> {
        let ctx = self.ctx;
        let mut state = ctx.sub_state(SUB)?;
        if state == SubTxState::Constructed {
            return Ok(state);
        }

        if state == SubTxState::Initial {
            self.init_io()?;
        }

        let signer = self.signer()?;

        let peer = match self.peer_kernel()? {
            Some(peer) => peer,
            None => {
                if state == SubTxState::Initial && self.is_initiator {
                    self.send_invitation(&signer).await?;
                    ctx.set_sub_state(SUB, SubTxState::Invitation)?;
                    state = SubTxState::Invitation;
                }
                return Ok(state);
            }
        };

        let shared = self.load_shared()?;

        if state <= SubTxState::Invitation {
            if self.is_sender {
                // The proof producer cannot move before the peer's share
                // of the commitment and its Part2 contribution are here.
                // Answering with our own invitation keeps the exchange
                // alive when the peer initiated.
                let peer_share: Option<RistrettoPoint> =
                    ctx.get(SUB, ParameterId::PeerPublicSharedBlindingFactor)?;
                let peer_part2: Option<ProofPart2> =
                    ctx.get(SUB, ParameterId::PeerSharedBulletProofPart2)?;

                let (peer_share, peer_part2) = match (peer_share, peer_part2) {
                    (Some(share), Some(part2)) => (share, part2),
                    _ => {
                        if state == SubTxState::Initial {
                            self.send_invitation(&signer).await?;
                            ctx.set_sub_state(SUB, SubTxState::Invitation)?;
                            state = SubTxState::Invitation;
                        }
                        return Ok(state);
                    }
                };

                let commitment = self.shared_commitment(&shared, &peer_share);
                let mut proof = RangeProof::default();
                let multisig =
                    proof.cosign_step2(&shared.seed, self.amount, &commitment, &peer_part2);
                ctx.put(SUB, ParameterId::SharedBulletProof, &proof)?;

                let partial = signer.sign_partial(&peer);
                let offset = self.published_offset(&shared);
                ctx.put(SUB, ParameterId::Offset, &offset)?;

                let msg = ctx
                    .message(SUB)
                    .with(ParameterId::PeerSignature, &partial)?
                    .with(ParameterId::PeerOffset, &offset)?
                    .with(
                        ParameterId::PeerPublicSharedBlindingFactor,
                        &crypto::to_public(&shared.blinding),
                    )?
                    .with(ParameterId::PeerSharedBulletProofMSig, &multisig)?;
                ctx.send(msg).await?;
            } else {
                let mut part2 = ProofPart2::default();
                range_proof::cosign_part2(&shared.seed, &mut part2);

                let partial = signer.sign_partial(&peer);
                let offset = self.published_offset(&shared);
                ctx.put(SUB, ParameterId::Offset, &offset)?;

                // Excess and nonce ride along again so the exchange works
                // regardless of which side invited first.
                let msg = ctx
                    .message(SUB)
                    .with(ParameterId::PeerPublicExcess, &signer.public_excess())?
                    .with(ParameterId::PeerPublicNonce, &signer.public_nonce())?
                    .with(ParameterId::PeerSignature, &partial)?
                    .with(ParameterId::PeerOffset, &offset)?
                    .with(
                        ParameterId::PeerPublicSharedBlindingFactor,
                        &crypto::to_public(&shared.blinding),
                    )?
                    .with(ParameterId::PeerSharedBulletProofPart2, &part2)?;
                ctx.send(msg).await?;
            }

            ctx.set_sub_state(SUB, SubTxState::SharedUtxoProofPart2)?;
            return Ok(SubTxState::SharedUtxoProofPart2);
        }

        let peer_signature: Scalar = match ctx.get(SUB, ParameterId::PeerSignature)? {
            Some(signature) => signature,
            None => return Ok(state),
        };
        if !signer.verify_peer(&peer_signature, &peer) {
            return Err(FailureReason::PeerSignatureInvalid.into());
        }

        if self.is_sender {
            let part3: ProofPart3 = match ctx.get(SUB, ParameterId::PeerSharedBulletProofPart3)? {
                Some(part3) => part3,
                None => return Ok(state),
            };

            let peer_share: RistrettoPoint =
                ctx.get_mandatory(SUB, ParameterId::PeerPublicSharedBlindingFactor)?;
            let commitment = self.shared_commitment(&shared, &peer_share);

            let mut proof: RangeProof = ctx.get_mandatory(SUB, ParameterId::SharedBulletProof)?;
            proof.cosign_finalize(&shared.seed, self.amount, &shared.blinding, &commitment, &part3);
            if !proof.verify(&commitment) {
                return Err(FailureReason::InvalidTransaction.into());
            }
            ctx.put(SUB, ParameterId::SharedBulletProof, &proof)?;
        } else {
            let multisig: ProofMultiSig =
                match ctx.get(SUB, ParameterId::PeerSharedBulletProofMSig)? {
                    Some(multisig) => multisig,
                    None => return Ok(state),
                };

            let mut part3 = ProofPart3::default();
            multisig.cosign_part3(&shared.seed, &shared.blinding, &mut part3);

            let msg = ctx
                .message(SUB)
                .with(ParameterId::PeerSharedBulletProofPart3, &part3)?;
            ctx.send(msg).await?;
        }

        ctx.put(SUB, ParameterId::KernelId, &signer.kernel(&peer).id())?;
        ctx.set_sub_state(SUB, SubTxState::Constructed)?;

        Ok(SubTxState::Constructed)
    }

    /// The finished lock transaction; only meaningful on the sender past
    /// `Constructed`.
    pub fn build_transaction(&self) -> Result<Transaction> {
        let ctx = self.ctx;

        let input_coins: Vec<Coin> = ctx.get_mandatory(SUB, ParameterId::Inputs)?;
        let change_coins: Vec<Coin> = ctx.get_mandatory(SUB, ParameterId::Outputs)?;
        let shared = self.load_shared()?;
        let peer_share: RistrettoPoint =
            ctx.get_mandatory(SUB, ParameterId::PeerPublicSharedBlindingFactor)?;
        let proof: RangeProof = ctx.get_mandatory(SUB, ParameterId::SharedBulletProof)?;

        let signer = self.signer()?;
        let peer = self
            .peer_kernel()?
            .ok_or_else(|| anyhow!("lock transaction is not fully negotiated"))?;
        let peer_signature: Scalar = ctx.get_mandatory(SUB, ParameterId::PeerSignature)?;

        let mut kernel = signer.kernel(&peer);
        kernel.signature = Some(KernelSignature {
            nonce: signer.public_nonce() + peer.nonce,
            s: signer.sign_partial(&peer) + peer_signature,
        });

        let mut outputs: Vec<Output> = change_coins
            .iter()
            .map(|coin| Output::new(coin.amount, &ctx.keychain.coin_key(coin.id)))
            .collect();
        outputs.push(Output {
            commitment: self.shared_commitment(&shared, &peer_share),
            proof,
        });

        let own_offset: Scalar = ctx.get_mandatory(SUB, ParameterId::Offset)?;
        let peer_offset: Scalar = ctx.get_mandatory(SUB, ParameterId::PeerOffset)?;

        Ok(Transaction {
            inputs: input_coins
                .iter()
                .map(|coin| Input {
                    commitment: crypto::commit(coin.amount, &ctx.keychain.coin_key(coin.id)),
                })
                .collect(),
            outputs,
            kernels: vec![kernel],
            offset: own_offset + peer_offset,
        })
    }

    /// The joint commitment `C = v·H + r_self·G + R_peer`.
    fn shared_commitment(&self, shared: &SharedParams, peer_share: &RistrettoPoint) -> RistrettoPoint {
        crypto::value_tag(self.amount) + crypto::to_public(&shared.blinding) + peer_share
    }

    fn init_io(&self) -> Result<()> {
        let ctx = self.ctx;
        if ctx.get::<Vec<Coin>>(SUB, ParameterId::Inputs)?.is_some() {
            return Ok(());
        }

        if self.is_sender {
            let coins = ctx.wallet.select_coins(self.amount + self.fee)?;
            let total: Amount = coins.iter().map(|coin| coin.amount).sum();
            ctx.put(SUB, ParameterId::Inputs, &coins)?;

            let change = total - self.amount - self.fee;
            let mut outputs = Vec::new();
            if change > 0 {
                outputs.push(ctx.wallet.allocate_coin(change)?);
            }
            ctx.put(SUB, ParameterId::Outputs, &outputs)?;
        } else {
            ctx.put(SUB, ParameterId::Inputs, &Vec::<Coin>::new())?;
            ctx.put(SUB, ParameterId::Outputs, &Vec::<Coin>::new())?;
        }

        Ok(())
    }

    fn signer(&self) -> Result<KernelSigner> {
        let ctx = self.ctx;

        let input_coins: Vec<Coin> = ctx.get_mandatory(SUB, ParameterId::Inputs)?;
        let change_coins: Vec<Coin> = ctx.get_mandatory(SUB, ParameterId::Outputs)?;

        let mut blinding_sum = Scalar::ZERO;
        for coin in &change_coins {
            blinding_sum += ctx.keychain.coin_key(coin.id);
        }
        for coin in &input_coins {
            blinding_sum -= ctx.keychain.coin_key(coin.id);
        }

        let path = kernel_path(ctx.id, SUB);
        let excess = blinding_sum + ctx.keychain.kernel_offset(&path);
        let nonce = ctx.keychain.kernel_nonce(&path);

        Ok(KernelSigner::new(self.fee, self.min_height, None, excess, nonce))
    }

    /// The published offset share. Decreasing it by the shared blinding
    /// is what keeps the joint output's blinding out of the kernel
    /// excess.
    fn published_offset(&self, shared: &SharedParams) -> Scalar {
        let path = kernel_path(self.ctx.id, SUB);

        self.ctx.keychain.kernel_offset(&path) - shared.blinding
    }

    fn peer_kernel(&self) -> Result<Option<PeerKernel>> {
        let excess = self.ctx.get(SUB, ParameterId::PeerPublicExcess)?;
        let nonce = self.ctx.get(SUB, ParameterId::PeerPublicNonce)?;

        Ok(match (excess, nonce) {
            (Some(excess), Some(nonce)) => Some(PeerKernel { excess, nonce }),
            _ => None,
        })
    }

    fn load_shared(&self) -> Result<SharedParams> {
        let ctx = self.ctx;

        if let Some(blinding) = ctx.get(SUB, ParameterId::SharedBlindingFactor)? {
            let seed = ctx.get_mandatory(SUB, ParameterId::SharedSeed)?;

            return Ok(SharedParams { blinding, seed });
        }

        let coin = ctx.wallet.allocate_coin(self.amount)?;
        let blinding = ctx.keychain.shared_coin_key(coin.id);
        let seed = crypto::generate_seed(&blinding, self.amount);

        ctx.put(SUB, ParameterId::SharedCoinId, &coin)?;
        ctx.put(SUB, ParameterId::SharedBlindingFactor, &blinding)?;
        ctx.put(SUB, ParameterId::SharedSeed, &seed)?;

        Ok(SharedParams { blinding, seed })
    }

    async fn send_invitation(&self, signer: &KernelSigner) -> Result<()> {
        let ctx = self.ctx;

        ctx.put(SUB, ParameterId::Fee, &self.fee)?;
        ctx.put(SUB, ParameterId::MinHeight, &self.min_height)?;

        let msg = ctx
            .message(SUB)
            .with(ParameterId::Fee, &self.fee)?
            .with(ParameterId::MinHeight, &self.min_height)?
            .with(ParameterId::PeerPublicExcess, &signer.public_excess())?
            .with(ParameterId::PeerPublicNonce, &signer.public_nonce())?;

        ctx.send(msg).await
    }
}
