//! Data model of the confidential chain: commitments, kernels and
//! transactions, plus the traits through which the engine reaches the
//! node and the ambient wallet.

use crate::{
    crypto::{self, range_proof::RangeProof},
    secret::{Secret, SecretHash},
    swap_id::SwapId,
};
use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar, traits::Identity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub type Amount = u64;
pub type Height = u64;

/// Hash identifying a kernel independently of its signature, stable from
/// the moment the kernel is constructed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelId([u8; 32]);

impl fmt::Debug for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelId({})", hex::encode(self.0))
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(hex::encode(self.0).as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Input {
    pub commitment: RistrettoPoint,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Output {
    pub commitment: RistrettoPoint,
    pub proof: RangeProof,
}

impl Output {
    /// A fully owned output with a single-signer range proof.
    pub fn new(value: Amount, blinding: &Scalar) -> Output {
        let commitment = crypto::commit(value, blinding);
        let seed = crypto::generate_seed(blinding, value);
        let proof = RangeProof::sign(&seed, value, blinding, &commitment);

        Output { commitment, proof }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct KernelSignature {
    pub nonce: RistrettoPoint,
    pub s: Scalar,
}

/// The authorization proof of a transaction: an aggregate Schnorr
/// signature over the aggregate excess, optionally hash-locked.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Kernel {
    pub fee: Amount,
    pub min_height: Height,
    pub hash_lock: Option<SecretHash>,
    pub excess: RistrettoPoint,
    pub signature: Option<KernelSignature>,
    /// Preimage of `hash_lock`, attached when the kernel is published.
    /// Reading it back off the chain is what makes the swap atomic.
    pub preimage: Option<Secret>,
}

impl Kernel {
    pub fn new(
        fee: Amount,
        min_height: Height,
        hash_lock: Option<SecretHash>,
        excess: RistrettoPoint,
    ) -> Kernel {
        Kernel {
            fee,
            min_height,
            hash_lock,
            excess,
            signature: None,
            preimage: None,
        }
    }

    /// The message bound by the kernel signature: fee, height bound and
    /// hash lock. The lock image being part of the challenge is what ties
    /// the published preimage to this particular kernel.
    pub fn message(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"mwswap.kernel");
        hasher.update(self.fee.to_le_bytes());
        hasher.update(self.min_height.to_le_bytes());
        match &self.hash_lock {
            Some(image) => {
                hasher.update([1u8]);
                hasher.update(image.as_raw());
            }
            None => hasher.update([0u8]),
        }

        hasher.finalize().into()
    }

    pub fn id(&self) -> KernelId {
        let mut hasher = Sha256::new();
        hasher.update(b"mwswap.kernel-id");
        hasher.update(self.excess.compress().as_bytes());
        hasher.update(self.message());

        KernelId(hasher.finalize().into())
    }

    pub fn verify(&self) -> bool {
        let signature = match &self.signature {
            Some(signature) => signature,
            None => return false,
        };

        let e = crypto::challenge(&signature.nonce, &self.excess, &self.message());
        if crypto::to_public(&signature.s) != signature.nonce + e * self.excess {
            return false;
        }

        match (&self.hash_lock, &self.preimage) {
            (Some(image), Some(preimage)) => SecretHash::new(*preimage) == *image,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<Kernel>,
    pub offset: Scalar,
}

impl Transaction {
    /// Validity predicate: every kernel signature verifies (hash-locked
    /// kernels must carry their preimage), every output has a valid range
    /// proof, and the commitments balance:
    ///
    /// `Σ C_out − Σ C_in + fee·H == Σ excess + offset·G`
    pub fn is_valid(&self) -> bool {
        if self.kernels.is_empty() {
            return false;
        }

        if !self.kernels.iter().all(Kernel::verify) {
            return false;
        }

        if !self
            .outputs
            .iter()
            .all(|output| output.proof.verify(&output.commitment))
        {
            return false;
        }

        let fee: Amount = self.kernels.iter().map(|kernel| kernel.fee).sum();

        let mut lhs = crypto::value_tag(fee) + crypto::to_public(&self.offset);
        for output in &self.outputs {
            lhs += output.commitment;
        }
        for input in &self.inputs {
            lhs -= input.commitment;
        }

        let mut rhs = RistrettoPoint::identity();
        for kernel in &self.kernels {
            rhs += kernel.excess;
        }

        lhs == rhs
    }
}

/// A wallet coin: an id the key chain can derive a blinding factor from,
/// plus its value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Coin {
    pub id: u64,
    pub amount: Amount,
}

/// Coin selection against the ambient wallet database.
pub trait Wallet: Send + Sync {
    /// Spendable coins whose sum covers at least `target`.
    fn select_coins(&self, target: Amount) -> anyhow::Result<Vec<Coin>>;

    /// Allocates a fresh coin id for an output about to be created.
    fn allocate_coin(&self, amount: Amount) -> anyhow::Result<Coin>;
}

/// Gateway to a node of the confidential chain.
#[async_trait::async_trait]
pub trait BeamNode: Send + Sync {
    /// Broadcasts a transaction. Returns whether the node accepted it;
    /// inclusion is only ever learnt through [`BeamNode::confirm_kernel`].
    async fn register_tx(&self, tx_id: SwapId, tx: Transaction) -> anyhow::Result<bool>;

    /// Height at which the kernel was proven, if it is on chain.
    async fn confirm_kernel(&self, kernel_id: KernelId) -> anyhow::Result<Option<Height>>;

    /// The full kernel body as mined, including an attached preimage.
    async fn get_kernel(&self, kernel_id: KernelId) -> anyhow::Result<Option<Kernel>>;

    async fn get_tip(&self) -> anyhow::Result<Height>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{challenge, sign_partial, to_public};
    use rand::thread_rng;

    fn random_scalar() -> Scalar {
        Scalar::random(&mut thread_rng())
    }

    fn sign_kernel(kernel: &mut Kernel, excess_secret: &Scalar) {
        let nonce_secret = random_scalar();
        let nonce = to_public(&nonce_secret);
        let e = challenge(&nonce, &kernel.excess, &kernel.message());

        kernel.signature = Some(KernelSignature {
            nonce,
            s: sign_partial(excess_secret, &nonce_secret, &e),
        });
    }

    fn simple_transaction() -> (Transaction, Scalar) {
        let r_in = random_scalar();
        let r_out = random_scalar();
        let offset = random_scalar();
        let fee = 10;

        let excess_secret = r_out - r_in + offset;
        let mut kernel = Kernel::new(fee, 0, None, to_public(&excess_secret));
        sign_kernel(&mut kernel, &excess_secret);

        let tx = Transaction {
            inputs: vec![Input {
                commitment: crypto::commit(100, &r_in),
            }],
            outputs: vec![Output::new(90, &r_out)],
            kernels: vec![kernel],
            offset,
        };

        (tx, excess_secret)
    }

    #[test]
    fn balanced_transaction_is_valid() {
        let (tx, _) = simple_transaction();

        assert!(tx.is_valid());
    }

    #[test]
    fn transaction_with_inflated_output_is_invalid() {
        let (mut tx, _) = simple_transaction();

        let r_forged = random_scalar();
        tx.outputs[0] = Output::new(91, &r_forged);

        assert!(!tx.is_valid());
    }

    #[test]
    fn hash_locked_kernel_requires_matching_preimage() {
        let secret = Secret::from([5u8; 32]);
        let excess_secret = random_scalar();
        let mut kernel = Kernel::new(
            0,
            0,
            Some(SecretHash::new(secret)),
            to_public(&excess_secret),
        );
        sign_kernel(&mut kernel, &excess_secret);

        assert!(!kernel.verify());

        kernel.preimage = Some(Secret::from([6u8; 32]));
        assert!(!kernel.verify());

        kernel.preimage = Some(secret);
        assert!(kernel.verify());
    }

    #[test]
    fn kernel_id_is_stable_before_and_after_signing() {
        let excess_secret = random_scalar();
        let mut kernel = Kernel::new(25, 100, None, to_public(&excess_secret));

        let id_before = kernel.id();
        sign_kernel(&mut kernel, &excess_secret);

        assert_eq!(kernel.id(), id_before);
    }
}
