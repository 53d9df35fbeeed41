//! Partial-Schnorr kernel co-signing shared by the lock and withdraw
//! builders.

use crate::{
    beam::{Amount, Height, Kernel},
    crypto,
    params::SubTxId,
    secret::SecretHash,
    swap_id::SwapId,
};
use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};

/// Derivation path for a sub-transaction's kernel secrets.
pub(crate) fn kernel_path(tx_id: SwapId, sub_tx: SubTxId) -> Vec<u8> {
    let mut path = Vec::with_capacity(17);
    path.extend_from_slice(tx_id.as_bytes());
    path.push(sub_tx.into());

    path
}

/// The counterparty's public signing material.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PeerKernel {
    pub excess: RistrettoPoint,
    pub nonce: RistrettoPoint,
}

/// One party's half of a two-party kernel signature.
pub(crate) struct KernelSigner {
    fee: Amount,
    min_height: Height,
    hash_lock: Option<SecretHash>,
    excess_secret: Scalar,
    nonce_secret: Scalar,
}

impl KernelSigner {
    pub fn new(
        fee: Amount,
        min_height: Height,
        hash_lock: Option<SecretHash>,
        excess_secret: Scalar,
        nonce_secret: Scalar,
    ) -> Self {
        KernelSigner {
            fee,
            min_height,
            hash_lock,
            excess_secret,
            nonce_secret,
        }
    }

    pub fn public_excess(&self) -> RistrettoPoint {
        crypto::to_public(&self.excess_secret)
    }

    pub fn public_nonce(&self) -> RistrettoPoint {
        crypto::to_public(&self.nonce_secret)
    }

    /// The unsigned kernel under the aggregate excess.
    pub fn kernel(&self, peer: &PeerKernel) -> Kernel {
        Kernel::new(
            self.fee,
            self.min_height,
            self.hash_lock,
            self.public_excess() + peer.excess,
        )
    }

    fn challenge(&self, peer: &PeerKernel) -> Scalar {
        let kernel = self.kernel(peer);
        crypto::challenge(
            &(self.public_nonce() + peer.nonce),
            &kernel.excess,
            &kernel.message(),
        )
    }

    pub fn sign_partial(&self, peer: &PeerKernel) -> Scalar {
        crypto::sign_partial(&self.excess_secret, &self.nonce_secret, &self.challenge(peer))
    }

    /// Rejecting an invalid partial here is what stops a sub-transaction
    /// from ever advancing past the round it was received in.
    pub fn verify_peer(&self, partial: &Scalar, peer: &PeerKernel) -> bool {
        crypto::verify_partial(partial, &peer.nonce, &peer.excess, &self.challenge(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beam::KernelSignature;
    use rand::thread_rng;

    fn random_scalar() -> Scalar {
        Scalar::random(&mut thread_rng())
    }

    fn signer(hash_lock: Option<SecretHash>) -> KernelSigner {
        KernelSigner::new(100, 50, hash_lock, random_scalar(), random_scalar())
    }

    fn peer_view(of: &KernelSigner) -> PeerKernel {
        PeerKernel {
            excess: of.public_excess(),
            nonce: of.public_nonce(),
        }
    }

    #[test]
    fn combined_partials_form_a_valid_kernel_signature() {
        let (a, b) = (signer(None), signer(None));

        let s_a = a.sign_partial(&peer_view(&b));
        let s_b = b.sign_partial(&peer_view(&a));

        assert!(a.verify_peer(&s_b, &peer_view(&b)));
        assert!(b.verify_peer(&s_a, &peer_view(&a)));

        let mut kernel = a.kernel(&peer_view(&b));
        kernel.signature = Some(KernelSignature {
            nonce: a.public_nonce() + b.public_nonce(),
            s: s_a + s_b,
        });

        assert!(kernel.verify());
    }

    #[test]
    fn hash_lock_changes_the_challenge() {
        let image = SecretHash::new(crate::secret::Secret::from([1u8; 32]));
        let (x, k) = (random_scalar(), random_scalar());

        let with_lock = KernelSigner::new(100, 50, Some(image), x, k);
        let without_lock = KernelSigner::new(100, 50, None, x, k);
        let peer = signer(Some(image));

        // A partial signed without the lock image must not verify against
        // the hash-locked kernel.
        let unbound = without_lock.sign_partial(&peer_view(&peer));
        assert!(!peer.verify_peer(&unbound, &peer_view(&with_lock)));

        let bound = with_lock.sign_partial(&peer_view(&peer));
        assert!(peer.verify_peer(&bound, &peer_view(&with_lock)));
    }
}
