//! Ristretto-based primitives for the confidential chain: Pedersen
//! commitments, deterministic key derivation and two-party Schnorr
//! kernel signing.
//!
//! Commitments follow the `C = v·H + r·G` convention where `H` is the
//! value generator (`PedersenGens::B`) and `G` the blinding generator
//! (`PedersenGens::B_blinding`). Kernel excesses and nonces live on `G`.

pub mod range_proof;

use bulletproofs::PedersenGens;
use conquer_once::Lazy;
use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};
use sha2::{Digest, Sha256, Sha512};

pub static PEDERSEN_GENS: Lazy<PedersenGens> = Lazy::new(PedersenGens::default);

/// `v·H + r·G`.
pub fn commit(value: u64, blinding: &Scalar) -> RistrettoPoint {
    PEDERSEN_GENS.commit(Scalar::from(value), *blinding)
}

/// `v·H`, the value component of a commitment.
pub fn value_tag(value: u64) -> RistrettoPoint {
    Scalar::from(value) * PEDERSEN_GENS.B
}

/// `r·G`, the public image of a blinding factor or kernel secret.
pub fn to_public(secret: &Scalar) -> RistrettoPoint {
    *secret * PEDERSEN_GENS.B_blinding
}

/// Deterministic scalar derivation rooted at a 32-byte master secret.
///
/// Children are stable across restarts, which is what makes interrupted
/// negotiations resumable: re-deriving a key or nonce for the same
/// `(label, path)` always yields the same scalar.
#[derive(Clone)]
pub struct KeyChain {
    master: [u8; 32],
}

impl KeyChain {
    pub fn new(master: [u8; 32]) -> Self {
        KeyChain { master }
    }

    pub fn derive(&self, label: &'static [u8], path: &[u8]) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update(b"mwswap.keychain");
        hasher.update(self.master);
        hasher.update((label.len() as u64).to_le_bytes());
        hasher.update(label);
        hasher.update(path);

        Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
    }

    /// Blinding factor for a regular wallet coin.
    pub fn coin_key(&self, coin_id: u64) -> Scalar {
        self.derive(b"coin", &coin_id.to_le_bytes())
    }

    /// Blinding-factor share for a jointly owned output.
    pub fn shared_coin_key(&self, coin_id: u64) -> Scalar {
        self.derive(b"shared-coin", &coin_id.to_le_bytes())
    }

    /// Per-kernel excess offset base.
    pub fn kernel_offset(&self, path: &[u8]) -> Scalar {
        self.derive(b"kernel-offset", path)
    }

    /// Per-kernel signing nonce.
    pub fn kernel_nonce(&self, path: &[u8]) -> Scalar {
        self.derive(b"kernel-nonce", path)
    }
}

/// Schnorr challenge binding the aggregate nonce, aggregate excess and
/// the kernel message.
pub fn challenge(
    total_nonce: &RistrettoPoint,
    total_excess: &RistrettoPoint,
    message: &[u8; 32],
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(b"mwswap.kernel.challenge");
    hasher.update(total_nonce.compress().as_bytes());
    hasher.update(total_excess.compress().as_bytes());
    hasher.update(message);

    Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
}

/// `s_i = k_i + e·x_i`.
pub fn sign_partial(excess: &Scalar, nonce: &Scalar, challenge: &Scalar) -> Scalar {
    nonce + challenge * excess
}

/// Checks `s_peer·G == N_peer + e·X_peer`.
pub fn verify_partial(
    partial: &Scalar,
    public_nonce: &RistrettoPoint,
    public_excess: &RistrettoPoint,
    challenge: &Scalar,
) -> bool {
    to_public(partial) == public_nonce + challenge * public_excess
}

/// Range-proof seed, bound to the prover's blinding share and the value.
pub fn generate_seed(blinding: &Scalar, value: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"mwswap.proof-seed");
    hasher.update(blinding.as_bytes());
    hasher.update(value.to_le_bytes());

    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn random_scalar() -> Scalar {
        Scalar::random(&mut thread_rng())
    }

    #[test]
    fn commitment_is_additively_homomorphic_in_the_blinding() {
        let r_self = random_scalar();
        let r_peer = random_scalar();

        let joint = commit(42, &(r_self + r_peer));
        let assembled = to_public(&r_self) + to_public(&r_peer) + value_tag(42);

        assert_eq!(joint, assembled);
    }

    #[test]
    fn derived_keys_are_stable_and_distinct() {
        let chain = KeyChain::new([9u8; 32]);

        assert_eq!(chain.shared_coin_key(7), chain.shared_coin_key(7));
        assert_ne!(chain.shared_coin_key(7), chain.shared_coin_key(8));
        assert_ne!(chain.shared_coin_key(7), chain.coin_key(7));
    }

    #[test]
    fn partial_signatures_combine_into_a_valid_schnorr_signature() {
        let (x1, x2) = (random_scalar(), random_scalar());
        let (k1, k2) = (random_scalar(), random_scalar());

        let total_excess = to_public(&x1) + to_public(&x2);
        let total_nonce = to_public(&k1) + to_public(&k2);
        let message = [3u8; 32];

        let e = challenge(&total_nonce, &total_excess, &message);
        let s1 = sign_partial(&x1, &k1, &e);
        let s2 = sign_partial(&x2, &k2, &e);

        assert!(verify_partial(&s1, &to_public(&k1), &to_public(&x1), &e));
        assert!(verify_partial(&s2, &to_public(&k2), &to_public(&x2), &e));

        // The sum is a valid plain Schnorr signature under the sum key.
        let s = s1 + s2;
        assert_eq!(to_public(&s), total_nonce + e * total_excess);
    }

    #[test]
    fn tampered_partial_signature_does_not_verify() {
        let x = random_scalar();
        let k = random_scalar();
        let e = challenge(&to_public(&k), &to_public(&x), &[1u8; 32]);

        let s = sign_partial(&x, &k, &e) + Scalar::ONE;

        assert!(!verify_partial(&s, &to_public(&k), &to_public(&x), &e));
    }
}
