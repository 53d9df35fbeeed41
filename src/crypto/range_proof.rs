//! Two-party co-signed range proof for a jointly blinded Pedersen
//! commitment.
//!
//! Both parties know the committed value; the blinding factor is the sum
//! of per-party shares. Only the blinding-dependent pieces of the proof
//! are therefore split: the `T1`/`T2` polynomial commitments and the
//! `tau_x` response combine additively across parties, everything else is
//! produced by the designated proof producer. The proof keeps the
//! uncompressed `l`/`r` vectors, trading size for a protocol whose
//! multi-party rounds stay plain additions.
//!
//! Round trip:
//! 1. non-producer: [`cosign_part2`] → `ProofPart2` (nonce shares)
//! 2. producer: [`RangeProof::cosign_step2`] → `ProofMultiSig` (challenges)
//! 3. non-producer: [`ProofMultiSig::cosign_part3`] → `ProofPart3`
//! 4. producer: [`RangeProof::cosign_finalize`], then [`RangeProof::verify`]
//!
//! All prover randomness is derived from the caller's seed, so an
//! interrupted negotiation recomputes identical shares after a restart.

use crate::crypto::PEDERSEN_GENS;
use bulletproofs::BulletproofGens;
use conquer_once::Lazy;
use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar, traits::Identity};
use merlin::Transcript;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

const BITS: usize = 64;

struct VectorGens {
    g: Vec<RistrettoPoint>,
    h: Vec<RistrettoPoint>,
}

static VECTOR_GENS: Lazy<VectorGens> = Lazy::new(|| {
    let gens = BulletproofGens::new(BITS, 1);
    let share = gens.share(0);

    VectorGens {
        g: share.G(BITS).copied().collect(),
        h: share.H(BITS).copied().collect(),
    }
});

/// Additive `T1`/`T2` shares contributed by the non-producer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProofPart2 {
    pub t1: RistrettoPoint,
    pub t2: RistrettoPoint,
}

impl Default for ProofPart2 {
    fn default() -> Self {
        ProofPart2 {
            t1: RistrettoPoint::identity(),
            t2: RistrettoPoint::identity(),
        }
    }
}

/// Additive `tau_x` share contributed by the non-producer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProofPart3 {
    pub tau_x: Scalar,
}

impl Default for ProofPart3 {
    fn default() -> Self {
        ProofPart3 {
            tau_x: Scalar::ZERO,
        }
    }
}

/// The challenges fixed by the producer's transcript, handed to the
/// non-producer so it can compute its `tau_x` share.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProofMultiSig {
    pub x: Scalar,
    pub z: Scalar,
}

impl ProofMultiSig {
    pub fn cosign_part3(&self, seed: &[u8; 32], blinding_share: &Scalar, part3: &mut ProofPart3) {
        let tau1 = nonce(seed, b"tau1", 0);
        let tau2 = nonce(seed, b"tau2", 0);

        part3.tau_x += tau2 * self.x * self.x + tau1 * self.x + self.z * self.z * blinding_share;
    }
}

/// Mixes the non-producer's nonce shares into `part2`.
pub fn cosign_part2(seed: &[u8; 32], part2: &mut ProofPart2) {
    part2.t1 += nonce(seed, b"tau1", 0) * PEDERSEN_GENS.B_blinding;
    part2.t2 += nonce(seed, b"tau2", 0) * PEDERSEN_GENS.B_blinding;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RangeProof {
    a: RistrettoPoint,
    s: RistrettoPoint,
    t1: RistrettoPoint,
    t2: RistrettoPoint,
    tau_x: Scalar,
    mu: Scalar,
    t_hat: Scalar,
    l_vec: Vec<Scalar>,
    r_vec: Vec<Scalar>,
}

impl Default for RangeProof {
    fn default() -> Self {
        RangeProof {
            a: RistrettoPoint::identity(),
            s: RistrettoPoint::identity(),
            t1: RistrettoPoint::identity(),
            t2: RistrettoPoint::identity(),
            tau_x: Scalar::ZERO,
            mu: Scalar::ZERO,
            t_hat: Scalar::ZERO,
            l_vec: Vec::new(),
            r_vec: Vec::new(),
        }
    }
}

impl RangeProof {
    /// Single-signer proof for an output whose blinding is fully owned.
    pub fn sign(
        seed: &[u8; 32],
        value: u64,
        blinding: &Scalar,
        commitment: &RistrettoPoint,
    ) -> RangeProof {
        let mut proof = RangeProof::default();
        proof.cosign_step2(seed, value, commitment, &ProofPart2::default());
        proof.cosign_finalize(seed, value, blinding, commitment, &ProofPart3::default());

        proof
    }

    /// Producer round 2: absorb the peer's `Part2` shares, commit to the
    /// proof polynomial and fix the challenges.
    pub fn cosign_step2(
        &mut self,
        seed: &[u8; 32],
        value: u64,
        commitment: &RistrettoPoint,
        peer_part2: &ProofPart2,
    ) -> ProofMultiSig {
        let secrets = ProverSecrets::derive(seed);
        let poly = ProofPolynomial::new(value, &secrets);

        let mut a = secrets.alpha * PEDERSEN_GENS.B_blinding;
        let mut s = secrets.rho * PEDERSEN_GENS.B_blinding;
        for i in 0..BITS {
            a += poly.a_l[i] * VECTOR_GENS.g[i] + poly.a_r[i] * VECTOR_GENS.h[i];
            s += secrets.s_l[i] * VECTOR_GENS.g[i] + secrets.s_r[i] * VECTOR_GENS.h[i];
        }

        let mut transcript = oracle(commitment);
        append_point(&mut transcript, b"A", &a);
        append_point(&mut transcript, b"S", &s);
        let y = challenge_scalar(&mut transcript, b"y");
        let z = challenge_scalar(&mut transcript, b"z");

        let (t1_coeff, t2_coeff) = poly.t_coefficients(&y, &z);
        let t1 = t1_coeff * PEDERSEN_GENS.B + secrets.tau1 * PEDERSEN_GENS.B_blinding
            + peer_part2.t1;
        let t2 = t2_coeff * PEDERSEN_GENS.B + secrets.tau2 * PEDERSEN_GENS.B_blinding
            + peer_part2.t2;

        append_point(&mut transcript, b"T1", &t1);
        append_point(&mut transcript, b"T2", &t2);
        let x = challenge_scalar(&mut transcript, b"x");

        self.a = a;
        self.s = s;
        self.t1 = t1;
        self.t2 = t2;

        ProofMultiSig { x, z }
    }

    /// Producer final round: absorb the peer's `tau_x` share and emit the
    /// responses. Challenges are recomputed from the stored commitments,
    /// so a proof persisted after round 2 finalizes identically.
    pub fn cosign_finalize(
        &mut self,
        seed: &[u8; 32],
        value: u64,
        blinding_share: &Scalar,
        commitment: &RistrettoPoint,
        peer_part3: &ProofPart3,
    ) {
        let secrets = ProverSecrets::derive(seed);
        let poly = ProofPolynomial::new(value, &secrets);
        let (y, z, x) = self.challenges(commitment);

        let (l, r) = poly.evaluate(&y, &z, &x);

        self.t_hat = inner_product(&l, &r);
        self.mu = secrets.alpha + secrets.rho * x;
        self.tau_x = secrets.tau2 * x * x
            + secrets.tau1 * x
            + z * z * blinding_share
            + peer_part3.tau_x;
        self.l_vec = l;
        self.r_vec = r;
    }

    pub fn verify(&self, commitment: &RistrettoPoint) -> bool {
        if self.l_vec.len() != BITS || self.r_vec.len() != BITS {
            return false;
        }

        let (y, z, x) = self.challenges(commitment);

        if self.t_hat != inner_product(&self.l_vec, &self.r_vec) {
            return false;
        }

        let y_powers = powers(&y);
        let sum_y: Scalar = y_powers.iter().copied().sum();
        let sum_two = Scalar::from(u64::MAX); // Σ 2^i, i ∈ [0, 64)
        let delta = (z - z * z) * sum_y - z * z * z * sum_two;

        let lhs = self.t_hat * PEDERSEN_GENS.B + self.tau_x * PEDERSEN_GENS.B_blinding;
        let rhs = z * z * commitment + delta * PEDERSEN_GENS.B + x * self.t1 + x * x * self.t2;
        if lhs != rhs {
            return false;
        }

        let y_inv_powers = powers(&y.invert());
        let two_powers = powers(&Scalar::from(2u64));

        let mut lhs = self.a + x * self.s;
        let mut rhs = self.mu * PEDERSEN_GENS.B_blinding;
        for i in 0..BITS {
            lhs += (z + z * z * two_powers[i] * y_inv_powers[i]) * VECTOR_GENS.h[i]
                - z * VECTOR_GENS.g[i];
            rhs += self.l_vec[i] * VECTOR_GENS.g[i]
                + self.r_vec[i] * y_inv_powers[i] * VECTOR_GENS.h[i];
        }

        lhs == rhs
    }

    fn challenges(&self, commitment: &RistrettoPoint) -> (Scalar, Scalar, Scalar) {
        let mut transcript = oracle(commitment);
        append_point(&mut transcript, b"A", &self.a);
        append_point(&mut transcript, b"S", &self.s);
        let y = challenge_scalar(&mut transcript, b"y");
        let z = challenge_scalar(&mut transcript, b"z");
        append_point(&mut transcript, b"T1", &self.t1);
        append_point(&mut transcript, b"T2", &self.t2);
        let x = challenge_scalar(&mut transcript, b"x");

        (y, z, x)
    }
}

struct ProverSecrets {
    alpha: Scalar,
    rho: Scalar,
    tau1: Scalar,
    tau2: Scalar,
    s_l: Vec<Scalar>,
    s_r: Vec<Scalar>,
}

impl ProverSecrets {
    fn derive(seed: &[u8; 32]) -> Self {
        ProverSecrets {
            alpha: nonce(seed, b"alpha", 0),
            rho: nonce(seed, b"rho", 0),
            tau1: nonce(seed, b"tau1", 0),
            tau2: nonce(seed, b"tau2", 0),
            s_l: (0..BITS as u64).map(|i| nonce(seed, b"s_l", i)).collect(),
            s_r: (0..BITS as u64).map(|i| nonce(seed, b"s_r", i)).collect(),
        }
    }
}

/// The `l(X)`/`r(X)` vector polynomials of the range argument.
struct ProofPolynomial {
    a_l: Vec<Scalar>,
    a_r: Vec<Scalar>,
    s_l: Vec<Scalar>,
    s_r: Vec<Scalar>,
}

impl ProofPolynomial {
    fn new(value: u64, secrets: &ProverSecrets) -> Self {
        let a_l: Vec<Scalar> = (0..BITS)
            .map(|i| Scalar::from((value >> i) & 1))
            .collect();
        let a_r: Vec<Scalar> = a_l.iter().map(|bit| bit - Scalar::ONE).collect();

        ProofPolynomial {
            a_l,
            a_r,
            s_l: secrets.s_l.clone(),
            s_r: secrets.s_r.clone(),
        }
    }

    fn terms(&self, y: &Scalar, z: &Scalar) -> (Vec<Scalar>, Vec<Scalar>, Vec<Scalar>, Vec<Scalar>) {
        let y_powers = powers(y);
        let two_powers = powers(&Scalar::from(2u64));
        let zz = z * z;

        let l0: Vec<Scalar> = self.a_l.iter().map(|a| a - z).collect();
        let l1 = self.s_l.clone();
        let r0: Vec<Scalar> = (0..BITS)
            .map(|i| y_powers[i] * (self.a_r[i] + z) + zz * two_powers[i])
            .collect();
        let r1: Vec<Scalar> = (0..BITS).map(|i| y_powers[i] * self.s_r[i]).collect();

        (l0, l1, r0, r1)
    }

    fn t_coefficients(&self, y: &Scalar, z: &Scalar) -> (Scalar, Scalar) {
        let (l0, l1, r0, r1) = self.terms(y, z);

        let t1 = inner_product(&l0, &r1) + inner_product(&l1, &r0);
        let t2 = inner_product(&l1, &r1);

        (t1, t2)
    }

    fn evaluate(&self, y: &Scalar, z: &Scalar, x: &Scalar) -> (Vec<Scalar>, Vec<Scalar>) {
        let (l0, l1, r0, r1) = self.terms(y, z);

        let l = (0..BITS).map(|i| l0[i] + x * l1[i]).collect();
        let r = (0..BITS).map(|i| r0[i] + x * r1[i]).collect();

        (l, r)
    }
}

fn oracle(commitment: &RistrettoPoint) -> Transcript {
    let mut transcript = Transcript::new(b"mwswap.shared-range-proof");
    transcript.append_u64(b"maturity", 0);
    append_point(&mut transcript, b"V", commitment);

    transcript
}

fn append_point(transcript: &mut Transcript, label: &'static [u8], point: &RistrettoPoint) {
    transcript.append_message(label, point.compress().as_bytes());
}

fn challenge_scalar(transcript: &mut Transcript, label: &'static [u8]) -> Scalar {
    let mut buf = [0u8; 64];
    transcript.challenge_bytes(label, &mut buf);

    Scalar::from_bytes_mod_order_wide(&buf)
}

fn nonce(seed: &[u8; 32], label: &'static [u8], index: u64) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(b"mwswap.proof-nonce");
    hasher.update(seed);
    hasher.update((label.len() as u64).to_le_bytes());
    hasher.update(label);
    hasher.update(index.to_le_bytes());

    Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
}

fn powers(base: &Scalar) -> Vec<Scalar> {
    let mut out = Vec::with_capacity(BITS);
    let mut current = Scalar::ONE;
    for _ in 0..BITS {
        out.push(current);
        current *= base;
    }

    out
}

fn inner_product(a: &[Scalar], b: &[Scalar]) -> Scalar {
    a.iter().zip(b.iter()).map(|(a, b)| a * b).sum()
}
