use elliptic_curve::{point::AffineCoordinates, scalar::IsHigh};
use k256::{AffinePoint, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use subtle::ConditionallySelectable;

use crate::{
    compat,
    keygen::KeygenOutput,
    math::Polynomial,
    participants::{ParticipantCounter, ParticipantList},
    protocol::{
        internal::{Communication, Executor, Round},
        InitializationError, Participant, Protocol, ProtocolError,
    },
};

const ROUND_NONCE: Round = 0;
const ROUND_PRODUCT: Round = 1;
const ROUND_SIGNATURE: Round = 2;
const ROUNDS: usize = 3;

/// Represents a signature with extra information, to support different variants of ECDSA.
///
/// An ECDSA signature is usually two scalars. The first scalar is derived from
/// a point on the curve, and because this process is lossy, some other variants
/// of ECDSA also include some extra information in order to recover this point.
///
/// To support these variants, this gives you a normal signature, along with
/// the entire first point, and the recovery indicator matching `s`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSignature {
    /// This is the entire first point.
    pub big_r: AffinePoint,
    /// This is the second scalar, normalized to be in the lower range.
    pub s: Scalar,
    /// Bit 0 holds the parity of the y coordinate of the point matching `s`,
    /// bit 1 is set when the x coordinate of that point overflowed the curve order.
    pub recovery: Vec<u8>,
}

impl FullSignature {
    pub fn r(&self) -> Scalar {
        compat::x_coordinate(&self.big_r)
    }

    #[must_use]
    pub fn verify(&self, public_key: &AffinePoint, msg_hash: &Scalar) -> bool {
        let r = self.r();
        if bool::from(r.is_zero()) {
            return false;
        }
        let Some(s_inv) = Option::<Scalar>::from(self.s.invert()) else {
            return false;
        };
        let reproduced = (ProjectivePoint::GENERATOR * (*msg_hash * s_inv))
            + (ProjectivePoint::from(*public_key) * (r * s_inv));
        compat::x_coordinate(&reproduced.to_affine()) == r
    }
}

/// The shares of the per-signature randomness one party deals to another.
///
/// `k` and `a` are sharings of random values, while `b` and `c` are sharings
/// of zero with twice the degree, used to mask products of shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NonceShares {
    k: Scalar,
    a: Scalar,
    b: Scalar,
    c: Scalar,
}

impl NonceShares {
    fn add(&mut self, other: &NonceShares) {
        self.k += other.k;
        self.a += other.a;
        self.b += other.b;
        self.c += other.c;
    }
}

async fn do_sign(
    mut rng: impl CryptoRngCore,
    comms: Communication,
    participants: ParticipantList,
    me: Participant,
    keygen_out: KeygenOutput,
    threshold: usize,
    msg_hash: Scalar,
) -> Result<FullSignature, ProtocolError> {
    // Round 1: deal fresh sharings of the nonce material.
    let double = 2 * threshold - 1;
    let k_f = Polynomial::random(&mut rng, threshold);
    let a_f = Polynomial::random(&mut rng, threshold);
    let b_f = Polynomial::extend_random(&mut rng, double, &Scalar::ZERO);
    let c_f = Polynomial::extend_random(&mut rng, double, &Scalar::ZERO);
    let deal = |p: Participant| {
        let x = p.scalar();
        NonceShares {
            k: k_f.evaluate(&x),
            a: a_f.evaluate(&x),
            b: b_f.evaluate(&x),
            c: c_f.evaluate(&x),
        }
    };

    for p in participants.others(me) {
        comms.send_private(ROUND_NONCE, p, &deal(p)).await;
    }

    let mut shares = deal(me);
    let mut seen = ParticipantCounter::new(&participants);
    seen.put(me);
    while !seen.full() {
        let (from, theirs): (_, NonceShares) = comms.recv(ROUND_NONCE).await?;
        if !seen.put(from) {
            continue;
        }
        shares.add(&theirs);
    }

    // Round 2: open k * a, masked by b, along with a * G.
    let v_i = shares.k * shares.a + shares.b;
    let big_a_i = (ProjectivePoint::GENERATOR * shares.a).to_affine();
    comms.send_many(ROUND_PRODUCT, &(v_i, big_a_i)).await;

    let lambda_me = participants.lagrange(me);
    let mut mu = lambda_me * v_i;
    let mut big_a = ProjectivePoint::from(big_a_i) * lambda_me;
    let mut seen = ParticipantCounter::new(&participants);
    seen.put(me);
    while !seen.full() {
        let (from, (v_j, big_a_j)): (_, (Scalar, AffinePoint)) =
            comms.recv(ROUND_PRODUCT).await?;
        if !seen.put(from) {
            continue;
        }
        let lambda = participants.lagrange(from);
        mu += lambda * v_j;
        big_a += ProjectivePoint::from(big_a_j) * lambda;
    }

    // R = (k * a)^-1 * a * G = k^-1 * G
    let mu_inv = Option::<Scalar>::from(mu.invert())
        .ok_or_else(|| ProtocolError::AssertionFailed("masked nonce product is zero".to_string()))?;
    let big_r = (big_a * mu_inv).to_affine();
    let r = compat::x_coordinate(&big_r);
    if bool::from(r.is_zero()) {
        return Err(ProtocolError::AssertionFailed(
            "x coordinate of R is zero".to_string(),
        ));
    }

    // Round 3: open s = k * (m + r * x), masked by c.
    let s_i = shares.k * (msg_hash + r * keygen_out.private_share) + shares.c;
    comms.send_many(ROUND_SIGNATURE, &s_i).await;

    let mut s = lambda_me * s_i;
    let mut seen = ParticipantCounter::new(&participants);
    seen.put(me);
    while !seen.full() {
        let (from, s_j): (_, Scalar) = comms.recv(ROUND_SIGNATURE).await?;
        if !seen.put(from) {
            continue;
        }
        s += participants.lagrange(from) * s_j;
    }

    let mut recovery = u8::from(bool::from(big_r.y_is_odd()));
    if r.to_bytes() != big_r.x() {
        recovery |= 2;
    }
    // Normalize s into the lower half, which flips the parity of the matching point.
    let high = s.is_high();
    let s = Scalar::conditional_select(&s, &-s, high);
    recovery ^= u8::conditional_select(&0, &1, high);

    let sig = FullSignature {
        big_r,
        s,
        recovery: vec![recovery],
    };
    if !sig.verify(&keygen_out.public_key, &msg_hash) {
        return Err(ProtocolError::AssertionFailed(
            "signature failed to verify".to_string(),
        ));
    }

    Ok(sig)
}

/// The signature protocol, allowing us to use the jointly generated key.
///
/// Each signature needs fresh randomness, so this protocol runs three rounds
/// on its own. Honest majority is required: the signing group must contain
/// at least `2 * threshold - 1` participants, holding shares of the same key.
pub fn sign(
    participants: &[Participant],
    me: Participant,
    keygen_out: KeygenOutput,
    threshold: usize,
    msg_hash: Scalar,
    rng: impl CryptoRngCore + Send + 'static,
) -> Result<impl Protocol<Output = FullSignature> + Send, InitializationError> {
    if threshold == 0 {
        return Err(InitializationError::BadParameters(
            "threshold must be at least 1".to_string(),
        ));
    }
    if threshold > (participants.len() + 1) / 2 {
        return Err(InitializationError::BadParameters(format!(
            "signing with threshold {} needs at least {} participants, found: {}",
            threshold,
            threshold.saturating_mul(2) - 1,
            participants.len()
        )));
    }

    let participants = ParticipantList::new(participants).ok_or_else(|| {
        InitializationError::BadParameters("participant list cannot contain duplicates".to_string())
    })?;

    if !participants.contains(me) {
        return Err(InitializationError::BadParameters(
            "participant list must contain this participant".to_string(),
        ));
    }

    let comms = Communication::new(ROUNDS, participants.len());
    let fut = do_sign(
        rng,
        comms.clone(),
        participants,
        me,
        keygen_out,
        threshold,
        msg_hash,
    );
    Ok(Executor::new(comms, fut))
}
