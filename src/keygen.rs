use k256::{AffinePoint, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::math::{GroupPolynomial, Polynomial};
use crate::participants::{ParticipantCounter, ParticipantList, ParticipantMap};
use crate::protocol::internal::{Communication, Executor, Round};
use crate::protocol::{InitializationError, Participant, Protocol, ProtocolError};

const ROUND_COMMITMENT: Round = 0;
const ROUND_SHARE: Round = 1;
const ROUNDS: usize = 2;

/// Represents the output of the key generation protocol.
///
/// This contains our share of the private key, along with the public key.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeygenOutput {
    pub private_share: Scalar,
    pub public_key: AffinePoint,
}

async fn do_keygen(
    mut rng: impl CryptoRngCore,
    comms: Communication,
    participants: ParticipantList,
    me: Participant,
    threshold: usize,
) -> Result<KeygenOutput, ProtocolError> {
    // Round 1: commit to a fresh polynomial, and hand out its evaluations.
    let f = Polynomial::random(&mut rng, threshold);
    let my_commitment = f.commit();

    comms.send_many(ROUND_COMMITMENT, &my_commitment).await;
    for p in participants.others(me) {
        comms.send_private(ROUND_SHARE, p, &f.evaluate(&p.scalar())).await;
    }

    // Round 2: collect every commitment.
    let mut big_f = my_commitment.clone();
    let mut commitments = ParticipantMap::new(&participants);
    commitments.put(me, my_commitment);
    while !commitments.full() {
        let (from, their_big_f): (_, GroupPolynomial) = comms.recv(ROUND_COMMITMENT).await?;
        if their_big_f.len() != threshold {
            return Err(ProtocolError::AssertionFailed(format!(
                "polynomial from {from:?} has the wrong length"
            )));
        }
        if commitments.put(from, their_big_f.clone()) {
            big_f += &their_big_f;
        }
    }

    // Round 3: sum up the shares we received, checking each against the
    // commitment of its sender.
    let me_scalar = me.scalar();
    let mut x_i = f.evaluate(&me_scalar);
    let mut seen = ParticipantCounter::new(&participants);
    seen.put(me);
    while !seen.full() {
        let (from, x_j_i): (_, Scalar) = comms.recv(ROUND_SHARE).await?;
        if !seen.put(from) {
            continue;
        }
        if commitments[from].evaluate(&me_scalar) != ProjectivePoint::GENERATOR * x_j_i {
            return Err(ProtocolError::AssertionFailed(format!(
                "private share from {from:?} does not match its commitment"
            )));
        }
        x_i += x_j_i;
    }

    Ok(KeygenOutput {
        private_share: x_i,
        public_key: big_f.evaluate_zero().to_affine(),
    })
}

/// The key generation protocol, with a given threshold.
///
/// This produces a new key pair, such that any set of participants
/// of size `>= threshold` can reconstruct the private key,
/// but no smaller set can do the same.
///
/// This needs to be run once per keep, before being able to sign with the key.
pub fn keygen(
    participants: &[Participant],
    me: Participant,
    threshold: usize,
    rng: impl CryptoRngCore + Send + 'static,
) -> Result<impl Protocol<Output = KeygenOutput> + Send, InitializationError> {
    if participants.is_empty() {
        return Err(InitializationError::BadParameters(
            "participant list cannot be empty".to_string(),
        ));
    }
    if threshold == 0 || threshold > participants.len() {
        return Err(InitializationError::BadParameters(format!(
            "threshold must be between 1 and {}, found: {}",
            participants.len(),
            threshold
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
    let fut = do_keygen(rng, comms.clone(), participants, me, threshold);
    Ok(Executor::new(comms, fut))
}
