//! Plain ECDSA values as they leave the threshold engine.
//!
//! The engine works with curve points and scalars; everything outside of it
//! (chain submission, the command line) wants big-endian bytes instead.
use std::fmt;

use k256::{elliptic_curve::sec1::ToEncodedPoint, AffinePoint, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::{
    compat,
    keygen::{keygen, KeygenOutput},
    protocol::{run_protocol, InitializationError, Participant, Protocol, ProtocolError},
    sign::{sign, FullSignature},
};

/// An ECDSA signature, with the recovery id needed to get the public key back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub r: Scalar,
    pub s: Scalar,
    pub recovery_id: u8,
}

impl Signature {
    /// Only the low byte of the recovery indicator carries the recovery id.
    pub fn from_full(sig: &FullSignature) -> Self {
        Self {
            r: sig.r(),
            s: sig.s,
            recovery_id: sig.recovery.first().copied().unwrap_or_default(),
        }
    }

    pub fn r_bytes(&self) -> [u8; 32] {
        self.r.to_bytes().into()
    }

    pub fn s_bytes(&self) -> [u8; 32] {
        self.s.to_bytes().into()
    }

    /// Convert into the signature type of the `k256` crate.
    pub fn to_k256(&self) -> Option<k256::ecdsa::Signature> {
        k256::ecdsa::Signature::from_scalars(self.r, self.s).ok()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R: {}\nS: {}",
            hex::encode(self.r_bytes()),
            hex::encode(self.s_bytes())
        )
    }
}

/// An uncompressed secp256k1 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(AffinePoint);

impl PublicKey {
    pub fn as_affine(&self) -> &AffinePoint {
        &self.0
    }

    /// The affine (X, Y) coordinates, as big-endian bytes.
    pub fn coordinates(&self) -> ([u8; 32], [u8; 32]) {
        let point = self.0.to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        if let (Some(px), Some(py)) = (point.x(), point.y()) {
            x.copy_from_slice(px);
            y.copy_from_slice(py);
        }
        (x, y)
    }

    /// Check a signature over an already hashed message.
    pub fn verify_digest(&self, digest: &[u8; 32], signature: &Signature) -> bool {
        let (r, s) = (signature.r, signature.s);
        if bool::from(r.is_zero()) {
            return false;
        }
        let Some(s_inv) = Option::<Scalar>::from(s.invert()) else {
            return false;
        };
        let msg_hash = compat::scalar_from_digest(digest);
        let reproduced = (ProjectivePoint::GENERATOR * (msg_hash * s_inv))
            + (ProjectivePoint::from(self.0) * (r * s_inv));
        compat::x_coordinate(&reproduced.to_affine()) == r
    }
}

impl From<AffinePoint> for PublicKey {
    fn from(point: AffinePoint) -> Self {
        Self(point)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.coordinates();
        write!(f, "X: {}\nY: {}", hex::encode(x), hex::encode(y))
    }
}

/// Represents an error which can happen when using a [LocalSigner].
#[derive(Debug, thiserror::Error)]
pub enum LocalSignerError {
    #[error("failed to initialize protocol: {0}")]
    Initialization(#[from] InitializationError),
    #[error("protocol failed: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("protocol returned no output")]
    NoOutput,
}

/// A signer holding the whole key, in a single process.
///
/// This runs the threshold engine with one participant and a threshold of
/// one, which makes the share held here the private key itself.
#[derive(Clone)]
pub struct LocalSigner {
    key: KeygenOutput,
}

const LOCAL: Participant = Participant::new(0);

impl LocalSigner {
    /// Generate a new key pair.
    pub fn generate(rng: impl CryptoRngCore + Send + 'static) -> Result<Self, LocalSignerError> {
        let protocol = keygen(&[LOCAL], LOCAL, 1, rng)?;
        let key = run_single(protocol)?;
        Ok(Self { key })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.key.public_key)
    }

    /// Sign a message, hashing it with SHA-256 first.
    pub fn calculate_signature(
        &self,
        rng: impl CryptoRngCore + Send + 'static,
        message: &[u8],
    ) -> Result<Signature, LocalSignerError> {
        let msg_hash = compat::scalar_hash(message);
        let protocol = sign(&[LOCAL], LOCAL, self.key.clone(), 1, msg_hash, rng)?;
        let full = run_single(protocol)?;
        Ok(Signature::from_full(&full))
    }
}

fn run_single<T>(
    protocol: impl Protocol<Output = T> + Send + 'static,
) -> Result<T, LocalSignerError> {
    let protocol: Box<dyn Protocol<Output = T> + Send> = Box::new(protocol);
    let out = run_protocol(vec![(LOCAL, protocol)])?;
    out.into_iter()
        .next()
        .map(|(_, x)| x)
        .ok_or(LocalSignerError::NoOutput)
}
