use digest::{Digest, FixedOutput};
use ecdsa::hazmat::DigestPrimitive;
use elliptic_curve::{ops::Reduce, point::AffineCoordinates, Curve};
use k256::{AffinePoint, FieldBytes, Scalar, Secp256k1};

/// Hash an arbitrary message in order to produce a scalar.
pub fn scalar_hash(msg: &[u8]) -> Scalar {
    let digest = <Secp256k1 as DigestPrimitive>::Digest::new_with_prefix(msg);
    let m_bytes: FieldBytes = digest.finalize_fixed();
    <Scalar as Reduce<<Secp256k1 as Curve>::Uint>>::reduce_bytes(&m_bytes)
}

/// Interpret an already computed 32 byte digest as a scalar.
pub fn scalar_from_digest(digest: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<<Secp256k1 as Curve>::Uint>>::reduce_bytes(FieldBytes::from_slice(digest))
}

/// Get the x coordinate of a point, as a scalar.
pub fn x_coordinate(point: &AffinePoint) -> Scalar {
    <Scalar as Reduce<<Secp256k1 as Curve>::Uint>>::reduce_bytes(&point.x())
}
