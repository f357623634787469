use serde::{de::DeserializeOwned, Serialize};

/// Encode an arbitrary serializable value into a vec.
pub fn encode<T: Serialize + ?Sized>(val: &T) -> Vec<u8> {
    rmp_serde::encode::to_vec(val).expect("failed to encode value")
}

/// Encode a value, prefixed with a one byte tag.
///
/// Protocol messages use the tag to carry the round they belong to.
pub fn encode_with_tag<T: Serialize + ?Sized>(tag: u8, val: &T) -> Vec<u8> {
    let mut out = vec![tag];
    rmp_serde::encode::write(&mut out, val).expect("failed to encode value");
    out
}

/// Decode a value previously produced by [encode].
pub fn decode<T: DeserializeOwned>(input: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::decode::from_slice(input)
}
