//! Binary codec for internal wire messages.
//!
//! Gameplay messages and transport envelopes are serialized with bincode
//! using one centralized configuration. Fixed-size integer encoding is used
//! deliberately: message sizes stay deterministic across peers, which matters
//! for a protocol whose whole purpose is bit-identical simulation.
//!
//! Control-channel messages do *not* pass through here: their byte layout is
//! fixed by the session protocol and written by hand in [`crate::control`].

use serde::{de::DeserializeOwned, Serialize};

use crate::NetplayError;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T, context: &'static str) -> Result<Vec<u8>, NetplayError> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| {
        tracing::error!(context, error = %e, "wire encode failed");
        NetplayError::Codec { context }
    })
}

/// Decodes a value from a byte slice. Trailing bytes are rejected so that a
/// truncated or padded datagram cannot silently half-parse.
pub fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    context: &'static str,
) -> Result<T, NetplayError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, config())
        .map_err(|_| NetplayError::Codec { context })?;
    if read != bytes.len() {
        return Err(NetplayError::Codec { context });
    }
    Ok(value)
}
