//! MessagePack codec using `rmp-serde`.
//!
//! Structs are written as maps (`to_vec_named`) so that field order changes on
//! either side of the connection do not silently shift values.

use crate::error::Result;

/// MessagePack codec for headers and bodies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MessagePack bytes, structs as maps.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MessagePack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
