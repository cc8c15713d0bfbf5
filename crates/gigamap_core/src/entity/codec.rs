//! Entity payload encoding for segment storage.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Converts entities to and from segment payload bytes.
///
/// Only needed by maps that are stored to a segment store. Types that
/// implement serde's traits can delegate to [`CborCodec`]:
///
/// ```
/// use gigamap_core::{CborCodec, CoreResult, EntityCodec};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Tag(String);
///
/// impl EntityCodec for Tag {
///     fn encode_entity(&self) -> CoreResult<Vec<u8>> {
///         CborCodec::encode(self)
///     }
///
///     fn decode_entity(bytes: &[u8]) -> CoreResult<Self> {
///         CborCodec::decode(bytes)
///     }
/// }
/// ```
pub trait EntityCodec: Sized {
    /// Encodes the entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the entity cannot be represented.
    fn encode_entity(&self) -> CoreResult<Vec<u8>>;

    /// Decodes an entity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the bytes are not a valid entity.
    fn decode_entity(bytes: &[u8]) -> CoreResult<Self>;
}

/// CBOR encoding through serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl CborCodec {
    /// Encodes a value as CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if serialization fails.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf)
            .map_err(|e| CoreError::codec(format!("encoding failed: {}", e)))?;
        Ok(buf)
    }

    /// Decodes a CBOR value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the bytes do not decode to `T`.
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| CoreError::codec(format!("decoding failed: {}", e)))
    }
}

impl EntityCodec for String {
    fn encode_entity(&self) -> CoreResult<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode_entity(bytes: &[u8]) -> CoreResult<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CoreError::codec(e.to_string()))
    }
}

impl EntityCodec for u64 {
    fn encode_entity(&self) -> CoreResult<Vec<u8>> {
        Ok(self.to_le_bytes().to_vec())
    }

    fn decode_entity(bytes: &[u8]) -> CoreResult<Self> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| CoreError::codec(format!("expected 8 bytes, got {}", bytes.len())))?;
        Ok(u64::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        tags: Vec<u16>,
        score: Option<i64>,
    }

    #[test]
    fn cbor_round_trip() {
        let sample = Sample {
            name: "x".into(),
            tags: vec![1, 2],
            score: Some(-3),
        };
        let bytes = CborCodec::encode(&sample).unwrap();
        let decoded: Sample = CborCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn cbor_rejects_garbage() {
        let err = CborCodec::decode::<Sample>(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, CoreError::Codec { .. }));
    }

    #[test]
    fn primitive_codecs() {
        assert_eq!(u64::decode_entity(&7u64.encode_entity().unwrap()).unwrap(), 7);
        assert!(u64::decode_entity(&[1, 2]).is_err());
        assert_eq!(
            String::decode_entity(&"hé".to_string().encode_entity().unwrap()).unwrap(),
            "hé"
        );
    }
}
