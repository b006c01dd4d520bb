//! Event payload codec boundary.
//!
//! `data`/`metadata` stay opaque JSON blobs in [`crate::model::Event`];
//! a codec is how a reducer or handler turns them into a concrete type.
//! Grounded on `eventually/src/lib.rs`'s `Serde`/`SerdeJson` codec trait.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Encodes/decodes a domain payload type to/from the opaque JSON blob
/// carried by [`crate::model::Event::data`] and
/// [`crate::model::Event::metadata`].
pub trait EventCodec<T> {
    fn encode(&self, value: &T) -> Result<Value, serde_json::Error>;
    fn decode(&self, value: &Value) -> Result<T, serde_json::Error>;
}

/// The default, and so far only, codec: plain `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> EventCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Value, serde_json::Error> {
        serde_json::to_value(value)
    }

    fn decode(&self, value: &Value) -> Result<T, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: String,
        amount_cents: i64,
    }

    #[test]
    fn json_codec_roundtrips_a_domain_payload() {
        let codec = JsonCodec;
        let original = OrderPlaced {
            order_id: "o-1".into(),
            amount_cents: 4599,
        };

        let encoded = codec.encode(&original).unwrap();
        let decoded: OrderPlaced = codec.decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }
}
