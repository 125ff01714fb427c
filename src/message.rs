//! Wire envelope exchanged on gossip topics.

use serde::{Deserialize, Serialize};

/// Application message. Encoded as JSON; unknown fields are ignored and a
/// missing `data` field decodes as an empty payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub peer_id: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(id: impl Into<String>, peer_id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            peer_id: peer_id.into(),
            data: data.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    // `null` is treated like an absent field.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => general_purpose::STANDARD
                .decode(s)
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_layout() {
        let msg = Message::new("1", "peer", b"hello".to_vec());
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["id"], "1");
        assert_eq!(value["peer_id"], "peer");
        assert_eq!(value["data"], "aGVsbG8=");
    }

    #[test]
    fn test_missing_data_is_empty() {
        let msg = Message::decode(br#"{"id":"a","peer_id":"p"}"#).unwrap();
        assert_eq!(msg.id, "a");
        assert!(msg.data.is_empty());

        let msg = Message::decode(br#"{"id":"a","peer_id":"p","data":null}"#).unwrap();
        assert!(msg.data.is_empty());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let msg = Message::decode(br#"{"id":"a","peer_id":"p","data":"AQI=","extra":42}"#).unwrap();
        assert_eq!(msg.data, vec![1, 2]);
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(br#"{"id":"a","data":"%%%"}"#).is_err());
    }
}
