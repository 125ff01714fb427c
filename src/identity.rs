//! Node key material and the canonical address derived from it.
//!
//! Node keys are secp256k1. The address of a key is the Ethereum style
//! account address: the last 20 bytes of Keccak-256 over the uncompressed
//! public key (without its `0x04` prefix), written as `0x` + lowercase hex.

use std::net::SocketAddr;
use std::str::FromStr;

use libp2p_identity::{secp256k1, Keypair, PeerId, PublicKey};
use sha3::{Digest, Keccak256};

use crate::error::ConfigError;
use crate::host::PeerInfo;

/// Multihash code of the identity hash used for inline public keys.
const IDENTITY_MULTIHASH: u8 = 0x00;

/// Parse a hex encoded 32 byte secp256k1 secret. A leading `0x` is accepted.
pub fn keypair_from_hex(hex_key: &str) -> Result<Keypair, ConfigError> {
    let trimmed = hex_key.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(trimmed).map_err(|e| ConfigError::InvalidPrivateKey(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(ConfigError::InvalidPrivateKey(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    let secret = secp256k1::SecretKey::try_from_bytes(bytes)
        .map_err(|e| ConfigError::InvalidPrivateKey(e.to_string()))?;
    Ok(Keypair::from(secp256k1::Keypair::from(secret)))
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate_secp256k1()
}

/// Hex encoding of the keypair's secret, readable back by [`keypair_from_hex`].
pub fn keypair_to_hex(keypair: &Keypair) -> Option<String> {
    let secp = keypair.clone().try_into_secp256k1().ok()?;
    Some(hex::encode(secp.secret().to_bytes()))
}

pub fn derive_address(public_key: &secp256k1::PublicKey) -> String {
    let uncompressed = public_key.to_bytes_uncompressed();
    let digest = Keccak256::digest(&uncompressed[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Address for a raw 33 byte compressed secp256k1 key, as presented at
/// upgrade time.
pub fn address_from_raw(raw: &[u8]) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    secp256k1::PublicKey::try_from_bytes(raw)
        .ok()
        .map(|pk| derive_address(&pk))
}

/// Address of a generic public key. `None` for non secp256k1 keys.
pub fn address_of(public_key: &PublicKey) -> Option<String> {
    public_key
        .clone()
        .try_into_secp256k1()
        .ok()
        .map(|pk| derive_address(&pk))
}

/// Compressed secp256k1 bytes of a public key, empty for other key types.
pub fn raw_public_key(public_key: &PublicKey) -> Vec<u8> {
    public_key
        .clone()
        .try_into_secp256k1()
        .map(|pk| pk.to_bytes().to_vec())
        .unwrap_or_default()
}

/// Recover the public key inlined in a peer id.
///
/// Small keys (secp256k1, ed25519) are embedded in the id with the identity
/// multihash; hashed ids yield `None`.
pub fn public_key_from_peer_id(peer: &PeerId) -> Option<PublicKey> {
    // Multihash layout: code varint, length varint, digest. Inline keys are
    // short enough for both varints to be a single byte.
    let bytes = peer.to_bytes();
    match bytes.as_slice() {
        [code, len, digest @ ..] if *code == IDENTITY_MULTIHASH && *len as usize == digest.len() => {
            PublicKey::try_decode_protobuf(digest).ok()
        }
        _ => None,
    }
}

/// Parse a bootstrap entry written as `PeerId@ip:port`.
pub fn parse_peer_addr(entry: &str) -> Result<PeerInfo, ConfigError> {
    let entry = entry.trim();
    let invalid = |reason: String| ConfigError::InvalidBootstrapPeer {
        peer: entry.to_string(),
        reason,
    };

    let (id, addr) = entry
        .split_once('@')
        .ok_or_else(|| invalid("expected PeerId@ip:port".to_string()))?;
    let id = PeerId::from_str(id.trim()).map_err(|e| invalid(e.to_string()))?;
    let addr = SocketAddr::from_str(addr.trim()).map_err(|e| invalid(e.to_string()))?;

    Ok(PeerInfo::new(id, vec![addr]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_keypair_hex_roundtrip() {
        let keypair = generate_keypair();
        let encoded = keypair_to_hex(&keypair).unwrap();
        let decoded = keypair_from_hex(&encoded).unwrap();
        assert_eq!(keypair.public().to_peer_id(), decoded.public().to_peer_id());

        let prefixed = keypair_from_hex(&format!("0x{}", encoded)).unwrap();
        assert_eq!(keypair.public().to_peer_id(), prefixed.public().to_peer_id());
    }

    #[test]
    fn test_invalid_private_keys() {
        assert!(matches!(
            keypair_from_hex("zz"),
            Err(ConfigError::InvalidPrivateKey(_))
        ));
        assert!(matches!(
            keypair_from_hex("abcd"),
            Err(ConfigError::InvalidPrivateKey(_))
        ));
        // Zero is outside the curve order.
        assert!(matches!(
            keypair_from_hex(&"00".repeat(32)),
            Err(ConfigError::InvalidPrivateKey(_))
        ));
    }

    #[test]
    fn test_known_ethereum_address() {
        let keypair = keypair_from_hex(KEY_ONE).unwrap();
        assert_eq!(
            address_of(&keypair.public()).unwrap(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_derive_address_shape() {
        let keypair = generate_keypair();
        let address = address_of(&keypair.public()).unwrap();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        assert_eq!(address, address.to_lowercase());

        let raw = raw_public_key(&keypair.public());
        assert_eq!(raw.len(), 33);
        assert_eq!(address_from_raw(&raw), Some(address));
    }

    #[test]
    fn test_address_from_garbage_key() {
        assert_eq!(address_from_raw(&[1, 2, 3]), None);
        assert_eq!(address_from_raw(&[]), None);
    }

    #[test]
    fn test_ed25519_keys_have_no_address() {
        let keypair = Keypair::generate_ed25519();
        assert_eq!(address_of(&keypair.public()), None);
        assert!(raw_public_key(&keypair.public()).is_empty());
    }

    #[test]
    fn test_public_key_from_peer_id() {
        let keypair = generate_keypair();
        let peer = keypair.public().to_peer_id();
        assert_eq!(public_key_from_peer_id(&peer), Some(keypair.public()));
    }

    #[test]
    fn test_parse_peer_addr() {
        let peer = generate_keypair().public().to_peer_id();
        let info = parse_peer_addr(&format!("{}@127.0.0.1:10015", peer)).unwrap();
        assert_eq!(info.id, peer);
        assert_eq!(info.addrs, vec!["127.0.0.1:10015".parse().unwrap()]);

        assert!(parse_peer_addr("127.0.0.1:10015").is_err());
        assert!(parse_peer_addr("not-a-peer@127.0.0.1:10015").is_err());
        assert!(parse_peer_addr(&format!("{}@localhost", peer)).is_err());
    }
}
