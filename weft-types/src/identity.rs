use libp2p::identity::Keypair;
use libp2p::PeerId;

use crate::error::TypesError;

/// Generate a fresh ed25519 keypair from OS randomness.
pub fn generate_keypair() -> Result<Keypair, TypesError> {
    keypair_from_seed(rand::random())
}

/// Derive an ed25519 keypair from a 32-byte seed.
pub fn keypair_from_seed(seed: [u8; 32]) -> Result<Keypair, TypesError> {
    let mut bytes = seed;
    Keypair::ed25519_from_bytes(&mut bytes).map_err(|e| TypesError::InvalidKey {
        reason: e.to_string(),
    })
}

/// Derive an ed25519 keypair from a hex-encoded 32-byte seed.
pub fn keypair_from_hex(seed_hex: &str) -> Result<Keypair, TypesError> {
    let bytes = hex::decode(seed_hex.trim()).map_err(|e| TypesError::InvalidKey {
        reason: format!("invalid seed hex: {}", e),
    })?;
    let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| TypesError::InvalidKey {
        reason: format!("seed must be 32 bytes, got {}", b.len()),
    })?;
    keypair_from_seed(seed)
}

/// The peer id derived from a keypair's public key.
pub fn peer_id_of(keypair: &Keypair) -> PeerId {
    keypair.public().to_peer_id()
}
