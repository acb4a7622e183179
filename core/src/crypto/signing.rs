//! Ed25519 signing and verification of operation payloads
//!
//! A signed payload is `public_key(32) || signature(64) || content`, so it
//! carries everything needed to check it and nothing else.

use crate::types::OpHash;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Bytes preceding the signed content in a signed payload
pub const SIGNED_HEADER_LEN: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN;

/// A node's signing identity. The secret half never leaves this type
/// except through [`Keypair::to_bytes`] for the key file.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    /// Sign `content` and prepend the public key and signature
    pub fn sign_payload(&self, content: &[u8]) -> Vec<u8> {
        let signature = self.signing.sign(content);

        let mut payload = Vec::with_capacity(SIGNED_HEADER_LEN + content.len());
        payload.extend_from_slice(self.signing.verifying_key().as_bytes());
        payload.extend_from_slice(&signature.to_bytes());
        payload.extend_from_slice(content);
        payload
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", hex::encode(&self.public_key().0[..8]))
    }
}

/// Raw public key bytes as they appear at the front of a signed payload
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.0
    }
}

/// Author of a signed payload, without checking the signature
pub fn payload_author(payload: &[u8]) -> Option<PublicKey> {
    let key: [u8; PUBLIC_KEY_LEN] = payload.get(..PUBLIC_KEY_LEN)?.try_into().ok()?;
    Some(PublicKey(key))
}

/// Check a signed payload.
///
/// Never panics: short payloads, keys off the curve and bad signatures all
/// report `false`.
pub fn verify_payload(payload: &[u8]) -> bool {
    if payload.len() < SIGNED_HEADER_LEN {
        return false;
    }
    let (header, content) = payload.split_at(SIGNED_HEADER_LEN);
    let (key, sig) = header.split_at(PUBLIC_KEY_LEN);

    let Ok(key) = <[u8; PUBLIC_KEY_LEN]>::try_from(key) else {
        return false;
    };
    let Ok(verifying) = VerifyingKey::from_bytes(&key) else {
        return false;
    };
    let Ok(signature) = ed25519_dalek::Signature::from_slice(sig) else {
        return false;
    };
    verifying.verify(content, &signature).is_ok()
}

/// SHA-256 of `data`
pub fn hash_content(data: &[u8]) -> OpHash {
    OpHash(Sha256::digest(data).into())
}
