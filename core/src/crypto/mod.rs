//! Cryptographic primitives module
//!
//! This module provides:
//! - Ed25519 signing and verification
//! - Signed payload layout (`public_key || signature || content`)
//! - Content hashing (SHA-256)

pub mod signing;

pub use signing::{hash_content, payload_author, verify_payload, Keypair, PublicKey};
