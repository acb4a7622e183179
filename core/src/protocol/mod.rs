//! Wire protocol module
//!
//! This module provides:
//! - Frame headers and the length-prefixed frame codec
//! - JSON bodies for the user API and for anti-entropy
//! - The user request handler
//! - The anti-entropy engine and the global operation pool

pub mod api;
pub mod codec;
pub mod dto;
pub mod engine;
pub mod message;
pub mod pool;

pub use codec::FrameCodec;
pub use engine::{AntiEntropyEngine, PeerId};
pub use message::{Message, MessageHeader};
pub use pool::MessagePool;
