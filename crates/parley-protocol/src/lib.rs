//! Parley data model shared by the crypto and messaging layers.
//!
//! These are the documents that live in the shared store: conversations,
//! session key records (wrapped keys only) and message records whose text is
//! replaced by an encrypted envelope.

pub mod codec;
pub mod error;
pub mod types;

pub use error::ProtocolError;
pub use types::*;
