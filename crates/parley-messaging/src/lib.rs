//! Conversation glue for end-to-end encrypted direct messages.
//!
//! [`Messenger`] is the surface a UI talks to. Underneath it the
//! [`IdentityKeyStore`] keeps each user's long-term key pair, the
//! [`SessionKeyManager`] establishes and repairs per-conversation session
//! keys, and the [`store`] traits abstract the shared document store, the
//! public key directory, and local device key storage.

pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod messenger;
pub mod session;
pub mod store;

pub use cache::SessionKeyCache;
pub use config::MessagingConfig;
pub use error::{MessagingError, StoreError};
pub use identity::IdentityKeyStore;
pub use messenger::{FeedHandle, Messenger};
pub use session::{SessionKeyManager, SessionState};
pub use store::{ConversationStore, DeviceKeyStore, KeyDirectory, MessageStream};
