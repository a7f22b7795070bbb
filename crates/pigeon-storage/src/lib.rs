//! Durable storage for the Pigeon mesh runtime.
//!
//! A single sled database holds three trees:
//!
//! - `identity` — device id, display name, onboarding flag.
//! - `messages` — the message log snapshot, one key.
//! - `uploader` — the synced-id set and collector endpoint.
//!
//! All writes are snapshot-style and idempotent: every mutation rewrites
//! the value under its key, so a crash between writes leaves the previous
//! consistent snapshot in place.

pub mod engine;
pub mod identity;
pub mod messages;
pub mod uploader;

pub use engine::StorageEngine;
pub use identity::IdentityStore;
pub use messages::MessageLog;
pub use uploader::UploaderStore;
