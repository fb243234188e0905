//! Common types and errors for Trek
//!
//! This crate provides the syncable data model shared by the sync engine,
//! the CLI and the test helpers: trips, families, memberships, games and
//! competitions, plus the sync bookkeeping every one of them carries.

pub mod clock;
pub mod entity;
pub mod family;
pub mod game;
pub mod sanitizer;
pub mod telemetry;
pub mod trip;

pub use clock::Clock;
pub use entity::{ChangeType, Entity, EntityKey, EntityKind, SyncMeta, SyncStatus, SyncTransition};
pub use family::{Family, FamilyMember, InvitationStatus, MemberRole};
pub use game::{Competition, Game};
pub use trip::{FoundRegion, GeoLocation, InputMethod, Trip, TripSettings};

use thiserror::Error;

/// Core error types for Trek model operations
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid sync transition: {event:?} from {from:?}")]
    InvalidTransition {
        from: SyncStatus,
        event: SyncTransition,
    },

    #[error("Remote id already bound to {existing}, refusing {attempted}")]
    RemoteIdRebind { existing: String, attempted: String },

    #[error("Unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CommonError>;

/// Generate a new local identity for an entity.
///
/// Local ids are stable across devices once synced: a remote-origin entity
/// is instantiated with the id recorded in its document.
pub fn new_local_id() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Exit code constants
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids_are_unique() {
        let a = new_local_id();
        let b = new_local_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
