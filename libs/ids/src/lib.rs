//! # quay-ids
//!
//! Stable ID types, parsing, and validation for the quay platform.
//!
//! ## Design Principles
//!
//! - IDs are stable and system-generated; names are derived labels
//! - All IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//! - IDs are typed to prevent mixing different resource types
//!
//! ## ID Format
//!
//! Node, project and user identities come from the surrounding platform as
//! plain UUIDs; `quay` wraps them in newtypes so a `NodeUuid` can never be
//! passed where a `ProjectId` is expected. Service names are derived from
//! the node UUID and are unique within one Docker Swarm.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
