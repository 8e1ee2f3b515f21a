//! Data model: identifiers, enums, entities, canonical timestamps.

pub mod issue;
pub mod timefmt;
pub mod types;

pub use issue::{Comment, Dependency, Event, Issue, TombstoneEntry, RESURRECTION_MARKER};
pub use types::{
    DependencyKind, ErrorKind, EventKind, IssueId, IssueType, Priority, Status, ValidationError,
    ID_ALPHABET, RESERVED_PREFIXES,
};
