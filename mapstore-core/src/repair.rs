//! Link validation shared by the tree indexes.
//!
//! Tree links on disk are plain `i32` record numbers. Every link is checked
//! here before it is followed, so the "a node must not point at itself"
//! repair lives in exactly one place.

use crate::store::RecordNo;
use log::warn;

/// Outcome of validating a stored link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// No child stored (negative marker)
    Empty,

    /// Valid child record
    Child(RecordNo),

    /// The node references itself; treat as empty
    SelfCycle,

    /// The link points past the end of the file; treat as empty
    Dangling(RecordNo),
}

impl Link {
    /// Returns the child record if the link may be followed
    #[must_use]
    pub fn child(self) -> Option<RecordNo> {
        match self {
            Link::Child(record) => Some(record),
            _ => None,
        }
    }
}

/// Classifies `link`, stored in record `owner` of an index named `index`.
///
/// Self references and links past `record_count` are logged as repairs and
/// reported as unusable. Nothing is written back; callers that rewrite the
/// slot anyway (inserts) fix the record as a side effect.
pub fn check_link(index: &str, owner: RecordNo, link: i32, record_count: RecordNo) -> Link {
    let Ok(child) = RecordNo::try_from(link) else {
        return Link::Empty;
    };

    if child == owner {
        warn!("{}: record {} references itself (cycle), treating link as empty", index, owner);
        return Link::SelfCycle;
    }

    if child >= record_count {
        warn!(
            "{}: record {} links to {} beyond record count {}, treating link as empty",
            index, owner, child, record_count
        );
        return Link::Dangling(child);
    }

    Link::Child(child)
}

/// Shorthand for `check_link(..).child()`
pub fn follow_link(
    index: &str,
    owner: RecordNo,
    link: i32,
    record_count: RecordNo,
) -> Option<RecordNo> {
    check_link(index, owner, link, record_count).child()
}
