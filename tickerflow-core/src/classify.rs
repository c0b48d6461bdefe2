//! Sentinel detection for remote responses.

/// Body the remote source returns when it has no data for an entity.
pub const EMPTY_SENTINEL: &[u8] = b"None";

/// A successful fetch body, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// The entity has no data.
    Empty,
    /// Real CSV payload.
    Payload(Vec<u8>),
}

/// Classify a raw body. Only an exact `None` body counts as empty.
pub fn classify(body: Vec<u8>) -> Classified {
    if is_empty_response(&body) {
        Classified::Empty
    } else {
        Classified::Payload(body)
    }
}

pub fn is_empty_response(body: &[u8]) -> bool {
    body == EMPTY_SENTINEL
}
