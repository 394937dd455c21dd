//! Opaque identifier generation and validation.
//!
//! All identifiers in the data model are opaque strings of at most 64
//! printable characters. Generated ids are hyphen-less UUIDv4, which keeps
//! them path- and SQL-safe.

use uuid::Uuid;

/// Maximum length of any identifier in the data model.
pub const MAX_ID_LEN: usize = 64;

/// Generates a fresh collision-resistant identifier.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether `id` is acceptable as an identifier: non-empty, at most
/// [`MAX_ID_LEN`] bytes, printable ASCII without path separators.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b'/' && b != b'\\')
}
