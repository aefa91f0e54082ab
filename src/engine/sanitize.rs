//! Payload sanitizer.
//!
//! Device-local columns (cached file paths, print flags, derived hashes)
//! exist only in the device schema. Sending them upstream would be a
//! schema error on the remote, so every outbound payload passes through
//! here first.

use crate::document::Document;
use crate::engine::tables;

/// Return a copy of `doc` with the table's local-only columns removed.
pub fn sanitize(table: &str, doc: &Document) -> Document {
    let local_only = tables::local_only_columns(table);
    if local_only.is_empty() {
        return doc.clone();
    }

    let mut out = doc.clone();
    for col in local_only {
        out.remove(col);
    }
    out
}

// ── Tests ───────────────────────────────────────────────────────
