//! Declared catalog of synced tables.
//!
//! Foreign-key dependency order, local-only columns, FK parent links and
//! timestamp invariants all live here as one reviewable artifact instead
//! of being scattered through the push/pull paths. Parents appear before
//! children; both engines iterate this order.

/// Synced tables, parents first. The pull engine walks this order; the
/// push engine stable-sorts outbox entries by position in it.
pub const SYNC_TABLES: &[&str] = &[
    "users",
    "categories",
    "products",
    "expenses",
    "settlements",
    "carts",
    "cart_items",
];

/// Foreign-key links: (child table, fk column, parent table).
///
/// Drives two things: recovering a missing parent during push, and
/// knowing which column to inspect when normalizing a pulled row.
pub const FK_LINKS: &[(&str, &str, &str)] = &[
    ("products", "category_id", "categories"),
    ("expenses", "user_id", "users"),
    ("settlements", "user_id", "users"),
    ("carts", "user_id", "users"),
    ("cart_items", "cart_id", "carts"),
    ("cart_items", "product_id", "products"),
];

/// Device-local columns that must never reach the remote schema.
pub const LOCAL_ONLY_COLUMNS: &[(&str, &[&str])] = &[
    ("products", &["local_image_path", "needs_label_print"]),
    ("carts", &["is_open_locally"]),
    ("users", &["cached_pin_hash"]),
];

/// Tables whose rows must carry both the numeric epoch and the ISO
/// timestamp. Push backfills missing stamps before sending.
pub const TIMESTAMP_PAIR_TABLES: &[&str] = &["carts", "settlements"];

/// Dependency rank of a table; unknown tables sort after all known ones
/// and keep their relative order (the push sort is stable).
pub fn rank(table: &str) -> usize {
    SYNC_TABLES
        .iter()
        .position(|t| *t == table)
        .unwrap_or(SYNC_TABLES.len())
}

/// The FK column on `child` that references `parent`, if declared.
pub fn fk_column_for(child: &str, parent: &str) -> Option<&'static str> {
    FK_LINKS
        .iter()
        .find(|(c, _, p)| *c == child && *p == parent)
        .map(|(_, col, _)| *col)
}

/// All FK links outgoing from `child`.
pub fn fk_links_of(child: &str) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
    FK_LINKS
        .iter()
        .filter(move |(c, _, _)| *c == child)
        .map(|(_, col, parent)| (*col, *parent))
}

/// Local-only columns of a table (empty for most).
pub fn local_only_columns(table: &str) -> &'static [&'static str] {
    LOCAL_ONLY_COLUMNS
        .iter()
        .find(|(t, _)| *t == table)
        .map(|(_, cols)| *cols)
        .unwrap_or(&[])
}

pub fn requires_timestamp_pair(table: &str) -> bool {
    TIMESTAMP_PAIR_TABLES.contains(&table)
}

// ── Tests ───────────────────────────────────────────────────────
