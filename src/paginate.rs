//! Pagination for large result enumerations
//!
//! Listings over host documents can be large and the source is externally
//! mutable: individual entries may be malformed or fail property access.
//! `paginate` therefore takes an iterator of per-item `Result`s, skips
//! faulty items with a warning, and windows the rest.

use serde::Serialize;
use tracing::warn;

/// One page of a listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Items that matched (after fault isolation), across the whole source.
    pub total: usize,
    /// Items actually present in this page.
    pub returned: usize,
    pub offset: usize,
    /// The clamped limit that was applied.
    pub limit: usize,
}

/// Window `items` to `[offset, offset + limit)`.
///
/// `limit` is clamped to `max_limit` regardless of the caller's request.
/// The source is iterated exactly once: `total` counts every healthy item,
/// skipping continues past `offset`, and collection stops after `limit`
/// items (counting alone continues to the end). A faulty item is logged
/// and skipped; it does not abort the listing and does not count toward
/// `total`.
pub fn paginate<I, T, E>(items: I, offset: usize, limit: usize, max_limit: usize) -> Page<T>
where
    I: IntoIterator<Item = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let limit = limit.min(max_limit);
    let mut page = Vec::new();
    let mut total = 0usize;

    for item in items {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                warn!("Skipping malformed listing entry: {}", e);
                continue;
            }
        };

        if total >= offset && page.len() < limit {
            page.push(item);
        }
        total += 1;
    }

    Page {
        returned: page.len(),
        items: page,
        total,
        offset,
        limit,
    }
}
