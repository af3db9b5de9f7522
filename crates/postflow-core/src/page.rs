//! Cursor-paginated query results.

/// One page of a paginated range query.
///
/// `next_cursor` is an opaque continuation key; `None` means the range is
/// exhausted. A page may hold fewer items than requested (even zero) while a
/// cursor is still present, because filters are applied after the raw scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items in this page.
    pub items: Vec<T>,
    /// Continuation key for the next page.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// A final page with no continuation.
    #[must_use]
    pub const fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    /// Returns true if more pages follow.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self::last(Vec::new())
    }
}
