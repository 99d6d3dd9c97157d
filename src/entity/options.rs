use chrono::{DateTime, Utc};

/// Read options for single-entity fetches.
///
/// The default is the current, non-deleted version, served from the cache
/// when possible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub as_of: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub bypass_cache: bool,
    pub for_update: bool,
}

impl GetOptions {
    pub fn current() -> Self {
        Self::default()
    }

    /// Point-in-time view at `at`.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            as_of: Some(at),
            ..Self::default()
        }
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    /// Locking read; only meaningful inside a transaction.
    pub fn locking(mut self) -> Self {
        self.for_update = true;
        self
    }

    /// Whether a result for these options may be served from or written to the cache.
    pub(crate) fn cacheable(&self) -> bool {
        !self.bypass_cache && !self.for_update && self.as_of.is_none()
    }
}

/// Options for a raw version insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOptions {
    /// Write the version as a tombstone.
    pub removed: bool,
}
