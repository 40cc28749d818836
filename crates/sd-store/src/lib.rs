//! sd-store: tolerance-based key -> index stores for parameter and
//! concentration vectors.
//!
//! A store maps numeric vectors to stable indices. Lookups are fuzzy: two
//! vectors equal within the store's [`Tolerances`](sd_core::Tolerances) share
//! one index, and a lookup never creates a second index for a vector that is
//! within tolerance of an existing entry.

pub mod file_store;

use std::path::PathBuf;

pub use file_store::{FileParameterStore, StoreLayout};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store integrity violated at {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("Index {index} out of range (store holds {len} values)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Invalid value: {0}")]
    Invalid(#[from] sd_core::CoreError),
}

/// Fuzzy key -> index store.
pub trait ParameterStore {
    /// Index of the stored vector equal (within tolerance) to `value`, adding
    /// `value` as a new entry when none matches.
    fn get_or_add_index(&self, value: &[f64]) -> StoreResult<usize>;

    /// Index of the stored vector equal (within tolerance) to `value`.
    fn index(&self, value: &[f64]) -> StoreResult<Option<usize>>;

    fn get_value(&self, index: usize) -> StoreResult<Vec<f64>>;

    /// Indices of the stored vectors of the same length as `value`, nearest
    /// first by Euclidean distance. Ties keep index order.
    fn indices_by_distance(&self, value: &[f64]) -> StoreResult<Vec<usize>>;

    /// Nearest stored vector by Euclidean distance, ignoring tolerance.
    fn closest_index(&self, value: &[f64]) -> StoreResult<Option<usize>> {
        Ok(self.indices_by_distance(value)?.first().copied())
    }

    /// Files holding the stored value of `index`.
    fn value_files(&self, index: usize) -> StoreResult<Vec<PathBuf>>;

    fn len(&self) -> StoreResult<usize>;

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Lazy sequence over all stored values in index order. Each call starts
    /// a fresh pass, so the sequence can be restarted at will.
    fn all_values(&self) -> StoreResult<AllValues<'_, Self>> {
        Ok(AllValues {
            store: self,
            next: 0,
            len: self.len()?,
        })
    }

    fn check_integrity(&self) -> StoreResult<()>;
}

/// Iterator returned by [`ParameterStore::all_values`]; values are read on
/// demand.
pub struct AllValues<'a, S: ?Sized> {
    store: &'a S,
    next: usize,
    len: usize,
}

impl<S: ParameterStore + ?Sized> Iterator for AllValues<'_, S> {
    type Item = StoreResult<Vec<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.store.get_value(index))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.next;
        (remaining, Some(remaining))
    }
}
