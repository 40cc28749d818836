//! File-backed parameter store.
//!
//! The store keeps an ordered lookup file for fast fuzzy matching and one
//! entry directory per index holding the value files. Entry directories are
//! also the identity directories other runs are stored under.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use sd_core::{
    CoreError, Tolerances, ensure_all_finite, euclidean_distance, round_to_decimals,
    vectors_nearly_equal,
};

use crate::{ParameterStore, StoreError, StoreResult};

/// Where a store keeps its lookup file and entries.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreLayout {
    pub root: PathBuf,
    pub lookup_file_name: String,
    pub entry_prefix: String,
    pub entry_width: usize,
    /// Stored values are split evenly across these files, in order.
    pub value_file_names: Vec<String>,
}

impl StoreLayout {
    pub fn entry_dirname(&self, index: usize) -> String {
        format!(
            "{}{:0width$}",
            self.entry_prefix,
            index,
            width = self.entry_width
        )
    }

    pub fn entry_dir(&self, index: usize) -> PathBuf {
        self.root.join(self.entry_dirname(index))
    }

    pub fn lookup_file(&self) -> PathBuf {
        self.root.join(&self.lookup_file_name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LookupFile {
    values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct FileParameterStore {
    layout: StoreLayout,
    tolerance: Tolerances,
    reliable_decimal_places: u32,
}

impl FileParameterStore {
    pub fn new(layout: StoreLayout, tolerance: Tolerances, reliable_decimal_places: u32) -> Self {
        Self {
            layout,
            tolerance,
            reliable_decimal_places,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn entry_dir(&self, index: usize) -> PathBuf {
        self.layout.entry_dir(index)
    }

    /// `true` when the store has been created on disk.
    pub fn exists(&self) -> bool {
        self.layout.lookup_file().exists()
    }

    fn load_lookup(&self) -> StoreResult<LookupFile> {
        let path = self.layout.lookup_file();
        if !path.exists() {
            return Ok(LookupFile::default());
        }
        let content = fs::read_to_string(&path)?;
        let lookup = serde_json::from_str(&content).map_err(|e| StoreError::Integrity {
            path: path.clone(),
            reason: format!("unreadable lookup file: {e}"),
        })?;
        Ok(lookup)
    }

    fn save_lookup(&self, lookup: &LookupFile) -> StoreResult<()> {
        write_atomic(&self.layout.lookup_file(), &serde_json::to_string(lookup)?)
    }

    fn normalize(&self, value: &[f64]) -> StoreResult<Vec<f64>> {
        if value.is_empty() {
            return Err(CoreError::invalid("stored value", "must not be empty").into());
        }
        ensure_all_finite(value, "stored value")?;
        let files = self.layout.value_file_names.len();
        if files > 0 && value.len() % files != 0 {
            return Err(CoreError::invalid(
                "stored value",
                format!(
                    "length {} cannot be split evenly across {} value files",
                    value.len(),
                    files
                ),
            )
            .into());
        }
        Ok(value
            .iter()
            .map(|&v| round_to_decimals(v, self.reliable_decimal_places))
            .collect())
    }

    fn find(&self, lookup: &LookupFile, value: &[f64]) -> Option<usize> {
        lookup
            .values
            .iter()
            .position(|stored| vectors_nearly_equal(stored, value, self.tolerance))
    }

    fn write_value_files(&self, index: usize, value: &[f64]) -> StoreResult<()> {
        let entry_dir = self.entry_dir(index);
        fs::create_dir_all(&entry_dir)?;
        let names = &self.layout.value_file_names;
        if names.is_empty() {
            return Ok(());
        }
        let chunk = value.len() / names.len();
        for (name, segment) in names.iter().zip(value.chunks(chunk)) {
            write_atomic(&entry_dir.join(name), &serde_json::to_string(segment)?)?;
        }
        Ok(())
    }

    fn read_value_files(&self, index: usize) -> StoreResult<Vec<f64>> {
        let mut value = Vec::new();
        for path in self.value_files(index)? {
            let content = fs::read_to_string(&path)?;
            let segment: Vec<f64> =
                serde_json::from_str(&content).map_err(|e| StoreError::Integrity {
                    path: path.clone(),
                    reason: format!("unreadable value file: {e}"),
                })?;
            value.extend(segment);
        }
        Ok(value)
    }

    fn integrity_error(&self, path: PathBuf, reason: String) -> StoreError {
        error!(path = %path.display(), %reason, "parameter store integrity violated");
        StoreError::Integrity { path, reason }
    }
}

impl ParameterStore for FileParameterStore {
    fn get_or_add_index(&self, value: &[f64]) -> StoreResult<usize> {
        let value = self.normalize(value)?;
        let mut lookup = self.load_lookup()?;
        if let Some(index) = self.find(&lookup, &value) {
            debug!(index, root = %self.layout.root.display(), "value found in store");
            return Ok(index);
        }

        let index = lookup.values.len();
        self.write_value_files(index, &value)?;
        lookup.values.push(value);
        self.save_lookup(&lookup)?;
        debug!(index, root = %self.layout.root.display(), "value added to store");
        Ok(index)
    }

    fn index(&self, value: &[f64]) -> StoreResult<Option<usize>> {
        let value = self.normalize(value)?;
        let lookup = self.load_lookup()?;
        Ok(self.find(&lookup, &value))
    }

    fn get_value(&self, index: usize) -> StoreResult<Vec<f64>> {
        let len = self.len()?;
        if index >= len {
            return Err(StoreError::IndexOutOfRange { index, len });
        }
        if self.layout.value_file_names.is_empty() {
            let mut lookup = self.load_lookup()?;
            return Ok(lookup.values.swap_remove(index));
        }
        self.read_value_files(index)
    }

    fn indices_by_distance(&self, value: &[f64]) -> StoreResult<Vec<usize>> {
        let lookup = self.load_lookup()?;
        let mut distances: Vec<(usize, f64)> = lookup
            .values
            .iter()
            .enumerate()
            .filter(|(_, stored)| stored.len() == value.len())
            .map(|(index, stored)| (index, euclidean_distance(stored, value)))
            .collect();
        distances.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(distances.into_iter().map(|(index, _)| index).collect())
    }

    fn value_files(&self, index: usize) -> StoreResult<Vec<PathBuf>> {
        let entry_dir = self.entry_dir(index);
        Ok(self
            .layout
            .value_file_names
            .iter()
            .map(|name| entry_dir.join(name))
            .collect())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.load_lookup()?.values.len())
    }

    fn check_integrity(&self) -> StoreResult<()> {
        let lookup_path = self.layout.lookup_file();
        let lookup = self.load_lookup()?;
        let exact = Tolerances {
            abs: 10f64.powi(-(self.reliable_decimal_places as i32)),
            rel: 0.0,
        };

        for (index, stored) in lookup.values.iter().enumerate() {
            if stored.iter().any(|v| !v.is_finite()) {
                return Err(self.integrity_error(
                    lookup_path.clone(),
                    format!("entry {index} holds a non-finite value"),
                ));
            }
            let entry_dir = self.entry_dir(index);
            if !entry_dir.is_dir() {
                return Err(self.integrity_error(entry_dir, format!("entry {index} has no directory")));
            }
            for path in self.value_files(index)? {
                if !path.is_file() {
                    return Err(self.integrity_error(path, format!("value file of entry {index} is missing")));
                }
            }
            if !self.layout.value_file_names.is_empty() {
                let on_disk = self.read_value_files(index)?;
                if !vectors_nearly_equal(&on_disk, stored, exact) {
                    return Err(self.integrity_error(
                        entry_dir,
                        format!("value files of entry {index} differ from the lookup file"),
                    ));
                }
            }
            if let Some(duplicate) = lookup.values[..index]
                .iter()
                .position(|other| vectors_nearly_equal(other, stored, self.tolerance))
            {
                return Err(self.integrity_error(
                    lookup_path.clone(),
                    format!("entries {duplicate} and {index} are equal within tolerance"),
                ));
            }
        }
        debug!(root = %self.layout.root.display(), entries = lookup.values.len(), "store integrity checked");
        Ok(())
    }
}

/// Write through a sibling temporary file and rename, so readers never see a
/// partially written file.
pub(crate) fn write_atomic(path: &Path, content: &str) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
