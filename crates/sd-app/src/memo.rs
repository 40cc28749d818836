//! Versioned inputs and the derived values computed from them.
//!
//! Every option group of a model is a [`Versioned`] value whose version is
//! bumped whenever it changes. A [`Memo`] remembers the versions its value
//! was computed from and is stale as soon as any of them moved on.

#[derive(Debug, Clone)]
pub struct Versioned<T> {
    value: T,
    version: u64,
}

impl<T: PartialEq> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self { value, version: 0 }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replace the value. Setting an equal value keeps the version.
    pub fn set(&mut self, value: T) {
        if value != self.value {
            self.value = value;
            self.version += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Memo<T> {
    cached: Option<(Vec<u64>, T)>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self { cached: None }
    }
}

impl<T> Memo<T> {
    /// Cached value if it was computed from exactly these input versions.
    pub fn get(&self, versions: &[u64]) -> Option<&T> {
        match &self.cached {
            Some((seen, value)) if seen.as_slice() == versions => Some(value),
            _ => None,
        }
    }

    pub fn store(&mut self, versions: &[u64], value: T) {
        self.cached = Some((versions.to_vec(), value));
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}
